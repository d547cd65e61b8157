// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Observation context: the pinhole frame, its header, and the per-arm
//! detector metadata the core needs.
//!
//! Everything here is read once and treated as immutable for the rest of the
//! run. Pixel coordinates throughout the crate are in the detector's
//! science-pixel frame; trimming pre-scan and overscan is the caller's job.

mod error;

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use fitsio::hdu::HduInfo;
use fitsio::FitsFile;
use itertools::izip;
use log::warn;
use ndarray::Array2;
use serde::Deserialize;
use strum_macros::{Display as EnumDisplay, EnumString};

pub use error::ContextError;

use crate::constants::{
    KW_ARM, KW_BINX, KW_BINY, KW_DATE_OBS, KW_DPR_TECH, KW_INSTRUME, TECH_MULTI_PINHOLE,
    TECH_SINGLE_PINHOLE,
};

/// One of the spectrograph's optical channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumDisplay, EnumString, Deserialize)]
#[strum(ascii_case_insensitive, serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Arm {
    Uvb,
    Vis,
    Nir,
}

/// Single- vs multi-pinhole exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumDisplay)]
pub enum PinholeMode {
    #[strum(serialize = "single")]
    Single,
    #[strum(serialize = "multi")]
    Multi,
}

impl PinholeMode {
    /// The DPR/PRO technique keyword value for this mode.
    pub fn technique(self) -> &'static str {
        match self {
            PinholeMode::Single => TECH_SINGLE_PINHOLE,
            PinholeMode::Multi => TECH_MULTI_PINHOLE,
        }
    }

    pub fn from_technique(technique: &str) -> Option<PinholeMode> {
        match technique.trim() {
            TECH_SINGLE_PINHOLE => Some(PinholeMode::Single),
            TECH_MULTI_PINHOLE => Some(PinholeMode::Multi),
            _ => None,
        }
    }
}

/// Detector binning, e.g. 1x1 or 2x2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binning {
    pub x: u32,
    pub y: u32,
}

impl Default for Binning {
    fn default() -> Self {
        Binning { x: 1, y: 1 }
    }
}

impl fmt::Display for Binning {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.x, self.y)
    }
}

/// A typed FITS header value.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

/// One header card: key, value and optional comment. ESO hierarch keys are
/// stored without the `HIERARCH` prefix (e.g. `ESO DPR TECH`).
#[derive(Debug, Clone)]
pub struct HeaderCard {
    pub key: String,
    pub value: HeaderValue,
    pub comment: Option<String>,
}

/// An ordered copy of a frame's primary header.
///
/// cfitsio only exposes key lookup by name, so the full ordered card list is
/// lifted from the raw 2880-byte header blocks instead; numeric image data
/// still goes through cfitsio.
#[derive(Debug, Clone, Default)]
pub struct FrameHeader {
    cards: Vec<HeaderCard>,
}

/// Keys that describe HDU structure rather than observation metadata; they
/// are never copied into product headers.
const STRUCTURAL_KEYS: &[&str] = &[
    "SIMPLE", "BITPIX", "EXTEND", "XTENSION", "PCOUNT", "GCOUNT", "BSCALE", "BZERO", "CHECKSUM",
    "DATASUM", "EXTNAME",
];

impl FrameHeader {
    pub fn new() -> FrameHeader {
        FrameHeader { cards: vec![] }
    }

    /// Read the primary header of `path` from its raw 2880-byte blocks.
    pub fn read_primary<P: AsRef<Path>>(path: P) -> Result<FrameHeader, ContextError> {
        let file_str = path.as_ref().display().to_string();
        let mut file = File::open(path.as_ref()).map_err(|err| ContextError::Io {
            file: file_str.clone(),
            err,
        })?;

        let mut cards = vec![];
        let mut block = [0_u8; 2880];
        'blocks: loop {
            file.read_exact(&mut block).map_err(|err| ContextError::Io {
                file: file_str.clone(),
                err,
            })?;
            for chunk in block.chunks(80) {
                let card = String::from_utf8_lossy(chunk);
                let card = card.as_ref();
                if card.starts_with("END") && card[3..].trim().is_empty() {
                    break 'blocks;
                }
                if let Some(parsed) = parse_card(card) {
                    cards.push(parsed);
                }
            }
        }
        Ok(FrameHeader { cards })
    }

    pub fn cards(&self) -> impl Iterator<Item = &HeaderCard> {
        self.cards.iter()
    }

    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.cards.iter().find(|c| c.key == key).map(|c| &c.value)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(HeaderValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(HeaderValue::Int(i)) => Some(*i),
            _ => None,
        }
    }

    /// Append or replace a card, preserving position on replace.
    pub fn set(&mut self, key: &str, value: HeaderValue, comment: Option<&str>) {
        let comment = comment.map(|c| c.to_string());
        match self.cards.iter_mut().find(|c| c.key == key) {
            Some(card) => {
                card.value = value;
                card.comment = comment;
            }
            None => self.cards.push(HeaderCard {
                key: key.to_string(),
                value,
                comment,
            }),
        }
    }

    pub fn set_str(&mut self, key: &str, value: &str, comment: Option<&str>) {
        self.set(key, HeaderValue::Str(value.to_string()), comment);
    }

    /// Remove a card by key. Missing keys are tolerated.
    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.cards.len();
        self.cards.retain(|c| c.key != key);
        self.cards.len() != before
    }

    /// Remove every card whose key starts with `prefix`.
    pub fn remove_with_prefix(&mut self, prefix: &str) {
        self.cards.retain(|c| !c.key.starts_with(prefix));
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

/// Parse one 80-character header card. Returns `None` for commentary,
/// structural and blank cards.
fn parse_card(card: &str) -> Option<HeaderCard> {
    let (key, rest) = if let Some(hierarch) = card.strip_prefix("HIERARCH ") {
        let eq = hierarch.find('=')?;
        (hierarch[..eq].trim().to_string(), &hierarch[eq + 1..])
    } else {
        let keyword = card.get(..8)?.trim();
        if keyword.is_empty() || keyword == "COMMENT" || keyword == "HISTORY" {
            return None;
        }
        if !card[8..].starts_with("= ") {
            return None;
        }
        (keyword.to_string(), &card[10..])
    };

    if STRUCTURAL_KEYS.contains(&key.as_str()) || key == "NAXIS" || key.starts_with("NAXIS") {
        return None;
    }

    let rest = rest.trim();
    let (value, comment) = if let Some(stripped) = rest.strip_prefix('\'') {
        // A string value; the comment starts after the closing quote.
        let close = stripped.find('\'')?;
        let value = HeaderValue::Str(stripped[..close].trim_end().to_string());
        let tail = stripped[close + 1..].trim();
        let comment = tail.strip_prefix('/').map(|c| c.trim().to_string());
        (value, comment)
    } else {
        let (raw, comment) = match rest.find('/') {
            Some(slash) => (
                rest[..slash].trim(),
                Some(rest[slash + 1..].trim().to_string()),
            ),
            None => (rest, None),
        };
        let value = match raw {
            "T" => HeaderValue::Bool(true),
            "F" => HeaderValue::Bool(false),
            _ => {
                if let Ok(i) = raw.parse::<i64>() {
                    HeaderValue::Int(i)
                } else if let Ok(f) = raw.parse::<f64>() {
                    HeaderValue::Float(f)
                } else {
                    HeaderValue::Str(raw.to_string())
                }
            }
        };
        (value, comment)
    };

    Some(HeaderCard {
        key,
        value,
        comment,
    })
}

/// A calibrated pinhole frame: data, uncertainty, bad-pixel mask and header.
/// Read-only to the core.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Array2<f64>,
    pub err: Array2<f64>,
    /// `true` marks a bad pixel.
    pub mask: Array2<bool>,
    pub header: FrameHeader,
}

impl Frame {
    /// Load a prepared frame: primary image data plus optional `ERRS` and
    /// `QUAL` extensions. A missing uncertainty or quality extension is
    /// tolerated (zero uncertainty, all pixels good) with a warning.
    pub fn from_fits<P: AsRef<Path>>(path: P) -> Result<Frame, ContextError> {
        let file_str = path.as_ref().display().to_string();
        let mut fits = FitsFile::open(path.as_ref()).map_err(|err| ContextError::Fits {
            file: file_str.clone(),
            err,
        })?;

        let data = read_image_hdu(&mut fits, &file_str, None)?;
        let (height, width) = data.dim();

        let err = match read_image_hdu(&mut fits, &file_str, Some("ERRS")) {
            Ok(err) => err,
            Err(_) => {
                warn!("{file_str} has no ERRS extension; assuming zero uncertainty");
                Array2::zeros((height, width))
            }
        };
        let mask = match read_image_hdu(&mut fits, &file_str, Some("QUAL")) {
            Ok(qual) => qual.mapv(|v| v != 0.0),
            Err(_) => {
                warn!("{file_str} has no QUAL extension; assuming all pixels good");
                Array2::from_elem((height, width), false)
            }
        };

        let header = FrameHeader::read_primary(path.as_ref())?;
        Ok(Frame {
            data,
            err,
            mask,
            header,
        })
    }

    /// (height, width) of the science-pixel image.
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    fn require_str(&self, key: &str) -> Result<&str, ContextError> {
        self.header
            .get_str(key)
            .ok_or_else(|| ContextError::MissingKey {
                file: "frame header".to_string(),
                key: key.to_string(),
            })
    }

    pub fn instrument(&self) -> Result<&str, ContextError> {
        self.require_str(KW_INSTRUME)
    }

    pub fn date_obs(&self) -> Result<&str, ContextError> {
        self.require_str(KW_DATE_OBS)
    }

    pub fn arm(&self) -> Result<Arm, ContextError> {
        let raw = self.require_str(KW_ARM)?;
        raw.parse().map_err(|_| ContextError::BadArm {
            got: raw.to_string(),
        })
    }

    /// The frame's pinhole technique, validated. Anything other than the two
    /// pinhole techniques is an input error.
    pub fn pinhole_mode(&self) -> Result<PinholeMode, ContextError> {
        let technique = self.require_str(KW_DPR_TECH)?;
        PinholeMode::from_technique(technique).ok_or_else(|| ContextError::UnexpectedTechnique {
            got: technique.to_string(),
        })
    }

    /// Detector binning; 1x1 when the header carries no binning keys (the
    /// NIR detector is never binned).
    pub fn binning(&self) -> Binning {
        match (self.header.get_int(KW_BINX), self.header.get_int(KW_BINY)) {
            (Some(x), Some(y)) => Binning {
                x: x as u32,
                y: y as u32,
            },
            _ => Binning::default(),
        }
    }
}

/// Read one image HDU (primary when `ext` is `None`) into a 2D f64 array.
fn read_image_hdu(
    fits: &mut FitsFile,
    file: &str,
    ext: Option<&str>,
) -> Result<Array2<f64>, ContextError> {
    let hdu = match ext {
        None => fits.primary_hdu(),
        Some(name) => fits.hdu(name),
    }
    .map_err(|err| ContextError::Fits {
        file: file.to_string(),
        err,
    })?;

    // fitsio reports image shape row-major, matching ndarray's (rows, cols).
    let (height, width) = match &hdu.info {
        HduInfo::ImageInfo { shape, .. } if shape.len() == 2 => (shape[0], shape[1]),
        _ => {
            return Err(ContextError::BadHdu {
                file: file.to_string(),
                hdu: ext.unwrap_or("primary").to_string(),
                expected: "2D image",
            })
        }
    };

    let data: Vec<f64> = hdu.read_image(fits).map_err(|err| ContextError::Fits {
        file: file.to_string(),
        err,
    })?;
    if data.len() != height * width {
        return Err(ContextError::BadShape {
            file: file.to_string(),
            got: data.len(),
            expected: height * width,
        });
    }
    Array2::from_shape_vec((height, width), data).map_err(|_| ContextError::BadShape {
        file: file.to_string(),
        got: 0,
        expected: height * width,
    })
}

/// Which detector axis carries dispersion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispersionAxis {
    X,
    Y,
}

/// An inclusive-exclusive pixel range.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PixelRange {
    pub start: usize,
    pub end: usize,
}

impl PixelRange {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The science-pixel window of the detector.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SciencePixels {
    pub rows: PixelRange,
    pub columns: PixelRange,
}

/// Static per-arm geometry and calibration-file paths, loaded once per run
/// from a YAML lookup.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorProfile {
    pub arm: Arm,
    pub science_pixels: SciencePixels,
    /// Slit length \[arcsec\].
    pub slit_length: f64,
    /// The slit index of the centre pinhole.
    pub mid_slit_index: i32,
    pub dispersion_axis: DispersionAxis,
    /// Predicted-line catalogue paths, keyed by pinhole mode then binning
    /// (e.g. "1x1").
    pub predicted_lines: PredictedLinePaths,
    /// Path to the spectral-format table for this arm.
    pub spectral_format: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictedLinePaths {
    pub single: BTreeMap<String, PathBuf>,
    pub multi: BTreeMap<String, PathBuf>,
}

impl DetectorProfile {
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<DetectorProfile, ContextError> {
        let file_str = path.as_ref().display().to_string();
        let file = File::open(path.as_ref()).map_err(|err| ContextError::Io {
            file: file_str.clone(),
            err,
        })?;
        serde_yaml::from_reader(file).map_err(|err| ContextError::ProfileParse {
            file: file_str,
            err,
        })
    }

    /// Width of the science-pixel image.
    pub fn width(&self) -> usize {
        self.science_pixels.columns.len()
    }

    /// Height of the science-pixel image.
    pub fn height(&self) -> usize {
        self.science_pixels.rows.len()
    }

    /// The predicted-line catalogue registered for this mode and binning.
    pub fn predicted_lines_path(
        &self,
        mode: PinholeMode,
        binning: Binning,
    ) -> Result<&Path, ContextError> {
        let table = match mode {
            PinholeMode::Single => &self.predicted_lines.single,
            PinholeMode::Multi => &self.predicted_lines.multi,
        };
        table
            .get(&binning.to_string())
            .map(PathBuf::as_path)
            .ok_or_else(|| ContextError::NoCatalogueForBinning {
                mode: mode.to_string(),
                binning: binning.to_string(),
            })
    }
}

/// One order's wavelength coverage from the spectral-format table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderRange {
    pub order: i32,
    pub wl_min: f64,
    pub wl_max: f64,
}

/// Read the spectral-format table: one row per order with its wavelength
/// limits. Column names are matched case-insensitively.
pub fn read_spectral_format<P: AsRef<Path>>(path: P) -> Result<Vec<OrderRange>, ContextError> {
    let file_str = path.as_ref().display().to_string();
    let mut fits = FitsFile::open(path.as_ref()).map_err(|err| ContextError::Fits {
        file: file_str.clone(),
        err,
    })?;
    let hdu = fits.hdu(1).map_err(|err| ContextError::Fits {
        file: file_str.clone(),
        err,
    })?;

    let order_col = resolve_column(&hdu.info, "order").ok_or_else(|| {
        ContextError::MissingColumn {
            file: file_str.clone(),
            column: "order".to_string(),
        }
    })?;
    let wlmin_col =
        resolve_column(&hdu.info, "wlmin").ok_or_else(|| ContextError::MissingColumn {
            file: file_str.clone(),
            column: "wlmin".to_string(),
        })?;
    let wlmax_col =
        resolve_column(&hdu.info, "wlmax").ok_or_else(|| ContextError::MissingColumn {
            file: file_str.clone(),
            column: "wlmax".to_string(),
        })?;

    let orders: Vec<i32> = hdu
        .read_col(&mut fits, &order_col)
        .map_err(|err| ContextError::Fits {
            file: file_str.clone(),
            err,
        })?;
    let wl_min: Vec<f64> = hdu
        .read_col(&mut fits, &wlmin_col)
        .map_err(|err| ContextError::Fits {
            file: file_str.clone(),
            err,
        })?;
    let wl_max: Vec<f64> =
        hdu.read_col(&mut fits, &wlmax_col)
            .map_err(|err| ContextError::Fits {
                file: file_str,
                err,
            })?;

    Ok(izip!(orders, wl_min, wl_max)
        .map(|(order, wl_min, wl_max)| OrderRange {
            order,
            wl_min,
            wl_max,
        })
        .collect())
}

/// Find a table column by case-insensitive name, returning the stored name.
pub(crate) fn resolve_column(info: &HduInfo, name: &str) -> Option<String> {
    match info {
        HduInfo::TableInfo {
            column_descriptions,
            ..
        } => column_descriptions
            .iter()
            .map(|c| c.name.clone())
            .find(|n| n.eq_ignore_ascii_case(name)),
        _ => None,
    }
}
