// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The fitted dispersion map and its on-disk format.
//!
//! A map is a pair of Chebyshev coefficient vectors, one per detector axis,
//! over a shared basis. On disk it is a FITS BINTABLE of two rows with
//! columns `axis`, `order-deg`, `wavelength-deg`, `slit-deg` and one column
//! per coefficient named `c{i}{j}{k}` in canonical order. The primary header
//! is a cleaned copy of the pinhole frame's header; the normalisation domains
//! ride along as keys on the table HDU so a read map evaluates bit-identically
//! to the freshly fitted one.

mod error;

use std::path::Path;

use fitsio::tables::{ColumnDataType, ColumnDescription};
use fitsio::FitsFile;
use log::{debug, info};

pub use error::{MapReadError, MapWriteError};

use crate::constants::{
    KW_ARM, KW_CONAD, KW_DET_READ_SPEED, KW_DPR_PREFIX, KW_GAIN, KW_PRO_CATG, KW_PRO_TECH,
    KW_PRO_TYPE, KW_RON,
};
use crate::context::{resolve_column, Arm, FrameHeader, HeaderValue, PinholeMode};
use crate::poly::{ChebyBasis, Domain, PolyError, SpectralRows};
use crate::qc::QcRecord;

/// Normalisation-domain keys written on the coefficient table HDU.
const NORM_KEYS: [(&str, &str); 6] = [
    ("NORMOMIN", "order domain minimum"),
    ("NORMOMAX", "order domain maximum"),
    ("NORMWMIN", "wavelength domain minimum"),
    ("NORMWMAX", "wavelength domain maximum"),
    ("NORMSMIN", "slit domain minimum"),
    ("NORMSMAX", "slit domain maximum"),
];

/// The forward model `(m, λ, s) → (x, y)`.
#[derive(Debug, Clone, PartialEq)]
pub struct DispersionMap {
    pub basis: ChebyBasis,
    pub xcoeffs: Vec<f64>,
    pub ycoeffs: Vec<f64>,
}

impl DispersionMap {
    /// A map with no slit dependence is a single-pinhole solution.
    pub fn pinhole_mode(&self) -> PinholeMode {
        if self.basis.slit_deg == 0 {
            PinholeMode::Single
        } else {
            PinholeMode::Multi
        }
    }

    /// Evaluate both axis polynomials at every row.
    pub fn evaluate(&self, rows: &SpectralRows) -> Result<(Vec<f64>, Vec<f64>), PolyError> {
        let fit_x = self.basis.evaluate(&self.xcoeffs, rows)?;
        let fit_y = self.basis.evaluate(&self.ycoeffs, rows)?;
        Ok((fit_x, fit_y))
    }
}

/// Build the product header: the frame header stripped of exposure-category
/// and per-amplifier electronic keys, restamped with the product category.
pub(crate) fn product_header(
    frame_header: &FrameHeader,
    arm: Arm,
    mode: PinholeMode,
    category: &str,
    qc: &[QcRecord],
) -> FrameHeader {
    let mut header = frame_header.clone();
    header.remove_with_prefix(KW_DPR_PREFIX);
    // Tolerated when absent.
    for key in [KW_DET_READ_SPEED, KW_CONAD, KW_GAIN, KW_RON] {
        header.remove(key);
    }
    header.set_str(KW_ARM, &arm.to_string(), None);
    header.set_str(KW_PRO_TYPE, "REDUCED", None);
    header.set_str(KW_PRO_CATG, &format!("{category}_{arm}"), None);
    header.set_str(KW_PRO_TECH, mode.technique(), None);

    for record in qc.iter().filter(|r| r.to_header) {
        header.set(
            &format!("ESO QC {}", record.name.to_uppercase()),
            record.value.to_header_value(),
            Some(&record.comment),
        );
    }
    header
}

/// Write one header card with the matching cfitsio type.
pub(crate) fn write_header_card(
    fits: &mut FitsFile,
    hdu: &fitsio::hdu::FitsHdu,
    key: &str,
    value: &HeaderValue,
) -> Result<(), fitsio::errors::Error> {
    match value {
        HeaderValue::Str(s) => hdu.write_key(fits, key, s.as_str()),
        HeaderValue::Int(i) => hdu.write_key(fits, key, *i),
        HeaderValue::Float(f) => hdu.write_key(fits, key, *f),
        // fitsio has no logical-key writer; the two-valued string is
        // understood by every FITS reader we care about.
        HeaderValue::Bool(b) => hdu.write_key(fits, key, if *b { "T" } else { "F" }),
    }
}

/// The canonical coefficient column names, `i` outermost and `k` innermost.
fn coefficient_names(basis: &ChebyBasis) -> Vec<String> {
    let mut names = Vec::with_capacity(basis.ncoeffs());
    for i in 0..=basis.order_deg {
        for j in 0..=basis.wavelength_deg {
            for k in 0..=basis.slit_deg {
                names.push(format!("c{i}{j}{k}"));
            }
        }
    }
    names
}

/// Serialise a fitted map. On any failure the partial file is removed; a
/// dispersion-map product either exists complete or not at all.
pub fn write_map(
    map: &DispersionMap,
    header: &FrameHeader,
    path: &Path,
) -> Result<(), MapWriteError> {
    let file_str = path.display().to_string();
    debug!("Writing dispersion map to {file_str}");
    if path.exists() {
        std::fs::remove_file(path).map_err(|err| MapWriteError::IO {
            file: file_str.clone(),
            err,
        })?;
    }

    // Remove the partial product unless the write runs to completion.
    let guard = scopeguard::guard((), |_| {
        let _ = std::fs::remove_file(path);
    });

    write_map_inner(map, header, path).map_err(|err| MapWriteError::Fits {
        file: file_str.clone(),
        err,
    })?;

    scopeguard::ScopeGuard::into_inner(guard);
    info!("Dispersion map written to {file_str}");
    Ok(())
}

fn write_map_inner(
    map: &DispersionMap,
    header: &FrameHeader,
    path: &Path,
) -> Result<(), fitsio::errors::Error> {
    let mut fits = FitsFile::create(path).open()?;
    let primary = fits.primary_hdu()?;
    for card in header.cards() {
        write_header_card(&mut fits, &primary, &card.key, &card.value)?;
    }

    let names = coefficient_names(&map.basis);
    let mut descriptions = vec![
        ColumnDescription::new("axis")
            .with_type(ColumnDataType::String)
            .that_repeats(1)
            .create()?,
        ColumnDescription::new("order-deg")
            .with_type(ColumnDataType::Int)
            .create()?,
        ColumnDescription::new("wavelength-deg")
            .with_type(ColumnDataType::Int)
            .create()?,
        ColumnDescription::new("slit-deg")
            .with_type(ColumnDataType::Int)
            .create()?,
    ];
    for name in &names {
        descriptions.push(
            ColumnDescription::new(name)
                .with_type(ColumnDataType::Double)
                .create()?,
        );
    }

    let hdu = fits.create_table("COEFF", &descriptions)?;
    hdu.write_col(&mut fits, "axis", &["x".to_string(), "y".to_string()])?;
    hdu.write_col(
        &mut fits,
        "order-deg",
        &[map.basis.order_deg as i32, map.basis.order_deg as i32],
    )?;
    hdu.write_col(
        &mut fits,
        "wavelength-deg",
        &[
            map.basis.wavelength_deg as i32,
            map.basis.wavelength_deg as i32,
        ],
    )?;
    hdu.write_col(
        &mut fits,
        "slit-deg",
        &[map.basis.slit_deg as i32, map.basis.slit_deg as i32],
    )?;
    for (idx, name) in names.iter().enumerate() {
        hdu.write_col(&mut fits, name, &[map.xcoeffs[idx], map.ycoeffs[idx]])?;
    }

    let norm_values = [
        map.basis.order_domain.min,
        map.basis.order_domain.max,
        map.basis.wavelength_domain.min,
        map.basis.wavelength_domain.max,
        map.basis.slit_domain.min,
        map.basis.slit_domain.max,
    ];
    for ((key, _), value) in NORM_KEYS.iter().copied().zip(norm_values.iter()) {
        hdu.write_key(&mut fits, key, *value)?;
    }
    Ok(())
}

/// Read a serialised map back. The prior single-pinhole solution enters the
/// multi-pinhole run through this path.
pub fn read_map(path: &Path) -> Result<DispersionMap, MapReadError> {
    let file_str = path.display().to_string();
    debug!("Reading dispersion map from {file_str}");

    let mut fits = FitsFile::open(path).map_err(|err| MapReadError::Fits {
        file: file_str.clone(),
        err,
    })?;
    let hdu = fits.hdu("COEFF").map_err(|err| MapReadError::Fits {
        file: file_str.clone(),
        err,
    })?;

    let mut read_col = |fits: &mut FitsFile, name: &str| -> Result<Vec<f64>, MapReadError> {
        let column =
            resolve_column(&hdu.info, name).ok_or_else(|| MapReadError::MissingColumn {
                file: file_str.clone(),
                column: name.to_string(),
            })?;
        hdu.read_col(fits, &column).map_err(|err| MapReadError::Fits {
            file: file_str.clone(),
            err,
        })
    };

    let order_deg = read_col(&mut fits, "order-deg")?;
    let wavelength_deg = read_col(&mut fits, "wavelength-deg")?;
    let slit_deg = read_col(&mut fits, "slit-deg")?;
    if order_deg.len() != 2
        || order_deg[0] != order_deg[1]
        || wavelength_deg[0] != wavelength_deg[1]
        || slit_deg[0] != slit_deg[1]
    {
        return Err(MapReadError::DegreeDisagreement { file: file_str });
    }

    let axes: Vec<String> =
        hdu.read_col(&mut fits, "axis")
            .map_err(|err| MapReadError::Fits {
                file: file_str.clone(),
                err,
            })?;
    let x_row = axes
        .iter()
        .position(|a| a.trim() == "x")
        .ok_or(MapReadError::MissingAxisRow {
            file: file_str.clone(),
            axis: "x",
        })?;
    let y_row = axes
        .iter()
        .position(|a| a.trim() == "y")
        .ok_or(MapReadError::MissingAxisRow {
            file: file_str.clone(),
            axis: "y",
        })?;

    let mut norms = [0.0_f64; 6];
    for (slot, (key, _)) in norms.iter_mut().zip(NORM_KEYS.iter().copied()) {
        *slot = hdu
            .read_key(&mut fits, key)
            .map_err(|_| MapReadError::MissingNorm {
                file: file_str.clone(),
                key,
            })?;
    }

    let basis = ChebyBasis {
        order_deg: order_deg[0] as usize,
        wavelength_deg: wavelength_deg[0] as usize,
        slit_deg: slit_deg[0] as usize,
        order_domain: Domain {
            min: norms[0],
            max: norms[1],
        },
        wavelength_domain: Domain {
            min: norms[2],
            max: norms[3],
        },
        slit_domain: Domain {
            min: norms[4],
            max: norms[5],
        },
    };

    let mut xcoeffs = Vec::with_capacity(basis.ncoeffs());
    let mut ycoeffs = Vec::with_capacity(basis.ncoeffs());
    for name in coefficient_names(&basis) {
        let column = read_col(&mut fits, &name)?;
        xcoeffs.push(column[x_row]);
        ycoeffs.push(column[y_row]);
    }

    Ok(DispersionMap {
        basis,
        xcoeffs,
        ycoeffs,
    })
}
