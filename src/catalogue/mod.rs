// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Reading the predicted arc-line catalogue.
//!
//! The catalogue is a static FITS table of anticipated line positions, one
//! per (order, wavelength, slit position), pre-computed for a given detector
//! binning and pinhole mode. It seeds the centroider with detector-pixel
//! guesses; nothing in it is fitted directly.

#[cfg(test)]
mod tests;

use std::path::Path;

use fitsio::FitsFile;
use log::{debug, info};
use thiserror::Error;

use crate::context::{resolve_column, PinholeMode};
use crate::poly::SpectralRows;

#[derive(Error, Debug)]
pub enum CatalogueError {
    #[error("Predicted-line catalogue {file} has no {column} column")]
    MissingColumn { file: String, column: String },

    #[error("Predicted-line catalogue {file} is empty")]
    Empty { file: String },

    #[error(
        "Predicted-line catalogue {file} has no rows at the mid-slit index {mid_slit_index}; \
         cannot seed a single-pinhole solution"
    )]
    NoMidSlitLines { file: String, mid_slit_index: i32 },

    #[error("cfitsio error when reading {file}: {err}")]
    Fits {
        file: String,
        err: fitsio::errors::Error,
    },
}

/// The predicted line list as a struct-of-arrays. Every column has the same
/// length; derived per-line quantities produced downstream (observed
/// positions, residuals) are separate arrays of the same length.
#[derive(Debug, Clone, Default)]
pub struct LineTable {
    pub order: Vec<i32>,
    pub wavelength: Vec<f64>,
    pub slit_index: Vec<i32>,
    pub slit_position: Vec<f64>,
    pub detector_x: Vec<f64>,
    pub detector_y: Vec<f64>,
}

impl LineTable {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Keep only the rows where `keep` is true. `keep` must have one entry
    /// per row.
    pub fn retain(&mut self, keep: &[bool]) {
        debug_assert_eq!(keep.len(), self.len());
        let mut it = keep.iter();
        self.order.retain(|_| *it.next().unwrap());
        let mut it = keep.iter();
        self.wavelength.retain(|_| *it.next().unwrap());
        let mut it = keep.iter();
        self.slit_index.retain(|_| *it.next().unwrap());
        let mut it = keep.iter();
        self.slit_position.retain(|_| *it.next().unwrap());
        let mut it = keep.iter();
        self.detector_x.retain(|_| *it.next().unwrap());
        let mut it = keep.iter();
        self.detector_y.retain(|_| *it.next().unwrap());
    }

    /// The `(m, λ, s)` view used by the polynomial kernel. The columns are
    /// guaranteed equal-length by construction.
    pub fn spectral_rows(&self) -> SpectralRows {
        SpectralRows {
            order: &self.order,
            wavelength: &self.wavelength,
            slit_position: &self.slit_position,
        }
    }
}

/// Read the predicted-line catalogue for one (mode, binning, arm)
/// combination. In single-pinhole mode only the mid-slit rows are retained;
/// this filter runs before anything downstream sees the table.
pub fn read_predicted_lines<P: AsRef<Path>>(
    path: P,
    mode: PinholeMode,
    mid_slit_index: i32,
) -> Result<LineTable, CatalogueError> {
    let file_str = path.as_ref().display().to_string();
    debug!("Reading predicted line list from {file_str}");

    let mut fits = FitsFile::open(path.as_ref()).map_err(|err| CatalogueError::Fits {
        file: file_str.clone(),
        err,
    })?;
    let hdu = fits.hdu(1).map_err(|err| CatalogueError::Fits {
        file: file_str.clone(),
        err,
    })?;

    // Column names are matched case-insensitively; `order` and `wavelength`
    // in particular appear in both cases in the wild.
    let mut read_f64 = |fits: &mut FitsFile, name: &str| -> Result<Vec<f64>, CatalogueError> {
        let column =
            resolve_column(&hdu.info, name).ok_or_else(|| CatalogueError::MissingColumn {
                file: file_str.clone(),
                column: name.to_string(),
            })?;
        hdu.read_col(fits, &column).map_err(|err| CatalogueError::Fits {
            file: file_str.clone(),
            err,
        })
    };

    let order_f64 = read_f64(&mut fits, "order")?;
    let wavelength = read_f64(&mut fits, "wavelength")?;
    let slit_index_f64 = read_f64(&mut fits, "slit_index")?;
    let slit_position = read_f64(&mut fits, "slit_position")?;
    let detector_x = read_f64(&mut fits, "detector_x")?;
    let detector_y = read_f64(&mut fits, "detector_y")?;

    let mut table = LineTable {
        order: order_f64.iter().map(|&o| o as i32).collect(),
        wavelength,
        slit_index: slit_index_f64.iter().map(|&s| s as i32).collect(),
        slit_position,
        detector_x,
        detector_y,
    };
    if table.is_empty() {
        return Err(CatalogueError::Empty { file: file_str });
    }

    let total = table.len();
    if mode == PinholeMode::Single {
        let keep: Vec<bool> = table
            .slit_index
            .iter()
            .map(|&k| k == mid_slit_index)
            .collect();
        table.retain(&keep);
        if table.is_empty() {
            return Err(CatalogueError::NoMidSlitLines {
                file: file_str,
                mid_slit_index,
            });
        }
    }

    info!(
        "Predicted line list: {} of {} rows retained ({mode} pinhole)",
        table.len(),
        total
    );
    Ok(table)
}
