// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type for all dispersol-related errors. This should be the *only*
//! error enum that is publicly visible.

use thiserror::Error;

use crate::catalogue::CatalogueError;
use crate::context::ContextError;
use crate::fitter::FitError;
use crate::params::ConfigError;
use crate::poly::PolyError;
use crate::raster::RasterError;
use crate::shift::ShiftError;
use crate::solutions::{MapReadError, MapWriteError};

/// The *only* publicly visible error from dispersol. Every variant carries
/// the component's own message; the variant tells the caller which recovery
/// policy applies.
#[derive(Error, Debug)]
pub enum DispersolError {
    /// Bad or missing input: header keys, techniques, catalogue columns,
    /// configuration values.
    #[error("{0}")]
    InvalidInput(String),

    /// The polynomial fit cannot proceed: wrong degrees, rank-deficient
    /// system, or too few surviving lines.
    #[error("{0}")]
    Fit(String),

    /// Zero lines were detected on the pinhole frame.
    #[error("{0}")]
    NoDetections(String),

    /// A raster order exceeded its wall-clock limit.
    #[error("{0}")]
    OrderTimeout(String),

    /// An output product could not be written; no partial file remains.
    #[error("{0}")]
    WriteFailure(String),

    /// A cfitsio error. These are usually quite spartan; try verbose
    /// logging for the surrounding context.
    #[error("cfitsio error: {0}")]
    Cfitsio(String),

    /// A generic error that can't be clarified further, e.g. IO errors.
    #[error("{0}")]
    Generic(String),
}

// When changing the error propagation below, ensure `Self::Variant(s)` uses
// the message of the matched error.

impl From<ContextError> for DispersolError {
    fn from(e: ContextError) -> Self {
        let s = e.to_string();
        match e {
            ContextError::MissingKey { .. }
            | ContextError::UnexpectedTechnique { .. }
            | ContextError::BadArm { .. }
            | ContextError::MissingColumn { .. }
            | ContextError::BadHdu { .. }
            | ContextError::BadShape { .. }
            | ContextError::NoCatalogueForBinning { .. }
            | ContextError::ProfileParse { .. } => Self::InvalidInput(s),
            ContextError::Fits { .. } => Self::Cfitsio(s),
            ContextError::Io { .. } => Self::Generic(s),
        }
    }
}

impl From<CatalogueError> for DispersolError {
    fn from(e: CatalogueError) -> Self {
        let s = e.to_string();
        match e {
            CatalogueError::MissingColumn { .. }
            | CatalogueError::Empty { .. }
            | CatalogueError::NoMidSlitLines { .. } => Self::InvalidInput(s),
            CatalogueError::Fits { .. } => Self::Cfitsio(s),
        }
    }
}

impl From<ConfigError> for DispersolError {
    fn from(e: ConfigError) -> Self {
        let s = e.to_string();
        match e {
            ConfigError::Invalid { .. } | ConfigError::Parse { .. } => Self::InvalidInput(s),
            ConfigError::Io { .. } => Self::Generic(s),
        }
    }
}

impl From<PolyError> for DispersolError {
    fn from(e: PolyError) -> Self {
        Self::Fit(e.to_string())
    }
}

impl From<FitError> for DispersolError {
    fn from(e: FitError) -> Self {
        let s = e.to_string();
        match e {
            FitError::InvalidInput { .. } => Self::InvalidInput(s),
            FitError::Underdetermined { .. } | FitError::Poly(_) => Self::Fit(s),
        }
    }
}

impl From<ShiftError> for DispersolError {
    fn from(e: ShiftError) -> Self {
        let s = e.to_string();
        match e {
            ShiftError::NothingOnDetector | ShiftError::NoShiftReference => Self::InvalidInput(s),
            ShiftError::Poly(_) => Self::Fit(s),
        }
    }
}

impl From<RasterError> for DispersolError {
    fn from(e: RasterError) -> Self {
        let s = e.to_string();
        match e {
            RasterError::SinglePinholeMap => Self::InvalidInput(s),
            RasterError::OrderTimeout { .. } => Self::OrderTimeout(s),
            RasterError::WorkerFailure { .. } => Self::Generic(s),
            RasterError::Poly(_) => Self::Fit(s),
        }
    }
}

impl From<MapReadError> for DispersolError {
    fn from(e: MapReadError) -> Self {
        let s = e.to_string();
        match e {
            MapReadError::MissingColumn { .. }
            | MapReadError::MissingAxisRow { .. }
            | MapReadError::MissingNorm { .. }
            | MapReadError::DegreeDisagreement { .. } => Self::InvalidInput(s),
            MapReadError::Fits { .. } => Self::Cfitsio(s),
            MapReadError::IO { .. } => Self::Generic(s),
        }
    }
}

impl From<MapWriteError> for DispersolError {
    fn from(e: MapWriteError) -> Self {
        Self::WriteFailure(e.to_string())
    }
}

#[cfg(feature = "plotting")]
impl From<crate::plotting::PlotError> for DispersolError {
    fn from(e: crate::plotting::PlotError) -> Self {
        Self::Generic(e.to_string())
    }
}
