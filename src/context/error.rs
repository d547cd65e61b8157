// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors associated with frames, headers and detector metadata.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("{file} is missing required header key {key}")]
    MissingKey { file: String, key: String },

    #[error(
        "Header technique '{got}' is not a pinhole technique; expected \
         'ECHELLE,PINHOLE' or 'ECHELLE,MULTI-PINHOLE'"
    )]
    UnexpectedTechnique { got: String },

    #[error("Unrecognised spectrograph arm '{got}'")]
    BadArm { got: String },

    #[error("{file} has no {column} column")]
    MissingColumn { file: String, column: String },

    #[error("{file} HDU {hdu} is not a {expected}")]
    BadHdu {
        file: String,
        hdu: String,
        expected: &'static str,
    },

    #[error("{file}: image data has {got} pixels but the header promises {expected}")]
    BadShape {
        file: String,
        got: usize,
        expected: usize,
    },

    #[error("No predicted-line catalogue registered for mode {mode} at binning {binning}")]
    NoCatalogueForBinning { mode: String, binning: String },

    #[error("Couldn't parse detector profile {file}: {err}")]
    ProfileParse {
        file: String,
        err: serde_yaml::Error,
    },

    #[error("cfitsio error when handling {file}: {err}")]
    Fits {
        file: String,
        err: fitsio::errors::Error,
    },

    #[error("IO error when handling {file}: {err}")]
    Io { file: String, err: std::io::Error },
}
