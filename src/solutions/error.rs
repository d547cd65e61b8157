// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors associated with reading or writing dispersion-map files.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MapReadError {
    #[error("Dispersion map {file} has no {column} column")]
    MissingColumn { file: String, column: String },

    #[error("Dispersion map {file} has no row for axis '{axis}'")]
    MissingAxisRow { file: String, axis: &'static str },

    #[error("Dispersion map {file} is missing normalisation key {key}")]
    MissingNorm { file: String, key: &'static str },

    #[error("Dispersion map {file}: axis rows disagree on polynomial degrees")]
    DegreeDisagreement { file: String },

    #[error("cfitsio error when reading {file}: {err}")]
    Fits {
        file: String,
        err: fitsio::errors::Error,
    },

    #[error("IO error when reading {file}: {err}")]
    IO { file: String, err: std::io::Error },
}

#[derive(Error, Debug)]
pub enum MapWriteError {
    #[error("cfitsio error when writing {file}: {err}")]
    Fits {
        file: String,
        err: fitsio::errors::Error,
    },

    #[error("IO error when writing {file}: {err}")]
    IO { file: String, err: std::io::Error },
}
