// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Recipe configuration.
//!
//! All tunables are carried in an explicit [`RecipeConfig`] handed to each
//! component; there is no ambient settings state. Configs are usually
//! deserialised from the pipeline's YAML settings file, but every field has a
//! sensible default so tests and library callers can build one directly.

use std::fs::File;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::constants::{DEFAULT_ORDER_TIMEOUT, DEFAULT_RASTER_ITERATION_LIMIT};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Couldn't read config file {path}: {err}")]
    Io {
        path: String,
        err: std::io::Error,
    },

    #[error("Couldn't parse config file {path}: {err}")]
    Parse {
        path: String,
        err: serde_yaml::Error,
    },

    #[error("Bad config value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Tunables for one dispersion-solution run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecipeConfig {
    /// Chebyshev degree in echelle order.
    #[serde(rename = "order-deg")]
    pub order_deg: usize,

    /// Chebyshev degree in wavelength.
    #[serde(rename = "wavelength-deg")]
    pub wavelength_deg: usize,

    /// Chebyshev degree in slit position. Forced to 0 for single-pinhole
    /// runs.
    #[serde(rename = "slit-deg")]
    pub slit_deg: usize,

    /// Side of the square stamp clipped around each predicted line when
    /// centroiding \[pixels\].
    #[serde(rename = "pixel-window-size")]
    pub pixel_window_size: usize,

    /// Residual clipping threshold for the global polynomial fit, in robust
    /// sigma.
    #[serde(rename = "poly-fitting-residual-clipping-sigma")]
    pub clip_sigma: f64,

    /// Cap on fit/clip iterations.
    #[serde(rename = "poly-clipping-iteration-limit")]
    pub clip_iteration_limit: usize,

    /// Wavelength step of the initial raster grid \[nm\].
    #[serde(rename = "grid_res_wavelength")]
    pub grid_res_wavelength: f64,

    /// Slit-position step of the initial raster grid \[arcsec\].
    #[serde(rename = "grid_res_slit")]
    pub grid_res_slit: f64,

    /// Side of the per-pixel refinement grid in the rasteriser.
    #[serde(rename = "zoom_grid_size")]
    pub zoom_grid_size: usize,

    /// A raster sample is accepted when its displacement from the pixel
    /// centre is below this \[pixels\].
    #[serde(rename = "map_to_image_displacement_threshold")]
    pub displacement_threshold: f64,

    /// Cap on raster refinement iterations per order.
    #[serde(rename = "raster-iteration-limit")]
    pub raster_iteration_limit: usize,

    /// Wall-clock timeout for each order's raster work \[seconds\].
    #[serde(rename = "order-timeout")]
    pub order_timeout_secs: u64,
}

impl Default for RecipeConfig {
    fn default() -> Self {
        RecipeConfig {
            order_deg: 3,
            wavelength_deg: 3,
            slit_deg: 2,
            pixel_window_size: 10,
            clip_sigma: 5.0,
            clip_iteration_limit: 5,
            grid_res_wavelength: 0.05,
            grid_res_slit: 0.05,
            zoom_grid_size: 9,
            displacement_threshold: 0.15,
            raster_iteration_limit: DEFAULT_RASTER_ITERATION_LIMIT,
            order_timeout_secs: DEFAULT_ORDER_TIMEOUT,
        }
    }
}

impl RecipeConfig {
    /// Read a config from a YAML settings file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<RecipeConfig, ConfigError> {
        let path_str = path.as_ref().display().to_string();
        let file = File::open(path.as_ref()).map_err(|err| ConfigError::Io {
            path: path_str.clone(),
            err,
        })?;
        let config: RecipeConfig =
            serde_yaml::from_reader(file).map_err(|err| ConfigError::Parse {
                path: path_str,
                err,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Sanity-check the tunables. Called by `from_yaml_file`; callers
    /// building configs by hand should call it too.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pixel_window_size < 3 {
            return Err(ConfigError::Invalid {
                name: "pixel-window-size",
                reason: format!("{} is too small to centroid in", self.pixel_window_size),
            });
        }
        if self.clip_sigma <= 0.0 {
            return Err(ConfigError::Invalid {
                name: "poly-fitting-residual-clipping-sigma",
                reason: format!("{} must be positive", self.clip_sigma),
            });
        }
        if self.clip_iteration_limit == 0 {
            return Err(ConfigError::Invalid {
                name: "poly-clipping-iteration-limit",
                reason: "at least one fit iteration is required".to_string(),
            });
        }
        if self.grid_res_wavelength <= 0.0 || self.grid_res_slit <= 0.0 {
            return Err(ConfigError::Invalid {
                name: "grid_res_wavelength/grid_res_slit",
                reason: "grid steps must be positive".to_string(),
            });
        }
        if self.zoom_grid_size < 2 {
            return Err(ConfigError::Invalid {
                name: "zoom_grid_size",
                reason: format!("{} cannot seed a refinement grid", self.zoom_grid_size),
            });
        }
        if self.displacement_threshold <= 0.0 {
            return Err(ConfigError::Invalid {
                name: "map_to_image_displacement_threshold",
                reason: format!("{} must be positive", self.displacement_threshold),
            });
        }
        Ok(())
    }
}
