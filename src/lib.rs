// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Dispersion-solution core for echelle-spectrograph data reduction.
//!
//! Given a calibrated pinhole arc-lamp frame and a predicted line catalogue,
//! dispersol locates each arc line on the detector, fits a pair of global
//! Chebyshev polynomials mapping `(order, wavelength, slit position)` to
//! detector `(x, y)`, and inverts the fitted map into per-pixel wavelength
//! and slit-position rasters.

pub mod catalogue;
pub mod centroid;
pub(crate) mod constants;
pub mod context;
pub(crate) mod error;
pub mod fitter;
pub(crate) mod math;
pub mod params;
#[cfg(feature = "plotting")]
pub(crate) mod plotting;
pub mod poly;
pub mod qc;
pub mod raster;
pub mod shift;
pub mod solutions;
pub mod solve;

// Re-exports.
pub use catalogue::LineTable;
pub use centroid::{detect_lines, DetectedLines};
pub use context::{
    Arm, Binning, DetectorProfile, DispersionAxis, Frame, FrameHeader, OrderRange, PinholeMode,
};
pub use error::DispersolError;
pub use fitter::{fit_dispersion_polynomials, ClipConfig, FitSolution, ResidualStats};
pub use params::RecipeConfig;
pub use qc::{ProductRecord, QcRecord, QcSink, QcValue};
pub use raster::{build_raster_maps, RasterConfig, RasterGeometry, RasterMaps};
pub use solutions::{read_map, write_map, DispersionMap};
pub use solve::{solve_dispersion, SolveProducts, SolveRequest};
