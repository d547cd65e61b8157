// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Constants used throughout dispersol.

/// FWHM of the Gaussian kernel used when centroiding arc lines \[pixels\].
pub(crate) const CENTROID_FWHM: f64 = 2.0;

/// Peak-finder detection threshold, as a multiple of the sigma-clipped
/// background standard deviation.
pub(crate) const CENTROID_THRESHOLD_SIGMA: f64 = 5.0;

/// Stamp background statistics are sigma-clipped at this level.
pub(crate) const BACKGROUND_CLIP_SIGMA: f64 = 3.0;

/// Acceptable roundness range for detected sources is ± this value.
pub(crate) const ROUNDNESS_LIMIT: f64 = 3.0;

/// Acceptable sharpness range for detected sources is ± this value.
pub(crate) const SHARPNESS_LIMIT: f64 = 3.0;

/// Wavelength padding applied either side of an order's spectral-format
/// limits when seeding the raster grid \[nm\].
pub(crate) const ORDER_WAVELENGTH_PADDING: f64 = 20.0;

/// The raster slit grid is oversized by this factor so that sampling covers
/// the order edges.
pub(crate) const SLIT_OVERSIZE_FACTOR: f64 = 1.1;

/// Per-pixel wavelength/slit standard deviations are floored at the
/// displacement threshold divided by this value during raster refinement.
pub(crate) const STD_FLOOR_DIVISOR: f64 = 100.0;

/// `MAD * 1.4826` approximates a Gaussian standard deviation.
pub(crate) const MAD_TO_SIGMA: f64 = 1.4826;

/// Default wall-clock timeout for a single order's rasterisation \[seconds\].
pub(crate) const DEFAULT_ORDER_TIMEOUT: u64 = 3600;

/// Default cap on raster refinement iterations per order.
pub(crate) const DEFAULT_RASTER_ITERATION_LIMIT: usize = 20;

// FITS keywords. ESO-style hierarch keys are stored without the "HIERARCH"
// prefix; cfitsio adds it back on write.
pub(crate) const KW_INSTRUME: &str = "INSTRUME";
pub(crate) const KW_DATE_OBS: &str = "DATE-OBS";
pub(crate) const KW_ARM: &str = "ESO SEQ ARM";
pub(crate) const KW_DPR_PREFIX: &str = "ESO DPR";
pub(crate) const KW_DPR_TECH: &str = "ESO DPR TECH";
pub(crate) const KW_PRO_TECH: &str = "ESO PRO TECH";
pub(crate) const KW_PRO_TYPE: &str = "ESO PRO TYPE";
pub(crate) const KW_PRO_CATG: &str = "ESO PRO CATG";
pub(crate) const KW_DET_READ_SPEED: &str = "ESO DET READ SPEED";
pub(crate) const KW_CONAD: &str = "ESO DET OUT1 CONAD";
pub(crate) const KW_GAIN: &str = "ESO DET OUT1 GAIN";
pub(crate) const KW_RON: &str = "ESO DET OUT1 RON";
pub(crate) const KW_BINX: &str = "ESO DET WIN1 BINX";
pub(crate) const KW_BINY: &str = "ESO DET WIN1 BINY";

pub(crate) const TECH_SINGLE_PINHOLE: &str = "ECHELLE,PINHOLE";
pub(crate) const TECH_MULTI_PINHOLE: &str = "ECHELLE,MULTI-PINHOLE";
