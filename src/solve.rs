// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The dispersion-solution pipeline: catalogue → centroids → fit → products.
//!
//! A single-pinhole run fits a slit-independent map (`d_s = 0`) and writes
//! `<prefix>_DISP_MAP.fits`. A multi-pinhole run uses the single solution as
//! prior, fits the full three-variable map, writes `<prefix>_2D_MAP.fits`
//! and additionally inverts it into the `<prefix>_MAP_IMAGE.fits` raster.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};

use crate::catalogue::read_predicted_lines;
use crate::centroid::detect_lines;
use crate::context::{read_spectral_format, DetectorProfile, Frame, PinholeMode};
use crate::error::DispersolError;
use crate::fitter::{fit_dispersion_polynomials, ClipConfig, FitSolution, ResidualStats};
use crate::params::RecipeConfig;
use crate::qc::{ProductRecord, QcRecord, QcSink, QcValue};
use crate::raster::{build_raster_maps, write_raster_image, RasterConfig, RasterGeometry};
use crate::shift::estimate_and_apply_shift;
use crate::solutions::{product_header, read_map, write_map, DispersionMap};

/// Everything the core needs for one run. The collaborators prepare all of
/// it: the frame is calibrated, the profile is loaded, the prior (when
/// given) comes from an earlier single-pinhole run.
#[derive(Debug)]
pub struct SolveRequest<'a> {
    pub frame: &'a Frame,
    pub profile: &'a DetectorProfile,
    pub config: &'a RecipeConfig,
    /// Prior dispersion map file; required technique becomes multi-pinhole
    /// behaviour when the frame says so.
    pub prior_map_path: Option<&'a Path>,
    pub output_dir: &'a Path,
    /// Product filename prefix, e.g. an observation stamp.
    pub prefix: &'a str,
}

/// What a run produced.
#[derive(Debug)]
pub struct SolveProducts {
    pub map: DispersionMap,
    pub map_path: PathBuf,
    /// Only multi-pinhole runs produce the raster image.
    pub raster_path: Option<PathBuf>,
    pub plot_path: Option<PathBuf>,
    pub stats: ResidualStats,
    pub qc: Vec<QcRecord>,
    pub products: Vec<ProductRecord>,
}

/// Run the dispersion-solution core end to end.
pub fn solve_dispersion(request: &SolveRequest) -> Result<SolveProducts, DispersolError> {
    let frame = request.frame;
    let profile = request.profile;
    let config = request.config;
    config.validate()?;

    let mode = frame.pinhole_mode()?;
    let arm = frame.arm()?;
    let date_obs = frame.date_obs()?.to_string();
    if request.prior_map_path.is_some() && mode == PinholeMode::Single {
        return Err(DispersolError::InvalidInput(
            "A prior dispersion map was supplied for a single-pinhole frame".to_string(),
        ));
    }

    let (recipe, slit_deg) = match mode {
        PinholeMode::Single => ("disp-solution", 0),
        PinholeMode::Multi => ("spatial-solution", config.slit_deg),
    };
    info!("Running {recipe} on a {mode}-pinhole {arm} frame");
    let mut qc = QcSink::new(recipe, &date_obs);

    // The predicted line list for this mode and binning; single-pinhole
    // keeps only the mid-slit rows.
    let catalogue_path = profile.predicted_lines_path(mode, frame.binning())?;
    let mut table = read_predicted_lines(catalogue_path, mode, profile.mid_slit_index)?;

    // With a prior solution available, reference the predictions against it
    // and absorb any rigid instrument shift before the main detection.
    if let Some(prior_path) = request.prior_map_path {
        let prior = read_map(prior_path)?;
        let outcome = estimate_and_apply_shift(&table, &prior, profile.mid_slit_index)?;
        table = outcome.shifted;
    }

    let detected = detect_lines(frame, &table, config.pixel_window_size);
    let tag = mode.to_string();
    qc.push(
        "NLINE",
        QcValue::Int(detected.detected_count() as i64),
        Some("lines"),
        &format!("Number of lines detected in {tag} pinhole frame"),
        true,
    );
    qc.push(
        "PLINE",
        QcValue::Float(detected.detected_fraction()),
        None,
        &format!("Proportion of lines detected in {tag} pinhole frame"),
        true,
    );
    if detected.detected_count() == 0 {
        return Err(DispersolError::NoDetections(format!(
            "None of the {} predicted lines could be detected on the {tag} pinhole frame",
            detected.len()
        )));
    }

    let solution = fit_dispersion_polynomials(
        &detected,
        config.order_deg,
        config.wavelength_deg,
        slit_deg,
        &ClipConfig {
            sigma: config.clip_sigma,
            max_iters: config.clip_iteration_limit,
        },
    )?;
    push_residual_qc(&mut qc, &solution.stats);

    // Serialise the map with the cleaned header and the QC keys.
    let map_stem = match mode {
        PinholeMode::Single => "DISP_MAP",
        PinholeMode::Multi => "2D_MAP",
    };
    let map_path = request
        .output_dir
        .join(format!("{}_{map_stem}.fits", request.prefix));
    let header = product_header(&frame.header, arm, mode, "DISP_TAB", qc.records());
    write_map(&solution.map, &header, &map_path)?;
    qc.push_product(
        "DISP_MAP",
        map_path.clone(),
        "FITS",
        &format!("{arm} dispersion map coefficients"),
    );

    let plot_path = plot_residuals(request, &solution, mode, map_stem, &mut qc)?;

    // Multi-pinhole runs also materialise the inverse model.
    let raster_path = if mode == PinholeMode::Multi {
        let raster_path = request
            .output_dir
            .join(format!("{}_MAP_IMAGE.fits", request.prefix));
        debug!("Building raster maps for {}", raster_path.display());
        let format = read_spectral_format(&profile.spectral_format)?;
        let geometry = RasterGeometry {
            width: profile.width(),
            height: profile.height(),
            slit_length: profile.slit_length,
            dispersion_axis: profile.dispersion_axis,
        };
        let raster_config = RasterConfig {
            grid_res_wavelength: config.grid_res_wavelength,
            grid_res_slit: config.grid_res_slit,
            zoom_grid_size: config.zoom_grid_size,
            displacement_threshold: config.displacement_threshold,
            iteration_limit: config.raster_iteration_limit,
        };
        let maps = build_raster_maps(
            &solution.map,
            &format,
            &geometry,
            &raster_config,
            Duration::from_secs(config.order_timeout_secs),
        )?;

        let image_header = product_header(&frame.header, arm, mode, "DISP_IMAGE", qc.records());
        write_raster_image(&maps, &image_header, &raster_path)?;
        qc.push_product(
            "DISP_IMAGE",
            raster_path.clone(),
            "FITS",
            &format!("{arm} per-pixel wavelength/slit raster"),
        );
        Some(raster_path)
    } else {
        None
    };

    let stats = solution.stats;
    let map = solution.map;
    let (qc, products) = qc.into_parts();
    Ok(SolveProducts {
        map,
        map_path,
        raster_path,
        plot_path,
        stats,
        qc,
        products,
    })
}

fn push_residual_qc(qc: &mut QcSink, stats: &ResidualStats) {
    let entries: [(&str, f64, &str); 9] = [
        (
            "XRESMIN",
            stats.x_min,
            "Minimum residual in dispersion solution fit along x-axis",
        ),
        (
            "XRESMAX",
            stats.x_max,
            "Maximum residual in dispersion solution fit along x-axis",
        ),
        (
            "XRESRMS",
            stats.x_std,
            "Std-dev of residual in dispersion solution fit along x-axis",
        ),
        (
            "YRESMIN",
            stats.y_min,
            "Minimum residual in dispersion solution fit along y-axis",
        ),
        (
            "YRESMAX",
            stats.y_max,
            "Maximum residual in dispersion solution fit along y-axis",
        ),
        (
            "YRESRMS",
            stats.y_std,
            "Std-dev of residual in dispersion solution fit along y-axis",
        ),
        (
            "XYRESMIN",
            stats.xy_min,
            "Minimum residual in dispersion solution fit (XY combined)",
        ),
        (
            "XYRESMAX",
            stats.xy_max,
            "Maximum residual in dispersion solution fit (XY combined)",
        ),
        (
            "XYRESRMS",
            stats.xy_std,
            "Std-dev of residual in dispersion solution (XY combined)",
        ),
    ];
    for (name, value, comment) in entries {
        qc.push(name, QcValue::Float(value), Some("pixels"), comment, true);
    }
}

#[cfg(feature = "plotting")]
fn plot_residuals(
    request: &SolveRequest,
    solution: &FitSolution,
    mode: PinholeMode,
    map_stem: &str,
    qc: &mut QcSink,
) -> Result<Option<PathBuf>, DispersolError> {
    let plot_path = request
        .output_dir
        .join(format!("{}_{map_stem}_RESIDUALS.png", request.prefix));
    crate::plotting::plot_fit_residuals(request.frame, solution, mode, &plot_path)?;
    qc.push_product(
        "DISP_MAP_RES",
        plot_path.clone(),
        "PNG",
        "Dispersion solution residual QC plots",
    );
    Ok(Some(plot_path))
}

#[cfg(not(feature = "plotting"))]
fn plot_residuals(
    _request: &SolveRequest,
    _solution: &FitSolution,
    _mode: PinholeMode,
    _map_stem: &str,
    _qc: &mut QcSink,
) -> Result<Option<PathBuf>, DispersolError> {
    Ok(None)
}
