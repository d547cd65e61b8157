// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Inverting the dispersion map into per-pixel wavelength and slit images.
//!
//! The forward map is well-behaved but has no closed-form inverse, so each
//! order is inverted by sampling: a dense (λ, s) grid is pushed through the
//! forward polynomials, samples are binned into the detector pixels they
//! land in, and a pixel accepts the sample that falls closest to its centre
//! once that displacement is below the configured threshold. Pixels that
//! don't converge get a refined local grid, sized by the spread of the
//! forward image within the pixel, and another round. Interior pixels
//! converge in one or two rounds; order edges run out of samples and stay
//! NaN.
//!
//! Per pixel the life cycle is empty → sampled → assigned, and assigned is
//! terminal: a committed (λ, s) is never overwritten, neither within an
//! order nor across orders.

mod driver;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use fitsio::images::{ImageDescription, ImageType};
use fitsio::FitsFile;
use log::{debug, info};
use ndarray::Array2;
use thiserror::Error;

pub use driver::build_raster_maps;

use crate::constants::{ORDER_WAVELENGTH_PADDING, SLIT_OVERSIZE_FACTOR, STD_FLOOR_DIVISOR};
use crate::context::{DispersionAxis, FrameHeader, OrderRange};
use crate::math::{mean, std_dev};
use crate::poly::{PolyError, SpectralRows};
use crate::solutions::{write_header_card, DispersionMap, MapWriteError};

#[derive(Error, Debug)]
pub enum RasterError {
    #[error(
        "The dispersion map has no slit dependence (single pinhole); a 2D raster map \
         requires a multi-pinhole solution"
    )]
    SinglePinholeMap,

    #[error("Rasterising order {order} exceeded the {timeout_secs} s wall-clock limit")]
    OrderTimeout { order: i32, timeout_secs: u64 },

    #[error("A raster worker died while processing order {order}")]
    WorkerFailure { order: i32 },

    #[error(transparent)]
    Poly(#[from] PolyError),
}

/// Raster tunables, distilled from the recipe config.
#[derive(Debug, Clone)]
pub struct RasterConfig {
    pub grid_res_wavelength: f64,
    pub grid_res_slit: f64,
    pub zoom_grid_size: usize,
    pub displacement_threshold: f64,
    pub iteration_limit: usize,
}

/// Detector geometry the rasteriser works in.
#[derive(Debug, Clone)]
pub struct RasterGeometry {
    pub width: usize,
    pub height: usize,
    /// Slit length \[arcsec\].
    pub slit_length: f64,
    pub dispersion_axis: DispersionAxis,
}

/// The assembled inverse model: per-pixel wavelength, slit position and
/// order number, NaN outside every order.
#[derive(Debug, Clone)]
pub struct RasterMaps {
    pub wavelength: Array2<f64>,
    pub slit: Array2<f64>,
    pub order: Array2<f64>,
}

/// One pixel's committed (λ, s).
#[derive(Debug, Clone, Copy)]
pub(crate) struct RasterCell {
    pub(crate) x: u32,
    pub(crate) y: u32,
    pub(crate) wavelength: f64,
    pub(crate) slit: f64,
}

/// One order's raster result, carried back to the driver for reassembly.
#[derive(Debug, Clone)]
pub(crate) struct OrderRaster {
    pub(crate) order: i32,
    pub(crate) cells: Vec<RasterCell>,
}

/// Per-group accumulator while binning grid samples into a detector pixel.
struct PixelGroup {
    /// (λ, s, fit_x, fit_y) of every member.
    samples: Vec<(f64, f64, f64, f64)>,
    /// Index into `samples` of the member closest to the pixel centre.
    best: usize,
    best_rxy: f64,
}

/// Invert one order of the dispersion map. Pure function of its arguments;
/// the driver runs one of these per worker.
pub(crate) fn rasterise_order(
    range: OrderRange,
    map: &DispersionMap,
    geom: &RasterGeometry,
    config: &RasterConfig,
) -> Result<OrderRaster, PolyError> {
    let order = range.order;

    // The initial oversampled grid: the full wavelength span of the order
    // with wriggle room, crossed with an oversized slit range.
    let wl_lo = range.wl_min - ORDER_WAVELENGTH_PADDING;
    let wl_hi = range.wl_max + ORDER_WAVELENGTH_PADDING;
    let slit_half = geom.slit_length / 2.0 * SLIT_OVERSIZE_FACTOR;
    let n_wl = ((wl_hi - wl_lo) / config.grid_res_wavelength).ceil() as usize;
    let n_slit = ((2.0 * slit_half) / config.grid_res_slit).ceil() as usize + 1;

    let mut wavelengths = Vec::with_capacity(n_wl * n_slit);
    let mut slits = Vec::with_capacity(n_wl * n_slit);
    for i_slit in 0..n_slit {
        let s = -slit_half + i_slit as f64 * config.grid_res_slit;
        for i_wl in 0..n_wl {
            wavelengths.push(wl_lo + i_wl as f64 * config.grid_res_wavelength);
            slits.push(s);
        }
    }

    let std_floor = config.displacement_threshold / STD_FLOOR_DIVISOR;
    let mut assigned: BTreeSet<(u32, u32)> = BTreeSet::new();
    let mut cells: Vec<RasterCell> = vec![];
    let mut orders_buf: Vec<i32> = vec![];

    let mut iteration = 0;
    while !wavelengths.is_empty() && iteration < config.iteration_limit {
        iteration += 1;

        orders_buf.clear();
        orders_buf.resize(wavelengths.len(), order);
        let rows = SpectralRows::new(&orders_buf, &wavelengths, &slits)?;
        let (fit_x, fit_y) = map.evaluate(&rows)?;

        // Bin every on-detector sample into its integer pixel. BTreeMap
        // keeps pixel processing order deterministic.
        let mut groups: BTreeMap<(u32, u32), PixelGroup> = BTreeMap::new();
        for i in 0..wavelengths.len() {
            let (fx, fy) = (fit_x[i], fit_y[i]);
            if !(fx > 0.0 && fy > 0.0) || !fx.is_finite() || !fy.is_finite() {
                continue;
            }
            let (px, py) = (fx.floor() as i64, fy.floor() as i64);
            if px >= geom.width as i64 || py >= geom.height as i64 {
                continue;
            }
            let key = (px as u32, py as u32);
            if assigned.contains(&key) {
                continue;
            }
            let rxy = (fx - px as f64 - 0.5).hypot(fy - py as f64 - 0.5);
            let group = groups.entry(key).or_insert(PixelGroup {
                samples: vec![],
                best: 0,
                best_rxy: f64::INFINITY,
            });
            if rxy < group.best_rxy {
                group.best = group.samples.len();
                group.best_rxy = rxy;
            }
            group.samples.push((wavelengths[i], slits[i], fx, fy));
        }

        // Commit converged pixels; queue a refined grid for the rest.
        let mut next_wavelengths = vec![];
        let mut next_slits = vec![];
        let mut newly_assigned = 0_usize;
        for (&(px, py), group) in &groups {
            // Order-edge pixels with too few samples can't be trusted.
            if group.samples.len() < 3 {
                continue;
            }
            let (best_wl, best_slit, best_fx, best_fy) = group.samples[group.best];
            if group.best_rxy < config.displacement_threshold {
                assigned.insert((px, py));
                cells.push(RasterCell {
                    x: px,
                    y: py,
                    wavelength: best_wl,
                    slit: best_slit,
                });
                newly_assigned += 1;
                continue;
            }

            refine_group(
                group,
                (px, py),
                (best_wl, best_slit, best_fx, best_fy),
                geom.dispersion_axis,
                std_floor,
                config.zoom_grid_size,
                &mut next_wavelengths,
                &mut next_slits,
            );
        }

        debug!(
            "order {order:02}, iteration {iteration:02}: {newly_assigned} pixels fitted, \
             {} pixels still to constrain",
            next_wavelengths.len() / (config.zoom_grid_size * config.zoom_grid_size).max(1)
        );
        if newly_assigned == 0 {
            break;
        }
        wavelengths = next_wavelengths;
        slits = next_slits;
    }

    info!(
        "order {order:02}: {} pixels constrained after {iteration} iterations",
        cells.len()
    );
    Ok(OrderRaster { order, cells })
}

/// Build the refinement grid for one unconverged pixel and append it to the
/// next iteration's sample arrays.
#[allow(clippy::too_many_arguments)]
fn refine_group(
    group: &PixelGroup,
    pixel: (u32, u32),
    best: (f64, f64, f64, f64),
    dispersion_axis: DispersionAxis,
    std_floor: f64,
    grid_size: usize,
    next_wavelengths: &mut Vec<f64>,
    next_slits: &mut Vec<f64>,
) {
    let (px, py) = pixel;
    let (best_wl, best_slit, best_fx, best_fy) = best;

    let wl_values: Vec<f64> = group.samples.iter().map(|s| s.0).collect();
    let slit_values: Vec<f64> = group.samples.iter().map(|s| s.1).collect();
    let fx_values: Vec<f64> = group.samples.iter().map(|s| s.2).collect();
    let fy_values: Vec<f64> = group.samples.iter().map(|s| s.3).collect();

    let centre_x = px as f64 + 0.5;
    let centre_y = py as f64 + 0.5;
    let mean_fx = mean(&fx_values);
    let mean_fy = mean(&fy_values);
    let mean_off_x = mean_fx - centre_x;
    let mean_off_y = mean_fy - centre_y;
    let mean_off_xy = mean_off_x.hypot(mean_off_y);

    // Guess: the group mean when it beats the closest sample, else the
    // closest sample itself.
    let (guess_wl, guess_slit, best_off_x, best_off_y) = if mean_off_xy <= group.best_rxy {
        (
            mean(&wl_values),
            mean(&slit_values),
            mean_off_x.abs(),
            mean_off_y.abs(),
        )
    } else {
        (
            best_wl,
            best_slit,
            (best_fx - centre_x).abs(),
            (best_fy - centre_y).abs(),
        )
    };

    let sigma_wl = std_dev(&wl_values, 1).max(std_floor);
    let sigma_slit = std_dev(&slit_values, 1).max(std_floor);
    let sigma_fx = std_dev(&fx_values, 1);
    let sigma_fy = std_dev(&fy_values, 1);

    // The search half-width scales the (λ, s) spread by how far off target
    // the pixel still is, in units of the pixel-space spread. Degenerate
    // spreads would blow the ratio up; clamp keeps the grid finite.
    let ratio_x = clamp_ratio(best_off_x * 2.0 / sigma_fx);
    let ratio_y = clamp_ratio(best_off_y * 2.0 / sigma_fy);
    let (ratio_disp, ratio_spat) = match dispersion_axis {
        DispersionAxis::X => (ratio_x, ratio_y),
        DispersionAxis::Y => (ratio_y, ratio_x),
    };
    let wl_half = sigma_wl * ratio_disp;
    let slit_half = sigma_slit * ratio_spat;

    let g = grid_size;
    let wl_step = 2.0 * wl_half / (g - 1) as f64;
    let slit_step = 2.0 * slit_half / (g - 1) as f64;
    for i_slit in 0..g {
        let s = guess_slit - slit_half + i_slit as f64 * slit_step;
        for i_wl in 0..g {
            next_wavelengths.push(guess_wl - wl_half + i_wl as f64 * wl_step);
            next_slits.push(s);
        }
    }
}

fn clamp_ratio(ratio: f64) -> f64 {
    if ratio.is_finite() {
        ratio.clamp(0.05, 50.0)
    } else {
        1.0
    }
}

impl RasterMaps {
    /// Stitch per-order results into the detector-sized images. Results are
    /// applied in ascending order number and a pixel is only written while
    /// NaN, so the assembly is deterministic regardless of which worker
    /// finished first.
    pub(crate) fn assemble(
        mut results: Vec<OrderRaster>,
        width: usize,
        height: usize,
    ) -> RasterMaps {
        results.sort_by_key(|r| r.order);

        let mut wavelength = Array2::from_elem((height, width), f64::NAN);
        let mut slit = Array2::from_elem((height, width), f64::NAN);
        let mut order = Array2::from_elem((height, width), f64::NAN);
        for result in &results {
            for cell in &result.cells {
                let (x, y) = (cell.x as usize, cell.y as usize);
                if wavelength[[y, x]].is_nan() {
                    wavelength[[y, x]] = cell.wavelength;
                    slit[[y, x]] = cell.slit;
                    order[[y, x]] = f64::from(result.order);
                }
            }
        }
        RasterMaps {
            wavelength,
            slit,
            order,
        }
    }

    /// Pixels carrying a solution.
    pub fn assigned_count(&self) -> usize {
        self.wavelength.iter().filter(|v| v.is_finite()).count()
    }
}

/// Write the raster maps as a FITS image product: wavelength in the primary
/// HDU, slit and order as image extensions. The partial file is removed on
/// failure.
pub fn write_raster_image(
    maps: &RasterMaps,
    header: &FrameHeader,
    path: &Path,
) -> Result<(), MapWriteError> {
    let file_str = path.display().to_string();
    debug!("Writing raster map image to {file_str}");
    if path.exists() {
        std::fs::remove_file(path).map_err(|err| MapWriteError::IO {
            file: file_str.clone(),
            err,
        })?;
    }
    let guard = scopeguard::guard((), |_| {
        let _ = std::fs::remove_file(path);
    });

    write_raster_image_inner(maps, header, path).map_err(|err| MapWriteError::Fits {
        file: file_str.clone(),
        err,
    })?;

    scopeguard::ScopeGuard::into_inner(guard);
    info!("Raster map image written to {file_str}");
    Ok(())
}

fn write_raster_image_inner(
    maps: &RasterMaps,
    header: &FrameHeader,
    path: &Path,
) -> Result<(), fitsio::errors::Error> {
    let (height, width) = maps.wavelength.dim();
    let description = ImageDescription {
        data_type: ImageType::Double,
        dimensions: &[height, width],
    };
    let mut fits = FitsFile::create(path)
        .with_custom_primary(&description)
        .open()?;

    let primary = fits.primary_hdu()?;
    for card in header.cards() {
        write_header_card(&mut fits, &primary, &card.key, &card.value)?;
    }
    primary.write_key(&mut fits, "EXTNAME", "WAVELENGTH")?;
    let wavelength: Vec<f64> = maps.wavelength.iter().copied().collect();
    primary.write_image(&mut fits, &wavelength)?;

    let slit_hdu = fits.create_image("SLIT".to_string(), &description)?;
    let slit: Vec<f64> = maps.slit.iter().copied().collect();
    slit_hdu.write_image(&mut fits, &slit)?;

    let order_hdu = fits.create_image("ORDER".to_string(), &description)?;
    let order: Vec<f64> = maps.order.iter().copied().collect();
    order_hdu.write_image(&mut fits, &order)?;
    Ok(())
}
