// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Iterative robust fitting of the global dispersion polynomials.
//!
//! Two polynomials over a shared Chebyshev basis are fitted independently to
//! the observed x and y centroids. After each fit the combined residual
//! `r_xy = √(r_x² + r_y²)` is sigma-clipped about its median with the MAD as
//! scale estimator, clipped lines are dropped, and the fit repeats until an
//! iteration clips nothing or the iteration cap is reached.


use log::{debug, info};
use thiserror::Error;

use crate::centroid::DetectedLines;
use crate::math::{mad_std, mean, median, std_dev};
use crate::poly::{ChebyBasis, PolyError};
use crate::solutions::DispersionMap;

#[derive(Error, Debug)]
pub enum FitError {
    #[error("Non-finite value in fitter input column {column}, row {row}")]
    InvalidInput { column: &'static str, row: usize },

    #[error(
        "Only {rows} lines survive but the requested degrees need {ncoeffs} coefficients; \
         the fit is underdetermined"
    )]
    Underdetermined { rows: usize, ncoeffs: usize },

    #[error(transparent)]
    Poly(#[from] PolyError),
}

/// Robust scales below this \[pixels\] are treated as an exact fit.
const CLIP_SCALE_FLOOR: f64 = 1e-9;

/// Residual-clipping configuration.
#[derive(Debug, Clone, Copy)]
pub struct ClipConfig {
    /// Clip threshold in robust sigma.
    pub sigma: f64,
    /// Cap on fit/clip iterations.
    pub max_iters: usize,
}

/// Aggregate residual statistics of the final fit, in pixels. Per-axis
/// entries describe the absolute residuals.
#[derive(Debug, Clone, Copy)]
pub struct ResidualStats {
    pub x_min: f64,
    pub x_max: f64,
    pub x_std: f64,
    pub y_min: f64,
    pub y_max: f64,
    pub y_std: f64,
    pub xy_min: f64,
    pub xy_max: f64,
    pub xy_std: f64,
    pub xy_mean: f64,
    pub xy_median: f64,
}

/// A fitted dispersion solution with its post-clip diagnostics.
#[derive(Debug, Clone)]
pub struct FitSolution {
    pub map: DispersionMap,
    /// The lines that survived clipping.
    pub surviving: DetectedLines,
    /// Polynomial positions of the surviving lines.
    pub fit_x: Vec<f64>,
    pub fit_y: Vec<f64>,
    /// Per-line residuals of the surviving lines.
    pub residual_x: Vec<f64>,
    pub residual_y: Vec<f64>,
    pub residual_xy: Vec<f64>,
    pub stats: ResidualStats,
    pub iterations: usize,
    pub clipped_total: usize,
}

/// Fit the global x and y polynomials to the detected lines.
///
/// Not-detected rows are dropped up front; everything else must be finite.
/// A fit that would leave fewer lines than coefficients is fatal, as is a
/// rank-deficient system.
pub fn fit_dispersion_polynomials(
    lines: &DetectedLines,
    order_deg: usize,
    wavelength_deg: usize,
    slit_deg: usize,
    clip: &ClipConfig,
) -> Result<FitSolution, FitError> {
    let mut surviving = lines.drop_undetected();
    validate_finite(&surviving)?;

    // The normalisation domains come from the full detected table and stay
    // fixed across clip iterations.
    let basis = ChebyBasis::from_rows(
        order_deg,
        wavelength_deg,
        slit_deg,
        &surviving.lines.spectral_rows(),
    );
    let ncoeffs = basis.ncoeffs();
    info!(
        "Fitting dispersion polynomials: degrees ({order_deg}, {wavelength_deg}, {slit_deg}), \
         {ncoeffs} coefficients, {} lines",
        surviving.len()
    );

    let mut iteration = 0;
    let mut clipped_total = 0;
    loop {
        iteration += 1;
        if surviving.len() < ncoeffs {
            return Err(FitError::Underdetermined {
                rows: surviving.len(),
                ncoeffs,
            });
        }

        let rows = surviving.lines.spectral_rows();
        let xcoeffs = map_underdetermined(basis.fit(&rows, &surviving.observed_x, None), ncoeffs)?;
        let ycoeffs = map_underdetermined(basis.fit(&rows, &surviving.observed_y, None), ncoeffs)?;

        let fit_x = basis.evaluate(&xcoeffs, &rows)?;
        let fit_y = basis.evaluate(&ycoeffs, &rows)?;
        let residual_x: Vec<f64> = fit_x
            .iter()
            .zip(surviving.observed_x.iter())
            .map(|(f, o)| f - o)
            .collect();
        let residual_y: Vec<f64> = fit_y
            .iter()
            .zip(surviving.observed_y.iter())
            .map(|(f, o)| f - o)
            .collect();
        let residual_xy: Vec<f64> = residual_x
            .iter()
            .zip(residual_y.iter())
            .map(|(x, y)| x.hypot(*y))
            .collect();

        // Sigma-clip the combined residual about its median, scaled by the
        // MAD. Values exactly on the boundary are retained. A scale below
        // the floor means the fit is already exact to numerical precision;
        // clipping machine noise would never converge.
        let centre = median(&residual_xy);
        let scale = mad_std(&residual_xy);
        let keep: Vec<bool> = if scale > CLIP_SCALE_FLOOR && scale.is_finite() {
            residual_xy
                .iter()
                .map(|r| (r - centre).abs() <= clip.sigma * scale)
                .collect()
        } else {
            vec![true; residual_xy.len()]
        };
        let clipped = keep.iter().filter(|&&k| !k).count();
        clipped_total += clipped;
        info!("iteration {iteration:02}: {clipped} lines clipped from the dispersion fit");

        if clipped > 0 {
            surviving.lines.retain(&keep);
            retain_f64(&mut surviving.observed_x, &keep);
            retain_f64(&mut surviving.observed_y, &keep);
        }

        if clipped == 0 || iteration >= clip.max_iters {
            // The surviving table may have shrunk after the last fit;
            // restate the residuals on it.
            let rows = surviving.lines.spectral_rows();
            let fit_x = basis.evaluate(&xcoeffs, &rows)?;
            let fit_y = basis.evaluate(&ycoeffs, &rows)?;
            let residual_x: Vec<f64> = fit_x
                .iter()
                .zip(surviving.observed_x.iter())
                .map(|(f, o)| f - o)
                .collect();
            let residual_y: Vec<f64> = fit_y
                .iter()
                .zip(surviving.observed_y.iter())
                .map(|(f, o)| f - o)
                .collect();
            let residual_xy: Vec<f64> = residual_x
                .iter()
                .zip(residual_y.iter())
                .map(|(x, y)| x.hypot(*y))
                .collect();
            let stats = residual_stats(&residual_x, &residual_y, &residual_xy);
            debug!(
                "final fit: {} lines, σ(r_xy) = {:.4} px",
                surviving.len(),
                stats.xy_std
            );

            return Ok(FitSolution {
                map: DispersionMap {
                    basis,
                    xcoeffs,
                    ycoeffs,
                },
                surviving,
                fit_x,
                fit_y,
                residual_x,
                residual_y,
                residual_xy,
                stats,
                iterations: iteration,
                clipped_total,
            });
        }
    }
}

fn map_underdetermined(
    result: Result<Vec<f64>, PolyError>,
    ncoeffs: usize,
) -> Result<Vec<f64>, FitError> {
    result.map_err(|e| match e {
        PolyError::TooFewRows { rows, .. } => FitError::Underdetermined { rows, ncoeffs },
        other => FitError::Poly(other),
    })
}

fn retain_f64(values: &mut Vec<f64>, keep: &[bool]) {
    let mut it = keep.iter();
    values.retain(|_| *it.next().unwrap());
}

/// NaN or Inf anywhere in the fitter inputs is an error before the first
/// fit, not a quiet omission.
fn validate_finite(lines: &DetectedLines) -> Result<(), FitError> {
    let columns: [(&'static str, &[f64]); 4] = [
        ("wavelength", &lines.lines.wavelength),
        ("slit_position", &lines.lines.slit_position),
        ("observed_x", &lines.observed_x),
        ("observed_y", &lines.observed_y),
    ];
    for (column, values) in columns {
        if let Some(row) = values.iter().position(|v| !v.is_finite()) {
            return Err(FitError::InvalidInput { column, row });
        }
    }
    Ok(())
}

fn residual_stats(
    residual_x: &[f64],
    residual_y: &[f64],
    residual_xy: &[f64],
) -> ResidualStats {
    let abs_x: Vec<f64> = residual_x.iter().map(|r| r.abs()).collect();
    let abs_y: Vec<f64> = residual_y.iter().map(|r| r.abs()).collect();
    let min_of = |v: &[f64]| v.iter().copied().fold(f64::INFINITY, f64::min);
    let max_of = |v: &[f64]| v.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    ResidualStats {
        x_min: min_of(&abs_x),
        x_max: max_of(&abs_x),
        x_std: std_dev(&abs_x, 1),
        y_min: min_of(&abs_y),
        y_max: max_of(&abs_y),
        y_std: std_dev(&abs_y, 1),
        xy_min: min_of(residual_xy),
        xy_max: max_of(residual_xy),
        xy_std: std_dev(residual_xy, 1),
        xy_mean: mean(residual_xy),
        xy_median: median(residual_xy),
    }
}
