// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Sub-pixel centroiding of predicted arc lines.
//!
//! For each predicted line a small square stamp is clipped around the
//! catalogue guess, the background is estimated with iterative sigma
//! clipping, and a Gaussian-kernel peak search finds point sources in the
//! background-subtracted stamp. The source closest to the stamp centre wins.
//! Predicted positions are good to a few pixels, so a tight window and a hard
//! threshold keep the search cheap and avoid cross-order confusion.
//!
//! Centroiding is best-effort per line: a line that cannot be measured stays
//! in the table flagged as not-detected and is dropped before fitting.


use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use log::{debug, info};
use ndarray::{azip, prelude::*};
use rayon::prelude::*;

use crate::catalogue::LineTable;
use crate::constants::{
    BACKGROUND_CLIP_SIGMA, CENTROID_FWHM, CENTROID_THRESHOLD_SIGMA, ROUNDNESS_LIMIT,
    SHARPNESS_LIMIT,
};
use crate::context::Frame;
use crate::math::sigma_clipped_stats;

/// The predicted table with observed centroids appended. `observed_x` and
/// `observed_y` are NaN for lines that could not be measured.
#[derive(Debug, Clone)]
pub struct DetectedLines {
    pub lines: LineTable,
    pub observed_x: Vec<f64>,
    pub observed_y: Vec<f64>,
}

impl DetectedLines {
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// The number of lines with a measured centroid.
    pub fn detected_count(&self) -> usize {
        self.observed_x.iter().filter(|x| x.is_finite()).count()
    }

    /// Detected lines as a fraction of the predicted list.
    pub fn detected_fraction(&self) -> f64 {
        if self.is_empty() {
            0.0
        } else {
            self.detected_count() as f64 / self.len() as f64
        }
    }

    /// A copy with the not-detected rows removed.
    pub fn drop_undetected(&self) -> DetectedLines {
        let keep: Vec<bool> = self.observed_x.iter().map(|x| x.is_finite()).collect();
        let mut lines = self.lines.clone();
        lines.retain(&keep);
        let observed_x = self
            .observed_x
            .iter()
            .zip(keep.iter())
            .filter(|(_, &k)| k)
            .map(|(&x, _)| x)
            .collect();
        let observed_y = self
            .observed_y
            .iter()
            .zip(keep.iter())
            .filter(|(_, &k)| k)
            .map(|(&y, _)| y)
            .collect();
        DetectedLines {
            lines,
            observed_x,
            observed_y,
        }
    }
}

/// A source found by the peak search, in stamp coordinates.
#[derive(Debug, Clone, Copy)]
pub struct Peak {
    pub x: f64,
    pub y: f64,
    pub amplitude: f64,
    pub sharpness: f64,
    pub roundness: f64,
}

/// Detect every predicted line on the frame. The result keeps the input
/// row order; lines that cannot be measured carry NaN centroids.
pub fn detect_lines(frame: &Frame, table: &LineTable, window_size: usize) -> DetectedLines {
    let half = (window_size / 2) as i64;
    let finder = GaussianPeakFinder::new(CENTROID_FWHM);

    info!("Detecting {} predicted arc lines", table.len());
    let bar = ProgressBar::new(table.len() as u64).with_style(
        ProgressStyle::with_template(
            "{msg:17}: [{wide_bar:.blue}] {pos:5}/{len:5} lines ({elapsed_precise})",
        )
        .unwrap()
        .progress_chars("=> "),
    );
    bar.set_message("Centroiding");

    let centroids: Vec<Option<(f64, f64)>> = (0..table.len())
        .into_par_iter()
        .progress_with(bar)
        .map(|i| centroid_one_line(frame, &finder, table.detector_x[i], table.detector_y[i], half))
        .collect();

    let observed_x = centroids
        .iter()
        .map(|c| c.map_or(f64::NAN, |(x, _)| x))
        .collect();
    let observed_y = centroids
        .iter()
        .map(|c| c.map_or(f64::NAN, |(_, y)| y))
        .collect();
    let detected = DetectedLines {
        lines: table.clone(),
        observed_x,
        observed_y,
    };
    info!(
        "Detected {}/{} lines ({:.1}%)",
        detected.detected_count(),
        detected.len(),
        detected.detected_fraction() * 100.0
    );
    detected
}

/// Centroid a single line. `None` when the stamp is clipped by the frame
/// edge or no acceptable source is found.
fn centroid_one_line(
    frame: &Frame,
    finder: &GaussianPeakFinder,
    guess_x: f64,
    guess_y: f64,
    half: i64,
) -> Option<(f64, f64)> {
    let (height, width) = frame.shape();
    if !guess_x.is_finite() || !guess_y.is_finite() {
        return None;
    }

    // A full stamp of side 2*half+1; a stamp clipped by the frame edge is
    // not usable.
    let cx = guess_x.round() as i64;
    let cy = guess_y.round() as i64;
    let (xlow, xup) = (cx - half, cx + half + 1);
    let (ylow, yup) = (cy - half, cy + half + 1);
    if xlow < 0 || ylow < 0 || xup > width as i64 || yup > height as i64 {
        return None;
    }
    let (xlow, xup, ylow, yup) = (xlow as usize, xup as usize, ylow as usize, yup as usize);

    let mut stamp = frame
        .data
        .slice(s![ylow..yup, xlow..xup])
        .to_owned();
    let stamp_mask = frame.mask.slice(s![ylow..yup, xlow..xup]);

    let good: Vec<f64> = stamp
        .iter()
        .zip(stamp_mask.iter())
        .filter(|(_, &bad)| !bad)
        .map(|(&v, _)| v)
        .collect();
    if good.len() < 9 {
        return None;
    }
    let stats = sigma_clipped_stats(&good, BACKGROUND_CLIP_SIGMA);
    if !stats.std.is_finite() {
        return None;
    }

    // Bad pixels take the background value so they neither trigger nor
    // suppress a detection.
    azip!((value in &mut stamp, &bad in &stamp_mask) {
        if bad {
            *value = stats.median;
        }
    });
    stamp.mapv_inplace(|v| v - stats.median);

    let threshold = CENTROID_THRESHOLD_SIGMA * stats.std;
    let peaks = finder.detect(stamp.view(), threshold);
    if peaks.is_empty() {
        return None;
    }

    // Multiple sources can fall in one stamp near order crossings; take the
    // one closest to the stamp centre.
    let centre = half as f64;
    let best = peaks
        .iter()
        .min_by(|a, b| {
            let da = (a.x - centre).powi(2) + (a.y - centre).powi(2);
            let db = (b.x - centre).powi(2) + (b.y - centre).powi(2);
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        })
        .copied()?;
    debug!(
        "line at guess ({guess_x:.1}, {guess_y:.1}): centroid ({:.2}, {:.2}), amp {:.1}",
        best.x + xlow as f64,
        best.y + ylow as f64,
        best.amplitude
    );
    Some((best.x + xlow as f64, best.y + ylow as f64))
}

/// A 2D Gaussian matched-filter peak finder.
///
/// The background-subtracted stamp is cross-correlated with a zero-sum
/// Gaussian kernel of the configured FWHM; maxima of the correlation above
/// the detection threshold are candidate sources, filtered on sharpness and
/// roundness, and centroided with Gaussian-weighted first moments.
pub struct GaussianPeakFinder {
    sigma: f64,
    radius: i64,
    roundness_limit: f64,
    sharpness_limit: f64,
}

impl GaussianPeakFinder {
    pub fn new(fwhm: f64) -> GaussianPeakFinder {
        let sigma = fwhm / (8.0 * std::f64::consts::LN_2).sqrt();
        GaussianPeakFinder {
            sigma,
            radius: ((1.5 * sigma).ceil() as i64).max(2),
            roundness_limit: ROUNDNESS_LIMIT,
            sharpness_limit: SHARPNESS_LIMIT,
        }
    }

    /// Find sources in a background-subtracted stamp.
    pub fn detect(&self, stamp: ArrayView2<f64>, threshold: f64) -> Vec<Peak> {
        let (height, width) = stamp.dim();
        let r = self.radius as usize;
        let side = 2 * r + 1;
        if height < side || width < side || threshold <= 0.0 {
            return vec![];
        }

        // Zero-sum ("lowered") kernel: correlating with it estimates the
        // amplitude of a Gaussian of the configured width at each position.
        let mut kernel = Array2::<f64>::zeros((side, side));
        for dy in 0..side {
            for dx in 0..side {
                let fy = dy as f64 - r as f64;
                let fx = dx as f64 - r as f64;
                kernel[[dy, dx]] = (-(fx * fx + fy * fy) / (2.0 * self.sigma * self.sigma)).exp();
            }
        }
        let kernel_mean = kernel.mean().unwrap_or(0.0);
        let lowered = kernel.mapv(|g| g - kernel_mean);
        let denom: f64 = lowered.iter().map(|k| k * k).sum();
        if denom <= 0.0 {
            return vec![];
        }

        // The correlation image, valid region only.
        let mut density = Array2::<f64>::from_elem((height, width), f64::NEG_INFINITY);
        for y in r..height - r {
            for x in r..width - r {
                let window = stamp.slice(s![y - r..y + r + 1, x - r..x + r + 1]);
                let num: f64 = window.iter().zip(lowered.iter()).map(|(d, k)| d * k).sum();
                density[[y, x]] = num / denom;
            }
        }

        let mut peaks = vec![];
        for y in r..height - r {
            for x in r..width - r {
                let h = density[[y, x]];
                if h < threshold {
                    continue;
                }
                // Strict local maximum over the 8-neighbourhood.
                let mut is_max = true;
                'neighbours: for dy in -1_i64..=1 {
                    for dx in -1_i64..=1 {
                        if dy == 0 && dx == 0 {
                            continue;
                        }
                        let ny = (y as i64 + dy) as usize;
                        let nx = (x as i64 + dx) as usize;
                        if density[[ny, nx]] > h {
                            is_max = false;
                            break 'neighbours;
                        }
                    }
                }
                if !is_max {
                    continue;
                }

                if let Some(peak) = self.measure(&stamp, &kernel, y, x, h) {
                    peaks.push(peak);
                }
            }
        }
        peaks
    }

    /// Sharpness, roundness and moment centroid of one candidate, or `None`
    /// when the source fails the shape cuts.
    fn measure(
        &self,
        stamp: &ArrayView2<f64>,
        kernel: &Array2<f64>,
        y: usize,
        x: usize,
        amplitude: f64,
    ) -> Option<Peak> {
        let r = self.radius as usize;
        let side = 2 * r + 1;
        let window = stamp.slice(s![y - r..y + r + 1, x - r..x + r + 1]);

        // Sharpness: the peak pixel against the mean of its window
        // neighbours, scaled by the fitted amplitude. Cosmic-ray hits score
        // high, extended blends score low.
        let peak_value = window[[r, r]];
        let neighbour_sum: f64 = window.iter().sum::<f64>() - peak_value;
        let neighbour_mean = neighbour_sum / (side * side - 1) as f64;
        let sharpness = (peak_value - neighbour_mean) / amplitude;
        if sharpness.abs() > self.sharpness_limit {
            return None;
        }

        // Roundness from the marginal Gaussian amplitudes: a round source
        // fits the same amplitude in x and y.
        let g1: Vec<f64> = (0..side)
            .map(|i| {
                let f = i as f64 - r as f64;
                (-(f * f) / (2.0 * self.sigma * self.sigma)).exp()
            })
            .collect();
        let g1_mean = g1.iter().sum::<f64>() / side as f64;
        let k1: Vec<f64> = g1.iter().map(|g| g - g1_mean).collect();
        let denom1: f64 = k1.iter().map(|k| k * k).sum();

        let marginal_x: Vec<f64> = (0..side).map(|i| window.column(i).sum()).collect();
        let marginal_y: Vec<f64> = (0..side).map(|i| window.row(i).sum()).collect();
        let hx: f64 = marginal_x
            .iter()
            .zip(k1.iter())
            .map(|(m, k)| m * k)
            .sum::<f64>()
            / denom1;
        let hy: f64 = marginal_y
            .iter()
            .zip(k1.iter())
            .map(|(m, k)| m * k)
            .sum::<f64>()
            / denom1;
        if hx <= 0.0 || hy <= 0.0 {
            return None;
        }
        let roundness = 2.0 * (hx - hy) / (hx + hy);
        if roundness.abs() > self.roundness_limit {
            return None;
        }

        // Gaussian-weighted first moments for the sub-pixel centroid;
        // negative residual pixels carry no weight.
        let mut wsum = 0.0;
        let mut wx = 0.0;
        let mut wy = 0.0;
        for dy in 0..side {
            for dx in 0..side {
                let w = kernel[[dy, dx]] * window[[dy, dx]].max(0.0);
                wsum += w;
                wx += w * (dx as f64 - r as f64);
                wy += w * (dy as f64 - r as f64);
            }
        }
        if wsum <= 0.0 {
            return None;
        }

        Some(Peak {
            x: x as f64 + wx / wsum,
            y: y as f64 + wy / wsum,
            amplitude,
            sharpness,
            roundness,
        })
    }
}
