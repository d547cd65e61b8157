// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Small statistics helpers shared by the centroider and the fitter.

use crate::constants::MAD_TO_SIGMA;

/// The arithmetic mean. NaN for an empty slice.
pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// The median of a slice. NaN for an empty slice. The input is copied; NaNs
/// must have been filtered by the caller.
pub(crate) fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        0.5 * (sorted[n / 2 - 1] + sorted[n / 2])
    }
}

/// Standard deviation with `ddof` delta degrees of freedom (0 for the
/// population estimate, 1 for the sample estimate).
pub(crate) fn std_dev(values: &[f64], ddof: usize) -> f64 {
    if values.len() <= ddof {
        return f64::NAN;
    }
    let m = mean(values);
    let ss: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
    (ss / (values.len() - ddof) as f64).sqrt()
}

/// Robust standard deviation estimate from the median absolute deviation.
pub(crate) fn mad_std(values: &[f64]) -> f64 {
    let med = median(values);
    let deviations: Vec<f64> = values.iter().map(|v| (v - med).abs()).collect();
    median(&deviations) * MAD_TO_SIGMA
}

/// Summary statistics of a sigma-clipped sample.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClippedStats {
    pub(crate) mean: f64,
    pub(crate) median: f64,
    pub(crate) std: f64,
}

/// Iteratively sigma-clip `values` about the median until no more values are
/// rejected, then report the survivors' mean, median and (population)
/// standard deviation. Non-finite inputs are discarded up front.
pub(crate) fn sigma_clipped_stats(values: &[f64], sigma: f64) -> ClippedStats {
    let mut surviving: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();

    loop {
        if surviving.len() < 3 {
            break;
        }
        let med = median(&surviving);
        let std = std_dev(&surviving, 0);
        if std == 0.0 || !std.is_finite() {
            break;
        }
        let before = surviving.len();
        surviving.retain(|v| (v - med).abs() <= sigma * std);
        if surviving.len() == before {
            break;
        }
    }

    ClippedStats {
        mean: mean(&surviving),
        median: median(&surviving),
        std: std_dev(&surviving, 0),
    }
}
