// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Absorbing the rigid instrument shift between pinhole exposures.
//!
//! The multi-pinhole frame is taken after the single-pinhole frame that
//! produced the prior dispersion solution, and the instrument can drift a
//! few pixels in between. The prior map already encodes where the mid-slit
//! lines actually fell, so before any detection the predicted guesses are
//! referenced against it: per line, the offset between the static catalogue
//! guess and the prior-map prediction (on the mid-slit subset) is subtracted
//! from every row of that line. Lines with no usable reference are dropped
//! rather than guessed at. The polynomial fit itself is untouched; only the
//! detection seeds move.

use log::{debug, info};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::catalogue::LineTable;
use crate::math::median;
use crate::poly::PolyError;
use crate::solutions::DispersionMap;

#[derive(Error, Debug)]
pub enum ShiftError {
    #[error("The prior dispersion map evaluates off-detector for every predicted line")]
    NothingOnDetector,

    #[error(
        "The predicted list has no mid-slit rows the prior solution can evaluate; cannot \
         reference it against the prior"
    )]
    NoShiftReference,

    #[error(transparent)]
    Poly(#[from] PolyError),
}

/// The shifted line list plus bookkeeping about what moved.
#[derive(Debug, Clone)]
pub struct ShiftOutcome {
    pub shifted: LineTable,
    /// Median applied correction, for the log and QC.
    pub median_dx: f64,
    pub median_dy: f64,
    /// Rows dropped for want of a reference offset.
    pub rows_dropped: usize,
}

/// Shift every predicted guess by its line's offset between catalogue
/// prediction and prior-map prediction, measured on the mid-slit subset.
pub fn estimate_and_apply_shift(
    table: &LineTable,
    prior: &DispersionMap,
    mid_slit_index: i32,
) -> Result<ShiftOutcome, ShiftError> {
    // Prior prediction for every line; lines the prior maps off the
    // detector carry no information and are dropped up front.
    let (fit_x, fit_y) = prior.evaluate(&table.spectral_rows())?;
    let on_detector: Vec<bool> = fit_x
        .iter()
        .zip(fit_y.iter())
        .map(|(&x, &y)| x > 0.0 && y > 0.0)
        .collect();
    let mut table = table.clone();
    table.retain(&on_detector);
    if table.is_empty() {
        return Err(ShiftError::NothingOnDetector);
    }
    let fit_x: Vec<f64> = fit_x
        .into_iter()
        .zip(on_detector.iter())
        .filter(|(_, &keep)| keep)
        .map(|(v, _)| v)
        .collect();
    let fit_y: Vec<f64> = fit_y
        .into_iter()
        .zip(on_detector.iter())
        .filter(|(_, &keep)| keep)
        .map(|(v, _)| v)
        .collect();

    // Per-line offsets from the mid-slit subset. Keying on the exact
    // wavelength bits is safe because every row of one line carries the
    // identical catalogue wavelength.
    let mut offsets: BTreeMap<(i32, u64), (f64, f64)> = BTreeMap::new();
    for i in 0..table.len() {
        if table.slit_index[i] != mid_slit_index {
            continue;
        }
        offsets.insert(
            (table.order[i], table.wavelength[i].to_bits()),
            (
                table.detector_x[i] - fit_x[i],
                table.detector_y[i] - fit_y[i],
            ),
        );
    }
    if offsets.is_empty() {
        return Err(ShiftError::NoShiftReference);
    }

    let mut shifted = table.clone();
    let mut keep = vec![false; table.len()];
    let mut applied_dx = vec![];
    let mut applied_dy = vec![];
    for i in 0..table.len() {
        if let Some(&(dx, dy)) = offsets.get(&(table.order[i], table.wavelength[i].to_bits())) {
            shifted.detector_x[i] -= dx;
            shifted.detector_y[i] -= dy;
            keep[i] = true;
            applied_dx.push(-dx);
            applied_dy.push(-dy);
        }
    }
    shifted.retain(&keep);
    let rows_dropped = table.len() - shifted.len();

    let median_dx = median(&applied_dx);
    let median_dy = median(&applied_dy);
    info!(
        "Prior-solution shift: median correction ({median_dx:.3}, {median_dy:.3}) px over {} \
         reference lines; {rows_dropped} rows dropped",
        offsets.len()
    );
    debug!("{} predicted rows remain after shifting", shifted.len());

    Ok(ShiftOutcome {
        shifted,
        median_dx,
        median_dy,
        rows_dropped,
    })
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::poly::{ChebyBasis, Domain, SpectralRows};

    /// A prior map over a 160x160 detector: x tracks wavelength, y tracks
    /// order, no slit dependence (single-pinhole solution).
    fn prior_map() -> DispersionMap {
        let basis = ChebyBasis {
            order_deg: 1,
            wavelength_deg: 1,
            slit_deg: 0,
            order_domain: Domain {
                min: 10.0,
                max: 12.0,
            },
            wavelength_domain: Domain {
                min: 500.0,
                max: 560.0,
            },
            slit_domain: Domain { min: 0.0, max: 0.0 },
        };
        DispersionMap {
            xcoeffs: vec![80.0, 50.0, 0.0, 0.0],
            ycoeffs: vec![80.0, 0.0, 45.0, 0.0],
            basis,
        }
    }

    /// A predicted table whose guesses sit `offset` pixels in x away from
    /// the prior prediction.
    fn predicted_table(offset_x: f64, offset_y: f64) -> LineTable {
        let mut table = LineTable::default();
        for order in 10..=12_i32 {
            for w in 0..4 {
                let wavelength = 505.0 + f64::from(w) * 15.0;
                for slit_index in 0..3_i32 {
                    table.order.push(order);
                    table.wavelength.push(wavelength);
                    table.slit_index.push(slit_index);
                    table.slit_position.push(f64::from(slit_index) - 1.0);
                    table.detector_x.push(0.0);
                    table.detector_y.push(0.0);
                }
            }
        }
        let rows = SpectralRows::new(&table.order, &table.wavelength, &table.slit_position)
            .unwrap();
        let (fit_x, fit_y) = prior_map().evaluate(&rows).unwrap();
        table.detector_x = fit_x.iter().map(|x| x + offset_x).collect();
        table.detector_y = fit_y.iter().map(|y| y + offset_y).collect();
        table
    }

    #[test]
    fn catalogue_offset_is_absorbed() {
        let map = prior_map();
        let table = predicted_table(3.7, -2.1);

        let outcome = estimate_and_apply_shift(&table, &map, 1).unwrap();
        assert_eq!(outcome.shifted.len(), table.len());
        assert_abs_diff_eq!(outcome.median_dx, -3.7, epsilon = 1e-9);
        assert_abs_diff_eq!(outcome.median_dy, 2.1, epsilon = 1e-9);

        // Every guess lands back on the prior prediction; the mid-slit rows
        // exactly, and in this slit-independent catalogue all rows share
        // the mid line's offset.
        let rows = SpectralRows::new(
            &outcome.shifted.order,
            &outcome.shifted.wavelength,
            &outcome.shifted.slit_position,
        )
        .unwrap();
        let (fit_x, fit_y) = map.evaluate(&rows).unwrap();
        for i in 0..outcome.shifted.len() {
            assert_abs_diff_eq!(outcome.shifted.detector_x[i], fit_x[i], epsilon = 1e-9);
            assert_abs_diff_eq!(outcome.shifted.detector_y[i], fit_y[i], epsilon = 1e-9);
        }
    }

    #[test]
    fn off_mid_rows_follow_their_line_offset() {
        let map = prior_map();
        let mut table = predicted_table(0.0, 0.0);
        // Give the off-mid pinholes of one line a slit-dependent spread as
        // a multi-pinhole catalogue has; the mid row of that line gets an
        // offset of +2 which must propagate to its siblings.
        for i in 0..table.len() {
            if table.order[i] == 11 && table.wavelength[i] == 520.0 {
                table.detector_x[i] += 2.0;
            }
        }

        let outcome = estimate_and_apply_shift(&table, &map, 1).unwrap();
        // The +2 line was corrected back onto the prior for all three of
        // its rows.
        let rows = SpectralRows::new(
            &outcome.shifted.order,
            &outcome.shifted.wavelength,
            &outcome.shifted.slit_position,
        )
        .unwrap();
        let (fit_x, _) = map.evaluate(&rows).unwrap();
        for i in 0..outcome.shifted.len() {
            assert_abs_diff_eq!(outcome.shifted.detector_x[i], fit_x[i], epsilon = 1e-9);
        }
    }

    #[test]
    fn rows_without_mid_reference_are_dropped() {
        let map = prior_map();
        let mut table = predicted_table(1.0, 0.0);
        // Remove the mid-slit row of one line; its two siblings lose their
        // reference.
        let keep: Vec<bool> = (0..table.len())
            .map(|i| {
                !(table.slit_index[i] == 1
                    && table.order[i] == 10
                    && table.wavelength[i] == 505.0)
            })
            .collect();
        table.retain(&keep);

        let outcome = estimate_and_apply_shift(&table, &map, 1).unwrap();
        assert_eq!(outcome.rows_dropped, 2);
        assert!(!outcome
            .shifted
            .order
            .iter()
            .zip(outcome.shifted.wavelength.iter())
            .any(|(&o, &w)| o == 10 && w == 505.0));
    }

    #[test]
    fn prior_mapping_everything_off_detector_is_an_error() {
        let mut map = prior_map();
        map.xcoeffs[0] = -5000.0;
        let table = predicted_table(0.0, 0.0);

        match estimate_and_apply_shift(&table, &map, 1) {
            Err(ShiftError::NothingOnDetector) => (),
            other => panic!("expected NothingOnDetector, got {:?}", other),
        }
    }

    #[test]
    fn missing_mid_slit_subset_is_an_error() {
        let map = prior_map();
        let mut table = predicted_table(0.0, 0.0);
        let keep: Vec<bool> = table.slit_index.iter().map(|&k| k != 1).collect();
        table.retain(&keep);

        match estimate_and_apply_shift(&table, &map, 1) {
            Err(ShiftError::NoShiftReference) => (),
            other => panic!("expected NoShiftReference, got {:?}", other),
        }
    }
}
