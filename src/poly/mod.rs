// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The multivariate Chebyshev kernel behind every dispersion map.
//!
//! A dispersion polynomial is the tensor product of univariate Chebyshev
//! polynomials of the first kind in echelle order `m`, wavelength `λ` and
//! slit position `s`:
//!
//! ```text
//! P(m, λ, s) = Σ c_ijk T_i(m̂) T_j(λ̂) T_k(ŝ)
//! ```
//!
//! where the hatted variables are affinely rescaled to \[-1, 1\] over
//! per-catalogue domains. The domains are part of the basis and are persisted
//! with the fitted coefficients, so evaluation after a read round-trip is
//! bit-identical to evaluation before the write.
//!
//! Coefficients are flattened with `i` outermost and `k` innermost: `c_ijk`
//! lives at index `i*(d_λ+1)*(d_s+1) + j*(d_s+1) + k`.


use nalgebra::{DMatrix, DVector};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PolyError {
    #[error(
        "Coefficient vector has {got} entries; degrees ({order_deg}, {wavelength_deg}, \
         {slit_deg}) require {expected}"
    )]
    DegreeMismatch {
        got: usize,
        expected: usize,
        order_deg: usize,
        wavelength_deg: usize,
        slit_deg: usize,
    },

    #[error(
        "The least-squares system is rank-deficient (rank {rank} of {ncoeffs}); the line \
         sample cannot constrain these degrees"
    )]
    SingularSystem { rank: usize, ncoeffs: usize },

    #[error("Row table columns have mismatched lengths ({0} vs {1})")]
    ColumnLengths(usize, usize),

    #[error("{rows} rows cannot constrain {ncoeffs} coefficients")]
    TooFewRows { rows: usize, ncoeffs: usize },
}

/// An inclusive variable range used to rescale inputs to \[-1, 1\].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Domain {
    pub min: f64,
    pub max: f64,
}

impl Domain {
    /// The smallest domain covering `values`. A degenerate domain (all values
    /// equal, e.g. the slit variable of a single-pinhole fit) is allowed.
    pub fn from_values<I: IntoIterator<Item = f64>>(values: I) -> Domain {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for v in values {
            min = min.min(v);
            max = max.max(v);
        }
        Domain { min, max }
    }

    /// Rescale `v` onto \[-1, 1\]. Values outside the domain extrapolate
    /// beyond ±1, which the Chebyshev recurrence handles without complaint.
    /// A degenerate domain maps everything to 0.
    #[inline]
    pub fn normalise(&self, v: f64) -> f64 {
        let span = self.max - self.min;
        if span <= 0.0 {
            0.0
        } else {
            2.0 * (v - self.min) / span - 1.0
        }
    }
}

/// A borrowed view of the `(m, λ, s)` columns of a line table.
#[derive(Debug, Clone, Copy)]
pub struct SpectralRows<'a> {
    pub order: &'a [i32],
    pub wavelength: &'a [f64],
    pub slit_position: &'a [f64],
}

impl<'a> SpectralRows<'a> {
    pub fn new(
        order: &'a [i32],
        wavelength: &'a [f64],
        slit_position: &'a [f64],
    ) -> Result<SpectralRows<'a>, PolyError> {
        if order.len() != wavelength.len() {
            return Err(PolyError::ColumnLengths(order.len(), wavelength.len()));
        }
        if order.len() != slit_position.len() {
            return Err(PolyError::ColumnLengths(order.len(), slit_position.len()));
        }
        Ok(SpectralRows {
            order,
            wavelength,
            slit_position,
        })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Degrees and normalisation domains of one tensor-product Chebyshev basis.
#[derive(Debug, Clone, PartialEq)]
pub struct ChebyBasis {
    pub order_deg: usize,
    pub wavelength_deg: usize,
    pub slit_deg: usize,
    pub order_domain: Domain,
    pub wavelength_domain: Domain,
    pub slit_domain: Domain,
}

impl ChebyBasis {
    /// Build a basis whose domains are taken from the rows that will be
    /// fitted.
    pub fn from_rows(
        order_deg: usize,
        wavelength_deg: usize,
        slit_deg: usize,
        rows: &SpectralRows,
    ) -> ChebyBasis {
        ChebyBasis {
            order_deg,
            wavelength_deg,
            slit_deg,
            order_domain: Domain::from_values(rows.order.iter().map(|&o| f64::from(o))),
            wavelength_domain: Domain::from_values(rows.wavelength.iter().copied()),
            slit_domain: Domain::from_values(rows.slit_position.iter().copied()),
        }
    }

    /// The number of coefficients this basis carries:
    /// `(d_m+1)(d_λ+1)(d_s+1)`.
    pub fn ncoeffs(&self) -> usize {
        (self.order_deg + 1) * (self.wavelength_deg + 1) * (self.slit_deg + 1)
    }

    /// Fill `row` with the flattened basis-function values at one sample.
    /// `row` must have length `ncoeffs()`.
    fn design_row(&self, order: f64, wavelength: f64, slit: f64, row: &mut [f64]) {
        debug_assert_eq!(row.len(), self.ncoeffs());
        let tm = cheb_values(self.order_domain.normalise(order), self.order_deg);
        let tl = cheb_values(self.wavelength_domain.normalise(wavelength), self.wavelength_deg);
        let ts = cheb_values(self.slit_domain.normalise(slit), self.slit_deg);

        let mut idx = 0;
        for &tmi in &tm {
            for &tlj in &tl {
                for &tsk in &ts {
                    row[idx] = tmi * tlj * tsk;
                    idx += 1;
                }
            }
        }
    }

    /// Evaluate the polynomial with `coeffs` at every row.
    pub fn evaluate(&self, coeffs: &[f64], rows: &SpectralRows) -> Result<Vec<f64>, PolyError> {
        self.check_coeffs(coeffs)?;
        let ncoeffs = self.ncoeffs();
        let mut design = vec![0.0; ncoeffs];
        let mut values = Vec::with_capacity(rows.len());
        for i in 0..rows.len() {
            self.design_row(
                f64::from(rows.order[i]),
                rows.wavelength[i],
                rows.slit_position[i],
                &mut design,
            );
            let v: f64 = design.iter().zip(coeffs.iter()).map(|(d, c)| d * c).sum();
            values.push(v);
        }
        Ok(values)
    }

    /// Linear least-squares fit of the polynomial to `targets`. Weights are
    /// optional; when given they multiply each row's contribution
    /// (uniform weighting when `None`).
    ///
    /// Rank deficiency of the design matrix is a hard
    /// [`PolyError::SingularSystem`]; the caller must not fall back
    /// silently.
    pub fn fit(
        &self,
        rows: &SpectralRows,
        targets: &[f64],
        weights: Option<&[f64]>,
    ) -> Result<Vec<f64>, PolyError> {
        if rows.len() != targets.len() {
            return Err(PolyError::ColumnLengths(rows.len(), targets.len()));
        }
        let ncoeffs = self.ncoeffs();
        if rows.len() < ncoeffs {
            return Err(PolyError::TooFewRows {
                rows: rows.len(),
                ncoeffs,
            });
        }

        let mut design = DMatrix::<f64>::zeros(rows.len(), ncoeffs);
        let mut rhs = DVector::<f64>::zeros(rows.len());
        let mut row_buf = vec![0.0; ncoeffs];
        for i in 0..rows.len() {
            self.design_row(
                f64::from(rows.order[i]),
                rows.wavelength[i],
                rows.slit_position[i],
                &mut row_buf,
            );
            let w = weights.map_or(1.0, |w| w[i].sqrt());
            for (j, &v) in row_buf.iter().enumerate() {
                design[(i, j)] = v * w;
            }
            rhs[i] = targets[i] * w;
        }

        let svd = design.svd(true, true);
        let max_sv = svd.singular_values.iter().copied().fold(0.0, f64::max);
        let tolerance = max_sv * f64::EPSILON * rows.len().max(ncoeffs) as f64;
        let rank = svd.rank(tolerance);
        if rank < ncoeffs {
            return Err(PolyError::SingularSystem { rank, ncoeffs });
        }
        let solution = svd
            .solve(&rhs, tolerance)
            .map_err(|_| PolyError::SingularSystem { rank, ncoeffs })?;
        Ok(solution.iter().copied().collect())
    }

    /// Per-row residuals `P(row) - target`.
    pub fn residuals(
        &self,
        coeffs: &[f64],
        rows: &SpectralRows,
        targets: &[f64],
    ) -> Result<Vec<f64>, PolyError> {
        if rows.len() != targets.len() {
            return Err(PolyError::ColumnLengths(rows.len(), targets.len()));
        }
        let predicted = self.evaluate(coeffs, rows)?;
        Ok(predicted
            .iter()
            .zip(targets.iter())
            .map(|(p, t)| p - t)
            .collect())
    }

    fn check_coeffs(&self, coeffs: &[f64]) -> Result<(), PolyError> {
        if coeffs.len() != self.ncoeffs() {
            return Err(PolyError::DegreeMismatch {
                got: coeffs.len(),
                expected: self.ncoeffs(),
                order_deg: self.order_deg,
                wavelength_deg: self.wavelength_deg,
                slit_deg: self.slit_deg,
            });
        }
        Ok(())
    }
}

/// `T_0(t) .. T_deg(t)` by the three-term recurrence.
fn cheb_values(t: f64, deg: usize) -> Vec<f64> {
    let mut values = Vec::with_capacity(deg + 1);
    values.push(1.0);
    if deg >= 1 {
        values.push(t);
    }
    for n in 2..=deg {
        let next = 2.0 * t * values[n - 1] - values[n - 2];
        values.push(next);
    }
    values
}
