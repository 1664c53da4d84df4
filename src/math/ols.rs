//! Least squares solver and covariance helpers.
//!
//! In this project we repeatedly solve small linear regression problems of the form:
//!
//! ```text
//! minimize Σ (y_i - x_i^T β)^2
//! ```
//!
//! The pulse model is linear in (scales, pedestal) once the pulse times are
//! fixed, so we solve β once per trial time vector during the time search.
//!
//! Implementation choices:
//! - We use SVD so tall design matrices (many samples, 2-3 columns) are handled
//!   directly. (Nalgebra's `QR::solve` is intended for square systems and will
//!   panic for non-square matrices.)
//! - A rank-deficient design (two pulses at the same time, a template that is
//!   zero over the whole window) is reported as `None` instead of returning a
//!   minimum-norm solution. The fitter relies on that to flag the fit.

use nalgebra::{DMatrix, DVector};

/// Relative singular value cutoff below which a column is treated as degenerate.
const RANK_EPS: f64 = 1e-10;

/// Solve a least squares problem using SVD.
///
/// Returns `None` if the design matrix is rank deficient or the solution is not finite.
pub fn solve_least_squares(x: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
    if x.nrows() < x.ncols() || x.nrows() != y.len() {
        return None;
    }

    let svd = x.clone().svd(true, true);
    let max_sv = svd.singular_values.max();
    if !(max_sv.is_finite() && max_sv > 0.0) {
        return None;
    }
    let tol = max_sv * RANK_EPS;
    if svd.rank(tol) < x.ncols() {
        return None;
    }

    let beta = svd.solve(y, tol).ok()?;
    if beta.iter().all(|v| v.is_finite()) {
        Some(beta)
    } else {
        None
    }
}

/// Invert the Gauss-Newton information matrix `JᵀJ`.
///
/// With unit per-sample variance this is the parameter covariance at the optimum.
pub fn covariance_from_jacobian(jacobian: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let info = jacobian.transpose() * jacobian;
    let cov = info.try_inverse()?;
    if cov.iter().all(|v| v.is_finite()) {
        Some(cov)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn least_squares_solves_simple_system() {
        // Fit y = 2 + 3x on x = [0,1,2]
        let x = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0]);
        let y = DVector::from_row_slice(&[2.0, 5.0, 8.0]);

        let beta = solve_least_squares(&x, &y).unwrap();
        assert!((beta[0] - 2.0).abs() < 1e-10);
        assert!((beta[1] - 3.0).abs() < 1e-10);
    }

    #[test]
    fn least_squares_rejects_collinear_columns() {
        let x = DMatrix::from_row_slice(3, 2, &[1.0, 2.0, 2.0, 4.0, 3.0, 6.0]);
        let y = DVector::from_row_slice(&[1.0, 2.0, 3.0]);
        assert!(solve_least_squares(&x, &y).is_none());
    }

    #[test]
    fn covariance_of_straight_line_fit() {
        // Intercept/slope design on x = [-1, 0, 1]: JᵀJ = diag(3, 2).
        let j = DMatrix::from_row_slice(3, 2, &[1.0, -1.0, 1.0, 0.0, 1.0, 1.0]);
        let cov = covariance_from_jacobian(&j).unwrap();
        assert!((cov[(0, 0)] - 1.0 / 3.0).abs() < 1e-12);
        assert!((cov[(1, 1)] - 0.5).abs() < 1e-12);
        assert!(cov[(0, 1)].abs() < 1e-12);
    }
}
