//! Linear algebra helpers for robust covariance square roots and gains.
//!
//! Public API:
//!     pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64>
//!     pub fn svd_square_root(matrix: &DMatrix<f64>, scale: f64) -> DMatrix<f64>
//!     pub fn pseudo_inverse(matrix: &DMatrix<f64>) -> DMatrix<f64>
//!     pub fn robust_gain(cross_covariance: &DMatrix<f64>, innovation_covariance: &DMatrix<f64>) -> DMatrix<f64>
//!
//! Strategy:
//! 1) Symmetrize P ← 0.5 (P + Pᵀ)
//! 2) SVD P = U S Vᵀ (bounded iterations, never panics)
//! 3) Clamp negative (eigenvalue sign recovered from U and V) or non-finite singular values to zero
//! 4) Symmetric root C = U sqrt(scale S) Uᵀ, or pseudo-inverse V S⁺ Uᵀ
//!
//! Covariances that drift indefinite or singular are therefore tolerated instead of aborting the
//! filter. Non-finite input short-circuits to a NaN result of the right shape.

use log::warn;
use nalgebra::{DMatrix, DVector};

/// Upper bound on SVD sweeps before falling back to the diagonal
const MAX_SVD_ITERATIONS: usize = 1000;
/// Relative cutoff below which singular values are treated as zero in [pseudo_inverse]
pub const PINV_RCOND: f64 = 1e-15;

/// Symmetrize a matrix: P ← 0.5 (P + Pᵀ)
///
/// Simple matrix symmetrization function that reduces round-off errors associated
/// with floating point arithmetic.
///
/// # Arguments
/// * `m` - the matrix to symmetrize
///
/// # Returns
/// A symmetrized version of the input matrix.
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}
/// True when every entry is finite
#[inline]
pub fn is_finite(m: &DMatrix<f64>) -> bool {
    m.iter().all(|v| v.is_finite())
}
/// Symmetric square root of `scale * matrix` via SVD
///
/// Computes `C = U * sqrt(scale * S) * Uᵀ` from the SVD of the symmetrized input, so that
/// `C * Cᵀ ≈ scale * P` whenever `P` is positive semi-definite. Negative or non-finite singular
/// values (and a non-positive scale) are clamped to zero and a warning is logged. The result is
/// symmetric, so its rows and columns are interchangeable.
///
/// # Arguments
/// * `matrix` - square matrix, typically a covariance.
/// * `scale` - the sigma point spread `n + λ`.
///
/// # Panics
/// When `matrix` is not square.
pub fn svd_square_root(matrix: &DMatrix<f64>, scale: f64) -> DMatrix<f64> {
    assert!(
        matrix.is_square(),
        "svd_square_root: matrix must be square"
    );
    let n = matrix.nrows();
    if !is_finite(matrix) || !scale.is_finite() {
        warn!("svd_square_root: non-finite input, propagating NaN");
        return DMatrix::from_element(n, n, f64::NAN);
    }
    let p = symmetrize(matrix);
    let Some(svd) = p
        .clone()
        .try_svd(true, true, f64::EPSILON, MAX_SVD_ITERATIONS)
    else {
        warn!("svd_square_root: SVD did not converge, using the diagonal");
        return diagonal_square_root(&p, scale);
    };
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return diagonal_square_root(&p, scale);
    };
    // For symmetric P the singular vectors pair up as v_i = ±u_i; the minus sign marks a negative
    // eigenvalue, which is clamped like any other negative value.
    let mut clamped = 0usize;
    let roots = DVector::from_iterator(
        n,
        svd.singular_values.iter().enumerate().map(|(i, &s)| {
            let signed = if u.column(i).dot(&v_t.row(i).transpose()) < 0.0 {
                -s
            } else {
                s
            };
            let scaled = scale * signed;
            if scaled.is_finite() && scaled >= 0.0 {
                scaled.sqrt()
            } else {
                clamped += 1;
                0.0
            }
        }),
    );
    if clamped > 0 {
        warn!("svd_square_root: clamped {clamped} singular value(s) to zero");
    }
    &u * DMatrix::from_diagonal(&roots) * u.transpose()
}
/// Fallback root of the clamped diagonal when the SVD fails to converge
fn diagonal_square_root(p: &DMatrix<f64>, scale: f64) -> DMatrix<f64> {
    let roots: DVector<f64> = p.diagonal().map(|v| (scale * v).max(0.0).sqrt());
    DMatrix::from_diagonal(&roots)
}
/// Moore-Penrose pseudo-inverse via SVD
///
/// `A⁺ = V * diag(1/s) * Uᵀ`, where singular values at or below `PINV_RCOND * max(s)` contribute
/// zero instead of their reciprocal. Works for rectangular and singular matrices and never panics.
/// Non-finite input yields a NaN matrix of the transposed shape. An SVD that fails to converge
/// yields zeros, which turns a Kalman gain into "no correction".
pub fn pseudo_inverse(matrix: &DMatrix<f64>) -> DMatrix<f64> {
    let (rows, cols) = matrix.shape();
    if !is_finite(matrix) {
        return DMatrix::from_element(cols, rows, f64::NAN);
    }
    let Some(svd) = matrix
        .clone()
        .try_svd(true, true, f64::EPSILON, MAX_SVD_ITERATIONS)
    else {
        warn!("pseudo_inverse: SVD did not converge, returning zeros");
        return DMatrix::zeros(cols, rows);
    };
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return DMatrix::zeros(cols, rows);
    };
    let largest = svd.singular_values.max();
    let tolerance = PINV_RCOND * largest;
    let mut discarded = 0usize;
    let inverted = svd.singular_values.map(|s| {
        if s > tolerance && s > 0.0 {
            1.0 / s
        } else {
            discarded += 1;
            0.0
        }
    });
    if discarded > 0 && largest > 0.0 {
        warn!("pseudo_inverse: discarded {discarded} singular direction(s)");
    }
    v_t.transpose() * DMatrix::from_diagonal(&inverted) * u.transpose()
}
/// Kalman gain `K = Pxz * S⁺` without ever forming a hard inverse
///
/// # Panics
/// When the column count of `cross_covariance` does not match `innovation_covariance`.
pub fn robust_gain(
    cross_covariance: &DMatrix<f64>,
    innovation_covariance: &DMatrix<f64>,
) -> DMatrix<f64> {
    assert!(
        innovation_covariance.is_square(),
        "robust_gain: innovation covariance must be square"
    );
    assert_eq!(
        cross_covariance.ncols(),
        innovation_covariance.nrows(),
        "robust_gain: incompatible dimensions"
    );
    cross_covariance * pseudo_inverse(&symmetrize(innovation_covariance))
}
