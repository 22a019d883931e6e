//! Sigma point engine
//!
//! Deterministic sampling of a Gaussian belief for the unscented transform. Given a mean $\mu$ and
//! covariance $P$ of dimension $n$, the scaled unscented transform places $2n + 1$ points
//!
//! $$
//! \chi_0 = \mu, \quad \chi_{k+1} = \mu + C_k, \quad \chi_{n+k+1} = \mu - C_k
//! $$
//!
//! where $C$ is the symmetric square root of $(n + \lambda) P$ and $C_k$ its $k$-th column. The
//! spread parameter is $\lambda = \alpha^2 (n + \kappa) - n$ and the weights are
//!
//! $$
//! w^m_0 = \frac{\lambda}{n + \lambda}, \quad w^c_0 = w^m_0 + 1 - \alpha^2 + \beta, \quad
//! w^m_i = w^c_i = \frac{1}{2 (n + \lambda)}
//! $$
//!
//! The square root is taken through an SVD ([crate::linalg::svd_square_root]) rather than a Cholesky
//! factorization so that indefinite or singular covariances never abort the filter. Points are stored
//! as the columns of a `DMatrix` with $n$ rows.
use std::fmt::{self, Debug, Display};

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::linalg::svd_square_root;

/// Scaling parameters of the unscented transform
///
/// `kappa = None` selects the common default `3 - n`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SigmaParameters {
    pub alpha: f64,
    pub beta: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kappa: Option<f64>,
}

impl SigmaParameters {
    pub fn new(alpha: f64, beta: f64, kappa: Option<f64>) -> Self {
        SigmaParameters { alpha, beta, kappa }
    }
    /// Parameters used on the very first filter step
    pub fn initial() -> Self {
        SigmaParameters::new(0.6, 2.0, Some(-3.0))
    }
    /// Parameters used on every later step and by the smoother
    pub fn steady() -> Self {
        SigmaParameters::new(0.3, 2.0, None)
    }
    /// Resolved κ for a state of dimension `n`
    pub fn kappa_for(&self, n: usize) -> f64 {
        self.kappa.unwrap_or(3.0 - n as f64)
    }
    /// λ = α²(n + κ) − n
    pub fn lambda_for(&self, n: usize) -> f64 {
        let n_f = n as f64;
        self.alpha * self.alpha * (n_f + self.kappa_for(n)) - n_f
    }
}

impl Default for SigmaParameters {
    fn default() -> Self {
        SigmaParameters::steady()
    }
}

/// Mean and covariance weights of a sigma point set
#[derive(Clone, PartialEq)]
pub struct SigmaWeights {
    pub mean: DVector<f64>,
    pub covariance: DVector<f64>,
    pub lambda: f64,
    state_size: usize,
}

impl Debug for SigmaWeights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigmaWeights")
            .field("state_size", &self.state_size)
            .field("lambda", &self.lambda)
            .field("wm0", &self.mean[0])
            .field("wc0", &self.covariance[0])
            .field("wi", &self.mean.get(1).copied().unwrap_or(f64::NAN))
            .finish()
    }
}

impl Display for SigmaWeights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SigmaWeights(n = {}, lambda = {:.6}, wm0 = {:.6}, wc0 = {:.6})",
            self.state_size, self.lambda, self.mean[0], self.covariance[0]
        )
    }
}

impl SigmaWeights {
    /// Compute the weights for a state of dimension `n`
    ///
    /// # Panics
    /// When `n` is zero.
    pub fn new(alpha: f64, beta: f64, n: usize, kappa: f64) -> Self {
        assert!(n > 0, "SigmaWeights::new: state dimension must be positive");
        let n_f = n as f64;
        let lambda = alpha * alpha * (n_f + kappa) - n_f;
        let mut mean = DVector::zeros(2 * n + 1);
        let mut covariance = DVector::zeros(2 * n + 1);
        mean[0] = lambda / (n_f + lambda);
        covariance[0] = lambda / (n_f + lambda) + (1.0 - alpha * alpha + beta);
        let w = 1.0 / (2.0 * (n_f + lambda));
        for i in 1..(2 * n + 1) {
            mean[i] = w;
            covariance[i] = w;
        }
        SigmaWeights {
            mean,
            covariance,
            lambda,
            state_size: n,
        }
    }
    pub fn from_parameters(parameters: &SigmaParameters, n: usize) -> Self {
        SigmaWeights::new(parameters.alpha, parameters.beta, n, parameters.kappa_for(n))
    }
    pub fn state_size(&self) -> usize {
        self.state_size
    }
    /// Number of sigma points, `2n + 1`
    pub fn len(&self) -> usize {
        self.mean.len()
    }
    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }
    /// Sigma point spread `n + λ`
    pub fn spread(&self) -> f64 {
        self.state_size as f64 + self.lambda
    }
}

/// Generate the `2n + 1` sigma points of `(mean, covariance)` as matrix columns
///
/// Column 0 is the mean, column `k + 1` is `mean + C_k` and column `n + k + 1` is `mean - C_k`,
/// with `C` the SVD square root of `(n + λ) P`. Never panics on indefinite or singular
/// covariances: negative directions are clamped and zero variance directions collapse onto the mean.
///
/// # Panics
/// When the covariance is not `n x n` for a mean of length `n`.
pub fn sigma_points(lambda: f64, mean: &DVector<f64>, covariance: &DMatrix<f64>) -> DMatrix<f64> {
    let n = mean.len();
    assert!(
        covariance.nrows() == n && covariance.ncols() == n,
        "sigma_points: covariance must be {n}x{n}"
    );
    let root = svd_square_root(covariance, n as f64 + lambda);
    let mut points = DMatrix::<f64>::zeros(n, 2 * n + 1);
    points.column_mut(0).copy_from(mean);
    for k in 0..n {
        points.column_mut(k + 1).copy_from(&(mean + root.column(k)));
        points
            .column_mut(k + 1 + n)
            .copy_from(&(mean - root.column(k)));
    }
    points
}
