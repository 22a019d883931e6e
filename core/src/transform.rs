//! Unscented transform
//!
//! Propagates a sigma point set through a nonlinear function and recovers the mean and covariance of
//! the result:
//!
//! $$
//! \bar{y} = \sum_i w^m_i\, f(\chi_i), \qquad
//! P_y = \sum_i w^c_i\, (f(\chi_i) - \bar{y})(f(\chi_i) - \bar{y})^T + Q
//! $$
//!
//! The sum and difference above are the circular-aware operations of [VectorLayout], so angular
//! outputs average on the circle and quaternion outputs stay on the unit sphere. The same machinery
//! serves the prediction step (through the motion model), the update step (through the measurement
//! model) and the smoother's re-prediction.
//!
//! Each sigma point is propagated independently. With the `parallel` feature enabled and a state
//! dimension of at least [PARALLEL_THRESHOLD], propagation is spread over the `rayon` thread pool.
use nalgebra::{DMatrix, DVector};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::layout::VectorLayout;
use crate::sigma::SigmaWeights;

/// Minimum state dimension before sigma propagation is spread across threads
pub const PARALLEL_THRESHOLD: usize = 16;

/// Output of [unscented_transform]
#[derive(Clone, Debug, PartialEq)]
pub struct TransformResult {
    pub mean: DVector<f64>,
    pub covariance: DMatrix<f64>,
    /// Propagated sigma points, one per column
    pub points: DMatrix<f64>,
}

/// Propagate `sigma_points` (columns) through `f` and recombine
///
/// # Arguments
/// * `sigma_points` - n x (2n + 1) matrix of sigma points.
/// * `dt` - time step handed to `f`.
/// * `timestamp` - absolute time at the end of the step handed to `f`.
/// * `f` - the function to propagate through.
/// * `weights` - sigma weights matching the point count.
/// * `noise` - additive noise of the output space (Q or R).
/// * `layout` - component layout of the output space.
///
/// # Panics
/// When the weights, noise or layout do not match the propagated dimensions, or when `f` returns
/// vectors of differing lengths.
pub fn unscented_transform<F>(
    sigma_points: &DMatrix<f64>,
    dt: f64,
    timestamp: f64,
    f: F,
    weights: &SigmaWeights,
    noise: &DMatrix<f64>,
    layout: &VectorLayout,
) -> TransformResult
where
    F: Fn(&DVector<f64>, f64, f64) -> DVector<f64> + Sync,
{
    assert_eq!(
        sigma_points.ncols(),
        weights.len(),
        "unscented_transform: expected one weight per sigma point"
    );
    let propagated = propagate(sigma_points, dt, timestamp, &f);
    let m = layout.dimension();
    assert!(
        propagated.iter().all(|y| y.len() == m),
        "unscented_transform: propagated points must have dimension {m}"
    );
    assert!(
        noise.nrows() == m && noise.ncols() == m,
        "unscented_transform: noise must be {m}x{m}"
    );
    let points = DMatrix::from_columns(&propagated);
    let mean = layout.weighted_mean(&points, &weights.mean);
    let mut covariance = noise.clone();
    for (point, w) in propagated.iter().zip(weights.covariance.iter()) {
        let r = layout.residual(point, &mean);
        covariance += *w * &r * r.transpose();
    }
    TransformResult {
        mean,
        covariance,
        points,
    }
}

/// Cross covariance `Σ wc (x_i - x̄)(y_i - ȳ)ᵀ` between two matched point sets
///
/// # Panics
/// When the point counts differ from each other or from the weights.
pub fn cross_covariance(
    x_points: &DMatrix<f64>,
    x_mean: &DVector<f64>,
    x_layout: &VectorLayout,
    y_points: &DMatrix<f64>,
    y_mean: &DVector<f64>,
    y_layout: &VectorLayout,
    weights: &DVector<f64>,
) -> DMatrix<f64> {
    assert!(
        x_points.ncols() == y_points.ncols() && x_points.ncols() == weights.len(),
        "cross_covariance: point sets and weights must have matching lengths"
    );
    let mut pxy = DMatrix::<f64>::zeros(x_mean.len(), y_mean.len());
    for ((x, y), w) in x_points
        .column_iter()
        .zip(y_points.column_iter())
        .zip(weights.iter())
    {
        let dx = x_layout.residual(&x.clone_owned(), x_mean);
        let dy = y_layout.residual(&y.clone_owned(), y_mean);
        pxy += *w * dx * dy.transpose();
    }
    pxy
}

fn propagate_serial<F>(points: &DMatrix<f64>, dt: f64, timestamp: f64, f: &F) -> Vec<DVector<f64>>
where
    F: Fn(&DVector<f64>, f64, f64) -> DVector<f64>,
{
    points
        .column_iter()
        .map(|column| f(&column.clone_owned(), dt, timestamp))
        .collect()
}

#[cfg(feature = "parallel")]
fn propagate<F>(points: &DMatrix<f64>, dt: f64, timestamp: f64, f: &F) -> Vec<DVector<f64>>
where
    F: Fn(&DVector<f64>, f64, f64) -> DVector<f64> + Sync,
{
    if points.nrows() < PARALLEL_THRESHOLD {
        return propagate_serial(points, dt, timestamp, f);
    }
    (0..points.ncols())
        .into_par_iter()
        .map(|i| f(&points.column(i).clone_owned(), dt, timestamp))
        .collect()
}

#[cfg(not(feature = "parallel"))]
fn propagate<F>(points: &DMatrix<f64>, dt: f64, timestamp: f64, f: &F) -> Vec<DVector<f64>>
where
    F: Fn(&DVector<f64>, f64, f64) -> DVector<f64> + Sync,
{
    propagate_serial(points, dt, timestamp, f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sigma::{SigmaWeights, sigma_points};
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    fn belief() -> (DVector<f64>, DMatrix<f64>) {
        let mean = DVector::from_vec(vec![1.0, 2.0, -0.5]);
        let covariance =
            DMatrix::from_row_slice(3, 3, &[0.5, 0.1, 0.0, 0.1, 0.4, 0.05, 0.0, 0.05, 0.2]);
        (mean, covariance)
    }

    #[test]
    fn identity_reproduces_mean_and_covariance() {
        let (mean, covariance) = belief();
        let noise = DMatrix::from_diagonal(&DVector::from_vec(vec![0.01, 0.02, 0.03]));
        let layout = VectorLayout::linear(3);
        for (alpha, beta, kappa) in [(1.0, 2.0, 0.0), (0.3, 2.0, 0.0), (1.0, 0.0, 0.0)] {
            let weights = SigmaWeights::new(alpha, beta, 3, kappa);
            let points = sigma_points(weights.lambda, &mean, &covariance);
            let result = unscented_transform(
                &points,
                1.0,
                0.0,
                |x, _, _| x.clone(),
                &weights,
                &noise,
                &layout,
            );
            assert_approx_eq!((&result.mean - &mean).norm(), 0.0, 1e-9);
            let expected = &covariance + &noise;
            assert_approx_eq!((&result.covariance - expected).norm(), 0.0, 1e-9);
            assert_eq!(result.points, points);
        }
    }

    #[test]
    fn linear_map_is_exact() {
        let (mean, covariance) = belief();
        let a = DMatrix::from_row_slice(2, 3, &[1.0, 0.5, 0.0, 0.0, 2.0, -1.0]);
        let weights = SigmaWeights::new(1.0, 2.0, 3, 0.0);
        let points = sigma_points(weights.lambda, &mean, &covariance);
        let noise = DMatrix::<f64>::zeros(2, 2);
        let result = unscented_transform(
            &points,
            0.1,
            0.0,
            |x, _, _| &a * x,
            &weights,
            &noise,
            &VectorLayout::linear(2),
        );
        assert_approx_eq!((&result.mean - &a * &mean).norm(), 0.0, 1e-9);
        let expected = &a * &covariance * a.transpose();
        assert_approx_eq!((&result.covariance - expected).norm(), 0.0, 1e-9);
    }

    #[test]
    fn angular_output_is_averaged_on_the_circle() {
        let mean = DVector::from_vec(vec![PI - 0.01]);
        let covariance = DMatrix::from_element(1, 1, 0.01);
        let weights = SigmaWeights::new(1.0, 2.0, 1, 2.0);
        let points = sigma_points(weights.lambda, &mean, &covariance);
        let layout = VectorLayout::linear(1).with_angles(&[0]);
        let wrap = |x: &DVector<f64>, _: f64, _: f64| x.map(crate::wrap_to_pi);
        let noise = DMatrix::<f64>::zeros(1, 1);
        let result = unscented_transform(&points, 1.0, 0.0, wrap, &weights, &noise, &layout);
        assert_approx_eq!(crate::angle_difference(result.mean[0], PI - 0.01), 0.0, 1e-3);
        // Arithmetic averaging of wrapped points would blow the variance up to ~π².
        assert!(result.covariance[(0, 0)] < 0.02);
    }

    #[test]
    fn timestamp_and_dt_are_forwarded() {
        let (mean, covariance) = belief();
        let weights = SigmaWeights::new(1.0, 2.0, 3, 0.0);
        let points = sigma_points(weights.lambda, &mean, &covariance);
        let f = |x: &DVector<f64>, dt: f64, t: f64| x.add_scalar(dt * t);
        let result = unscented_transform(
            &points,
            0.5,
            4.0,
            f,
            &weights,
            &DMatrix::zeros(3, 3),
            &VectorLayout::linear(3),
        );
        assert_approx_eq!((&result.mean - mean.add_scalar(2.0)).norm(), 0.0, 1e-9);
    }

    #[test]
    fn cross_covariance_of_identity_is_covariance() {
        let (mean, covariance) = belief();
        let weights = SigmaWeights::new(1.0, 2.0, 3, 0.0);
        let points = sigma_points(weights.lambda, &mean, &covariance);
        let layout = VectorLayout::linear(3);
        // The zeroth point has zero residual, so wc0 plays no role.
        let pxx = cross_covariance(
            &points,
            &mean,
            &layout,
            &points,
            &mean,
            &layout,
            &weights.covariance,
        );
        assert_approx_eq!((pxx - covariance).norm(), 0.0, 1e-9);
    }

    #[test]
    #[should_panic(expected = "unscented_transform: noise must be 3x3")]
    fn mismatched_noise_panics() {
        let (mean, covariance) = belief();
        let weights = SigmaWeights::new(1.0, 2.0, 3, 0.0);
        let points = sigma_points(weights.lambda, &mean, &covariance);
        let _ = unscented_transform(
            &points,
            1.0,
            0.0,
            |x, _, _| x.clone(),
            &weights,
            &DMatrix::zeros(2, 2),
            &VectorLayout::linear(3),
        );
    }
}
