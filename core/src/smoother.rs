//! Unscented Rauch-Tung-Striebel smoother
//!
//! Backward pass over a forward [Trajectory]. For each sample $k$ from $T-2$ down to $0$ the filtered
//! belief is re-predicted over the interval into sample $k+1$, and the smoothed estimate of sample
//! $k+1$ is pulled back through the smoother gain:
//!
//! $$
//! G_k = P_{k,k+1} \bar{P}_{k+1}^{+}, \quad
//! \hat{x}^s_k = \hat{x}_k + G_k (\hat{x}^s_{k+1} - \bar{x}_{k+1}), \quad
//! P^s_k = P_k + G_k (P^s_{k+1} - \bar{P}_{k+1}) G_k^T
//! $$
//!
//! where $\bar{x}_{k+1}$, $\bar{P}_{k+1}$ come from the unscented transform of sample $k$ through the
//! motion model and $P_{k,k+1}$ is the cross covariance between the sigma points and their images.
//! The last sample is copied unchanged.
use log::debug;
use nalgebra::DMatrix;

use crate::StateTransition;
use crate::kalman::Trajectory;
use crate::linalg::{pseudo_inverse, symmetrize};
use crate::sigma::{SigmaWeights, sigma_points};
use crate::transform::{cross_covariance, unscented_transform};

/// Smoothed trajectory and the smoother gains that produced it
#[derive(Clone, Debug, PartialEq)]
pub struct SmootherOutput {
    pub trajectory: Trajectory,
    /// `gains[k]` links sample `k` to `k + 1`; the last entry is zero
    pub gains: Vec<DMatrix<f64>>,
}

/// Run the backward pass over `forward`
///
/// `dt[k]` is the step that led into sample `k`, as in the forward pass; sample `k` is re-predicted
/// with `dt[k + 1]` up to `forward.timestamps[k + 1]`. Empty and single-sample trajectories are
/// returned unchanged.
///
/// # Panics
/// When `dt` does not have one entry per sample or `process_noise` does not match the state.
pub fn rts_smooth<M>(
    forward: &Trajectory,
    model: &M,
    process_noise: &DMatrix<f64>,
    dt: &[f64],
    weights: &SigmaWeights,
) -> SmootherOutput
where
    M: StateTransition + Sync,
{
    let len = forward.len();
    assert_eq!(dt.len(), len, "rts_smooth: dt must have one entry per sample");
    let layout = model.state_layout();
    let n = layout.dimension();
    let mut smoothed = forward.clone();
    let mut gains = vec![DMatrix::<f64>::zeros(n, n); len];
    if len < 2 {
        return SmootherOutput {
            trajectory: smoothed,
            gains,
        };
    }
    for k in (0..len - 1).rev() {
        let mean = &forward.means[k];
        let covariance = symmetrize(&forward.covariances[k]);
        let points = sigma_points(weights.lambda, mean, &covariance);
        let predicted = unscented_transform(
            &points,
            dt[k + 1],
            forward.timestamps[k + 1],
            |state, dt, t| model.transition(state, dt, t),
            weights,
            process_noise,
            layout,
        );
        let cross = cross_covariance(
            &points,
            mean,
            layout,
            &predicted.points,
            &predicted.mean,
            layout,
            &weights.covariance,
        );
        let gain = &cross * pseudo_inverse(&predicted.covariance);
        let correction = layout.residual(&smoothed.means[k + 1], &predicted.mean);
        let mean = layout.add(mean, &(&gain * correction));
        let spread = &smoothed.covariances[k + 1] - &predicted.covariance;
        smoothed.covariances[k] = symmetrize(&(covariance + &gain * spread * gain.transpose()));
        smoothed.means[k] = mean;
        gains[k] = gain;
    }
    debug!("rts_smooth: smoothed {len} samples");
    SmootherOutput {
        trajectory: smoothed,
        gains,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::VectorLayout;
    use crate::sigma::SigmaParameters;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::DVector;

    /// Constant velocity model on `[position, velocity]`
    struct ConstantVelocity {
        layout: VectorLayout,
    }

    impl StateTransition for ConstantVelocity {
        fn state_layout(&self) -> &VectorLayout {
            &self.layout
        }
        fn transition(&self, state: &DVector<f64>, dt: f64, _timestamp: f64) -> DVector<f64> {
            DVector::from_vec(vec![state[0] + dt * state[1], state[1]])
        }
    }

    fn model() -> ConstantVelocity {
        ConstantVelocity {
            layout: VectorLayout::linear(2),
        }
    }

    fn forward() -> Trajectory {
        let mut trajectory = Trajectory::new();
        let covariance = DMatrix::from_row_slice(2, 2, &[0.5, 0.1, 0.1, 0.2]);
        for k in 0..5 {
            let mean = DVector::from_vec(vec![k as f64 + 0.1 * (k % 2) as f64, 1.0]);
            trajectory.push(k as f64, mean, covariance.clone());
        }
        trajectory
    }

    fn weights() -> SigmaWeights {
        SigmaWeights::from_parameters(&SigmaParameters::new(1.0, 2.0, Some(1.0)), 2)
    }

    #[test]
    fn last_sample_is_unchanged() {
        let forward = forward();
        let q = DMatrix::from_diagonal(&DVector::from_vec(vec![0.01, 0.01]));
        let output = rts_smooth(&forward, &model(), &q, &[1.0; 5], &weights());
        let last = forward.len() - 1;
        assert_eq!(output.trajectory.means[last], forward.means[last]);
        assert_eq!(output.trajectory.covariances[last], forward.covariances[last]);
        assert_eq!(output.trajectory.timestamps, forward.timestamps);
        assert_eq!(output.gains[last], DMatrix::zeros(2, 2));
    }

    #[test]
    fn smoothing_never_increases_uncertainty() {
        // With this Q the re-predicted covariance dominates the filtered one at every step.
        let forward = forward();
        let q = DMatrix::from_diagonal(&DVector::from_vec(vec![0.1, 0.1]));
        let output = rts_smooth(&forward, &model(), &q, &[1.0; 5], &weights());
        for k in 0..forward.len() {
            let smoothed = &output.trajectory.covariances[k];
            assert!(smoothed.trace() <= forward.covariances[k].trace() + 1e-12);
            assert_approx_eq!((smoothed - smoothed.transpose()).amax(), 0.0, 1e-15);
        }
    }

    #[test]
    fn consistent_trajectory_is_a_fixed_point() {
        // Means that follow the model exactly and a steady-state covariance leave nothing to correct.
        let mut forward = Trajectory::new();
        for k in 0..4 {
            forward.push(
                k as f64,
                DVector::from_vec(vec![2.0 * k as f64, 2.0]),
                DMatrix::identity(2, 2),
            );
        }
        let q = DMatrix::zeros(2, 2);
        let output = rts_smooth(&forward, &model(), &q, &[1.0; 4], &weights());
        for k in 0..4 {
            assert_approx_eq!((&output.trajectory.means[k] - &forward.means[k]).norm(), 0.0, 1e-9);
        }
    }

    #[test]
    fn linear_gain_matches_closed_form() {
        let forward = forward();
        let q = DMatrix::from_diagonal(&DVector::from_vec(vec![0.01, 0.01]));
        let output = rts_smooth(&forward, &model(), &q, &[1.0; 5], &weights());
        let f = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 0.0, 1.0]);
        let p = &forward.covariances[0];
        let predicted = &f * p * f.transpose() + &q;
        let expected = p * f.transpose() * predicted.try_inverse().unwrap();
        assert_approx_eq!((&output.gains[0] - expected).amax(), 0.0, 1e-9);
    }

    #[test]
    fn short_trajectories_are_returned_unchanged() {
        let q = DMatrix::zeros(2, 2);
        let empty = rts_smooth(&Trajectory::new(), &model(), &q, &[], &weights());
        assert!(empty.trajectory.is_empty());
        let mut single = Trajectory::new();
        single.push(0.0, DVector::from_vec(vec![1.0, 2.0]), DMatrix::identity(2, 2));
        let output = rts_smooth(&single, &model(), &q, &[0.5], &weights());
        assert_eq!(output.trajectory, single);
    }

    #[test]
    #[should_panic(expected = "rts_smooth: dt must have one entry per sample")]
    fn dt_length_mismatch_panics() {
        let q = DMatrix::zeros(2, 2);
        let _ = rts_smooth(&forward(), &model(), &q, &[1.0; 3], &weights());
    }
}
