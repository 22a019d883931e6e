//! Unscented Kalman Filter for pedestrian dead reckoning
//!
//! This module contains the predict and update steps of the filter as free functions, the
//! [UnscentedKalmanFilter] state machine built on top of them, and [run_forward], which drives the
//! filter over a whole measurement sequence and records the posterior of every step in a
//! [Trajectory].
//!
//! The filter alternates strictly between two states:
//!
//! - **Predict**: sigma points of the current belief are propagated through the motion model
//!   ([StateTransition]) and recombined into a [Prior]; the propagated points are kept.
//! - **Update**: the kept points are mapped through the measurement model ([MeasurementModel]) and
//!   the measurement is fused with the gain $K = P_{xz} S^{+}$, where $S^{+}$ is the SVD
//!   pseudo-inverse of the innovation covariance.
//!
//! The first step uses the `initial_sigma` scaling parameters of the [FilterConfig], every later step
//! the `sigma` parameters.
use std::fmt::{self, Debug, Display};

use log::{debug, warn};
use nalgebra::{DMatrix, DVector, UnitQuaternion, Vector3};

use crate::config::{ConfigError, CovarianceUpdate, FilterConfig, ProcessNoise};
use crate::layout::VectorLayout;
use crate::linalg::{is_finite, robust_gain, symmetrize};
use crate::measurements::MeasurementModel;
use crate::motion::{ACCELERATION, ORIENTATION, OrientationKind, POSITION};
use crate::sigma::{SigmaParameters, SigmaWeights, sigma_points};
use crate::transform::{cross_covariance, unscented_transform};
use crate::{NavigationFilter, StateTransition, attitude};

/// Relative tolerance used when checking symmetry of an initial covariance
const SYMMETRY_TOLERANCE: f64 = 1e-9;

/// Gaussian belief over the state
#[derive(Clone, Debug, PartialEq)]
pub struct Belief {
    pub mean: DVector<f64>,
    pub covariance: DMatrix<f64>,
}

/// Output of the predict step, consumed by the next update
#[derive(Clone, Debug, PartialEq)]
pub struct Prior {
    pub mean: DVector<f64>,
    pub covariance: DMatrix<f64>,
    /// Sigma points after propagation through the motion model, one per column
    pub sigma_points: DMatrix<f64>,
}

/// Externally supplied starting belief of the filter
#[derive(Clone, Debug, PartialEq)]
pub struct InitialBelief {
    mean: DVector<f64>,
    covariance: DMatrix<f64>,
}

impl InitialBelief {
    /// Check and wrap a mean and covariance
    ///
    /// The covariance must be square, match the mean, be finite and symmetric.
    pub fn new(mean: DVector<f64>, covariance: DMatrix<f64>) -> Result<Self, ConfigError> {
        let n = mean.len();
        if covariance.nrows() != n || covariance.ncols() != n {
            return Err(ConfigError::Dimension {
                what: "initial covariance",
                expected: n,
                found: if covariance.nrows() != n {
                    covariance.nrows()
                } else {
                    covariance.ncols()
                },
            });
        }
        if !mean.iter().all(|v| v.is_finite()) || !is_finite(&covariance) {
            return Err(ConfigError::NonFinite {
                what: "initial belief",
            });
        }
        let scale = covariance.amax().max(1.0);
        if (&covariance - covariance.transpose()).amax() > SYMMETRY_TOLERANCE * scale {
            return Err(ConfigError::NotSymmetric {
                what: "initial covariance",
            });
        }
        Ok(InitialBelief { mean, covariance })
    }
    /// Assemble the mean from its physical components with a diagonal covariance
    pub fn from_components(
        position: [f64; 2],
        acceleration: Vector3<f64>,
        orientation: &UnitQuaternion<f64>,
        kind: OrientationKind,
        covariance_diagonal: &[f64],
    ) -> Result<Self, ConfigError> {
        let n = kind.state_dimension();
        if covariance_diagonal.len() != n {
            return Err(ConfigError::Dimension {
                what: "initial covariance",
                expected: n,
                found: covariance_diagonal.len(),
            });
        }
        for (index, &value) in covariance_diagonal.iter().enumerate() {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::InvalidVariance {
                    what: "initial covariance",
                    index,
                    value,
                });
            }
        }
        let mut mean = DVector::zeros(n);
        mean[POSITION] = position[0];
        mean[POSITION + 1] = position[1];
        mean.fixed_rows_mut::<3>(ACCELERATION).copy_from(&acceleration);
        match kind {
            OrientationKind::Quaternion => {
                mean[ORIENTATION] = orientation.w;
                mean[ORIENTATION + 1] = orientation.i;
                mean[ORIENTATION + 2] = orientation.j;
                mean[ORIENTATION + 3] = orientation.k;
            }
            OrientationKind::Euler => {
                let (yaw, pitch, roll) = attitude::euler_from_quaternion(orientation);
                mean[ORIENTATION] = yaw;
                mean[ORIENTATION + 1] = pitch;
                mean[ORIENTATION + 2] = roll;
            }
        }
        let covariance = DMatrix::from_diagonal(&DVector::from_column_slice(covariance_diagonal));
        InitialBelief::new(mean, covariance)
    }
    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }
}

/// Predict step: propagate the sigma points of `belief` through the motion model
pub fn predict<M>(
    model: &M,
    belief: &Belief,
    dt: f64,
    timestamp: f64,
    weights: &SigmaWeights,
    process_noise: &DMatrix<f64>,
) -> Prior
where
    M: StateTransition + Sync,
{
    let points = sigma_points(weights.lambda, &belief.mean, &belief.covariance);
    let result = unscented_transform(
        &points,
        dt,
        timestamp,
        |state, dt, t| model.transition(state, dt, t),
        weights,
        process_noise,
        model.state_layout(),
    );
    Prior {
        mean: result.mean,
        covariance: symmetrize(&result.covariance),
        sigma_points: result.points,
    }
}

/// Update step: fuse `measurement` into `prior`
///
/// The propagated sigma points of the prior are mapped through `model`; the measurement noise is
/// added to the innovation covariance; the gain is computed with a pseudo-inverse.
#[allow(clippy::too_many_arguments)]
pub fn update<H>(
    prior: &Prior,
    measurement: &DVector<f64>,
    dt: f64,
    timestamp: f64,
    model: &H,
    state_layout: &VectorLayout,
    weights: &SigmaWeights,
    measurement_noise: &DMatrix<f64>,
    mode: CovarianceUpdate,
) -> Belief
where
    H: MeasurementModel + Sync,
{
    let z_layout = model.measurement_layout();
    assert_eq!(
        measurement.len(),
        z_layout.dimension(),
        "update: measurement dimension mismatch"
    );
    let predicted = unscented_transform(
        &prior.sigma_points,
        dt,
        timestamp,
        |state, dt, t| model.get_expected_measurement(state, dt, t),
        weights,
        measurement_noise,
        z_layout,
    );
    let pxz = cross_covariance(
        &prior.sigma_points,
        &prior.mean,
        state_layout,
        &predicted.points,
        &predicted.mean,
        z_layout,
        &weights.covariance,
    );
    let s = symmetrize(&predicted.covariance);
    let gain = robust_gain(&pxz, &s);
    let innovation = z_layout.residual(measurement, &predicted.mean);
    let mean = state_layout.add(&prior.mean, &(&gain * innovation));
    let covariance = match mode {
        CovarianceUpdate::Joseph => {
            &prior.covariance - &gain * pxz.transpose() - &pxz * gain.transpose()
                + &gain * &s * gain.transpose()
        }
        CovarianceUpdate::Subtractive => &prior.covariance - &gain * &s * gain.transpose(),
    };
    Belief {
        mean,
        covariance: symmetrize(&covariance),
    }
}

/// Unscented Kalman Filter implementation
#[derive(Clone)]
pub struct UnscentedKalmanFilter<M> {
    model: M,
    mean_state: DVector<f64>,
    covariance: DMatrix<f64>,
    process_noise: ProcessNoise,
    measurement_noise: DMatrix<f64>,
    initial_sigma: SigmaParameters,
    sigma: SigmaParameters,
    covariance_update: CovarianceUpdate,
    state_size: usize,
    weights: SigmaWeights,
    prior: Option<Prior>,
    steps: usize,
}

impl<M> Debug for UnscentedKalmanFilter<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UKF")
            .field("mean_state", &self.mean_state)
            .field("covariance", &self.covariance)
            .field("process_noise", &self.process_noise.base())
            .field("lambda", &self.weights.lambda)
            .field("state_size", &self.state_size)
            .finish()
    }
}

impl<M> Display for UnscentedKalmanFilter<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnscentedKalmanFilter")
            .field("mean_state", &self.mean_state)
            .field("covariance", &self.covariance)
            .field("process_noise", &self.process_noise.base())
            .field("lambda", &self.weights.lambda)
            .field("state_size", &self.state_size)
            .field("steps", &self.steps)
            .finish()
    }
}

impl<M> UnscentedKalmanFilter<M>
where
    M: StateTransition + MeasurementModel + Sync,
{
    /// Build a filter from a validated configuration and an initial belief
    pub fn new(
        model: M,
        initial: InitialBelief,
        config: &FilterConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let state_size = model.state_layout().dimension();
        if state_size != config.state_dimension() {
            return Err(ConfigError::Dimension {
                what: "motion model state",
                expected: config.state_dimension(),
                found: state_size,
            });
        }
        if initial.mean.len() != state_size {
            return Err(ConfigError::Dimension {
                what: "initial belief",
                expected: state_size,
                found: initial.mean.len(),
            });
        }
        let measurement_noise = config.measurement_noise_matrix()?;
        if model.get_dimension() != measurement_noise.nrows() {
            return Err(ConfigError::Dimension {
                what: "measurement model",
                expected: measurement_noise.nrows(),
                found: model.get_dimension(),
            });
        }
        let process_noise = config.process_noise()?;
        let weights = SigmaWeights::from_parameters(&config.initial_sigma, state_size);
        debug!("UnscentedKalmanFilter: n = {state_size}, initial {weights}");
        Ok(UnscentedKalmanFilter {
            model,
            mean_state: initial.mean,
            covariance: initial.covariance,
            process_noise,
            measurement_noise,
            initial_sigma: config.initial_sigma,
            sigma: config.sigma,
            covariance_update: config.covariance_update,
            state_size,
            weights,
            prior: None,
            steps: 0,
        })
    }
    /// Sigma points of the current belief with the current weights
    pub fn get_sigma_points(&self) -> DMatrix<f64> {
        sigma_points(self.weights.lambda, &self.mean_state, &self.covariance)
    }
    pub fn weights(&self) -> &SigmaWeights {
        &self.weights
    }
    /// The pending prior, present between a predict and the following update
    pub fn prior(&self) -> Option<&Prior> {
        self.prior.as_ref()
    }
    pub fn model(&self) -> &M {
        &self.model
    }
    /// Number of completed updates
    pub fn steps(&self) -> usize {
        self.steps
    }
    fn belief(&self) -> Belief {
        Belief {
            mean: self.mean_state.clone(),
            covariance: self.covariance.clone(),
        }
    }
}

impl<M> NavigationFilter for UnscentedKalmanFilter<M>
where
    M: StateTransition + MeasurementModel + Sync,
{
    fn predict(&mut self, dt: f64, timestamp: f64) {
        let parameters = if self.steps == 0 {
            self.initial_sigma
        } else {
            self.sigma
        };
        self.weights = SigmaWeights::from_parameters(&parameters, self.state_size);
        let q = self.process_noise.next_matrix();
        let prior = predict(&self.model, &self.belief(), dt, timestamp, &self.weights, &q);
        self.mean_state = prior.mean.clone();
        self.covariance = prior.covariance.clone();
        self.prior = Some(prior);
    }
    fn update(&mut self, measurement: &DVector<f64>, dt: f64, timestamp: f64) {
        let prior = match self.prior.take() {
            Some(prior) => prior,
            None => {
                warn!("UnscentedKalmanFilter::update called without a pending prediction");
                let points = self.get_sigma_points();
                Prior {
                    mean: self.mean_state.clone(),
                    covariance: self.covariance.clone(),
                    sigma_points: points,
                }
            }
        };
        let posterior = update(
            &prior,
            measurement,
            dt,
            timestamp,
            &self.model,
            self.model.state_layout(),
            &self.weights,
            &self.measurement_noise,
            self.covariance_update,
        );
        self.mean_state = posterior.mean;
        self.covariance = posterior.covariance;
        self.steps += 1;
    }
    fn get_estimate(&self) -> DVector<f64> {
        self.mean_state.clone()
    }
    fn get_certainty(&self) -> DMatrix<f64> {
        self.covariance.clone()
    }
}

/// Per-step posterior means and covariances of a filter run
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Trajectory {
    pub timestamps: Vec<f64>,
    pub means: Vec<DVector<f64>>,
    pub covariances: Vec<DMatrix<f64>>,
}

impl Trajectory {
    pub fn new() -> Self {
        Trajectory::default()
    }
    pub fn with_capacity(capacity: usize) -> Self {
        Trajectory {
            timestamps: Vec::with_capacity(capacity),
            means: Vec::with_capacity(capacity),
            covariances: Vec::with_capacity(capacity),
        }
    }
    pub fn push(&mut self, timestamp: f64, mean: DVector<f64>, covariance: DMatrix<f64>) {
        self.timestamps.push(timestamp);
        self.means.push(mean);
        self.covariances.push(covariance);
    }
    pub fn len(&self) -> usize {
        self.means.len()
    }
    pub fn is_empty(&self) -> bool {
        self.means.is_empty()
    }
    /// Planar positions `[x, y]` of every sample
    pub fn positions(&self) -> Vec<[f64; 2]> {
        self.means
            .iter()
            .map(|m| [m[POSITION], m[POSITION + 1]])
            .collect()
    }
    /// Index of the first sample whose mean or covariance is not finite
    pub fn first_non_finite(&self) -> Option<usize> {
        self.means
            .iter()
            .zip(&self.covariances)
            .position(|(m, p)| !m.iter().all(|v| v.is_finite()) || !is_finite(p))
    }
}

/// Run the filter over a measurement sequence
///
/// `measurements[k]` is fused after predicting over `dt[k]` up to `timestamps[k]`. The returned
/// trajectory holds the posterior of every step. A non-finite estimate is reported once through
/// `log::warn!` and then propagated.
///
/// # Panics
/// When the three sequences differ in length.
pub fn run_forward<M>(
    model: &M,
    initial: &InitialBelief,
    measurements: &[DVector<f64>],
    timestamps: &[f64],
    dt: &[f64],
    config: &FilterConfig,
) -> Result<Trajectory, ConfigError>
where
    M: StateTransition + MeasurementModel + Clone + Sync,
{
    assert!(
        measurements.len() == timestamps.len() && dt.len() == timestamps.len(),
        "run_forward: measurements, timestamps and dt must have equal lengths"
    );
    let mut ukf = UnscentedKalmanFilter::new(model.clone(), initial.clone(), config)?;
    let mut trajectory = Trajectory::with_capacity(measurements.len());
    let mut reported = false;
    for (k, ((z, &t), &step)) in measurements.iter().zip(timestamps).zip(dt).enumerate() {
        ukf.predict(step, t);
        ukf.update(z, step, t);
        let mean = ukf.get_estimate();
        let covariance = ukf.get_certainty();
        if !reported && !(mean.iter().all(|v| v.is_finite()) && is_finite(&covariance)) {
            warn!("run_forward: non-finite estimate at step {k} (t = {t})");
            reported = true;
        }
        debug!("run_forward: step {k}, trace(P) = {:.6e}", covariance.trace());
        trajectory.push(t, mean, covariance);
    }
    Ok(trajectory)
}
