//! Pedestrian dead-reckoning toolbox built around an Unscented Kalman Filter
//!
//! This crate estimates the two dimensional position of a pedestrian over time by fusing noisy inertial
//! readings (accelerometer and orientation / rotation vector) with sparsely sampled ground-truth waypoints.
//! The estimator is a nonlinear Bayesian recursive filter: an Unscented Kalman Filter (UKF) forward pass
//! optionally followed by a backward Rauch-Tung-Striebel (RTS) smoother pass over the filtered trajectory.
//!
//! The crate is not a general purpose filtering library. The state dimension, the structure of the motion
//! and measurement models, and the noise injection policy are fixed to the pedestrian dead-reckoning use
//! case. Raw sensor log parsing, dataset layout, plotting and command line front-ends are left to the
//! caller; [sim] only provides the thin glue needed to turn synchronized sensor samples and waypoints into
//! the measurement sequence the filter consumes.
//!
//! This crate is primarily built off of the following dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): linear algebra, SVD, quaternions and rotations.
//! - [`serde`](https://crates.io/crates/serde), [`csv`](https://crates.io/crates/csv) and friends: configuration and record I/O.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): seeded process noise jitter.
//! - [`log`](https://crates.io/crates/log): diagnostics when the numerics have to intervene.
//!
//! ## Crate overview
//!
//! - [layout]: Describes which components of a vector are angles or a unit quaternion and provides the circular-aware mean and residual.
//! - [linalg]: Robust linear algebra helpers (SVD square root, SVD pseudo-inverse).
//! - [sigma]: Sigma point weights and sigma point generation.
//! - [transform]: The unscented transform.
//! - [attitude]: Orientation helpers (heading, gravity direction, rotation vector).
//! - [signal]: Hamming-windowed zero-lag low-pass FIR filter.
//! - [motion]: The pedestrian motion model (state transition).
//! - [measurements]: The pedestrian measurement model.
//! - [kalman]: The UKF update step, the filter itself and the forward pass.
//! - [smoother]: The unscented RTS smoother.
//! - [config]: Filter configuration and noise sources.
//! - [sim]: Glue between synchronized sensor records, waypoints and the filter.
//!
//! ## State definition
//!
//! The canonical state vector uses a unit quaternion for the orientation of the device:
//!
//! $$
//! x = [p_x, p_y, a_x, a_y, a_z, q_w, q_x, q_y, q_z]
//! $$
//!
//! An Euler angle variant is also provided for comparison:
//!
//! $$
//! x = [p_x, p_y, a_x, a_y, a_z, \psi, \theta, \phi]
//! $$
//!
//! Where:
//! - $p_x$ and $p_y$ are the planar position in meters in the floor-plan frame.
//! - $a_x$, $a_y$ and $a_z$ are the (low-pass filtered) linear acceleration of the device in m/s^2, body frame.
//! - $q$ is the body-to-navigation rotation, or $\psi$, $\theta$, $\phi$ are yaw, pitch and roll in radians wrapped to $(-\pi, \pi]$.
//!
//! ## Dead reckoning step
//!
//! Each propagation double-integrates the magnitude of the filtered linear acceleration over the time step to
//! obtain a forward distance $d = \lVert a \rVert \Delta t^2$ and walks that distance along the heading $\psi$
//! of the device. Heading changes during the step are integrated from the navigation-frame turn rate and the
//! walk follows the corresponding circular arc:
//!
//! $$
//! \Delta x = \frac{d}{\Delta\psi} \left( \cos \psi_1 - \cos \psi_0 \right), \quad
//! \Delta y = \frac{d}{\Delta\psi} \left( \sin \psi_1 - \sin \psi_0 \right)
//! $$
//!
//! which reduces to the straight-line walk $\Delta x = -d \sin \psi_0$, $\Delta y = d \cos \psi_0$ when the turn
//! $\Delta\psi$ vanishes.
pub mod attitude;
pub mod config;
pub mod kalman;
pub mod layout;
pub mod linalg;
pub mod measurements;
pub mod motion;
pub mod signal;
pub mod sigma;
pub mod sim;
pub mod smoother;
pub mod transform;

use nalgebra::{DMatrix, DVector};

use crate::layout::VectorLayout;

/// Standard gravity in m/s^2 used to emulate raw accelerometer output
pub const STANDARD_GRAVITY: f64 = 9.80665;

/// State transition capability (the "fx" of the filter)
///
/// Implementations must be pure functions of a single state vector, the time step and the absolute
/// timestamp at the end of the step. The filter and the smoother only see this interface, so alternate
/// motion models can be substituted without touching either of them.
pub trait StateTransition {
    /// Layout of the state vector (angular and quaternion components)
    fn state_layout(&self) -> &VectorLayout;
    /// Propagate `state` over `dt` seconds ending at `timestamp`
    fn transition(&self, state: &DVector<f64>, dt: f64, timestamp: f64) -> DVector<f64>;
}

/// Generic Bayesian navigation filter trait
///
/// The filter alternates strictly between [NavigationFilter::predict] and [NavigationFilter::update],
/// once per time step, starting from an externally supplied initial belief.
pub trait NavigationFilter {
    fn predict(&mut self, dt: f64, timestamp: f64);
    fn update(&mut self, measurement: &DVector<f64>, dt: f64, timestamp: f64);
    fn get_estimate(&self) -> DVector<f64>;
    fn get_certainty(&self) -> DMatrix<f64>;
}

/// Wrap an angle to the range $(-\pi, \pi]$ radians
///
/// Non-finite input is returned as NaN rather than looping or panicking.
///
/// # Example
/// ```rust
/// use deadreckon::wrap_to_pi;
/// use std::f64::consts::PI;
/// let wrapped = wrap_to_pi(3.0 * PI / 2.0);
/// assert!((wrapped + PI / 2.0).abs() < 1e-12);
/// assert_eq!(wrap_to_pi(-PI), PI);
/// ```
pub fn wrap_to_pi(angle: f64) -> f64 {
    use std::f64::consts::{PI, TAU};
    PI - (PI - angle).rem_euclid(TAU)
}

/// Signed smallest difference `a - b` between two angles, wrapped to $(-\pi, \pi]$
pub fn angle_difference(a: f64, b: f64) -> f64 {
    wrap_to_pi(a - b)
}
