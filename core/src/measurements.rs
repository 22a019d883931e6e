//! Measurement model of the pedestrian dead-reckoning filter.
//!
//! This module defines the generic [MeasurementModel] trait used by the update step and its
//! implementation for [PedestrianModel] ("hx"), along with [PedestrianMeasurement], the observed
//! counterpart assembled from sensor samples and waypoints.
//!
//! The measurement vector has the same dimension as the state:
//!
//! - position channel: the ground-truth waypoint at the start of the interval,
//! - acceleration channel: raw accelerometer output (linear acceleration plus gravity reaction,
//!   body frame),
//! - orientation channel: rotation vector `[qx, qy, qz, qw]` or Euler angles `[yaw, pitch, roll]`.
//!
//! hx therefore inverts the displacement the motion model applied over the interval: given a
//! propagated state at the end of the interval it returns the position the pedestrian had at its
//! start. The acceleration it reads is the one the motion model already passed through the
//! low-pass filter, so the inversion is exact.

use std::fmt::{self, Display};

use nalgebra::{DVector, UnitQuaternion, Vector3};

use crate::attitude::{self, gravity_in_body, heading, rotation_vector};
use crate::layout::VectorLayout;
use crate::motion::{
    ACCELERATION, ORIENTATION, OrientationKind, POSITION, PedestrianModel, forward_distance,
};
use crate::wrap_to_pi;

/// Generic measurement model trait
pub trait MeasurementModel {
    /// Layout of the measurement vector (angular and quaternion components)
    fn measurement_layout(&self) -> &VectorLayout;
    /// Get the dimension of the measurement vector
    fn get_dimension(&self) -> usize {
        self.measurement_layout().dimension()
    }
    /// Get the expected measurements from the state. Measurement model function
    /// that maps the state values to measurement space.
    fn get_expected_measurement(
        &self,
        state: &DVector<f64>,
        dt: f64,
        timestamp: f64,
    ) -> DVector<f64>;
}

impl MeasurementModel for PedestrianModel {
    fn measurement_layout(&self) -> &VectorLayout {
        self.measurement_layout_ref()
    }
    fn get_expected_measurement(
        &self,
        state: &DVector<f64>,
        dt: f64,
        timestamp: f64,
    ) -> DVector<f64> {
        assert_eq!(
            state.len(),
            self.orientation().state_dimension(),
            "PedestrianModel::get_expected_measurement: state dimension mismatch"
        );
        // fx stores the filtered acceleration in the state.
        let acceleration: Vector3<f64> = state.fixed_rows::<3>(ACCELERATION).into_owned();
        let attitude = self.attitude(state);
        let turn = self.turn(dt, timestamp);
        // The state is at the end of the interval; walk back to where it started.
        let heading_start = wrap_to_pi(heading(&attitude) - turn);
        let distance = forward_distance(&acceleration, dt);
        let (dx, dy) = self.displacement(distance, heading_start, turn);
        let raw_acceleration = acceleration + gravity_in_body(&attitude);
        let mut z = DVector::zeros(self.get_dimension());
        z[POSITION] = state[POSITION] - dx;
        z[POSITION + 1] = state[POSITION + 1] - dy;
        z.fixed_rows_mut::<3>(ACCELERATION).copy_from(&raw_acceleration);
        match self.orientation() {
            OrientationKind::Quaternion => {
                z.fixed_rows_mut::<4>(ORIENTATION)
                    .copy_from(&rotation_vector(&attitude));
            }
            OrientationKind::Euler => {
                for i in 0..3 {
                    z[ORIENTATION + i] = wrap_to_pi(state[ORIENTATION + i]);
                }
            }
        }
        z
    }
}

/// One observed measurement: waypoint, raw accelerometer sample and device orientation
#[derive(Clone, Debug, PartialEq)]
pub struct PedestrianMeasurement {
    pub position: [f64; 2],
    /// Raw accelerometer output in m/s^2 (gravity included), body frame
    pub acceleration: Vector3<f64>,
    pub orientation: UnitQuaternion<f64>,
}

impl Display for PedestrianMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (yaw, pitch, roll) = attitude::euler_from_quaternion(&self.orientation);
        write!(
            f,
            "PedestrianMeasurement(x: {}, y: {}, acc: [{}, {}, {}], ypr: [{}, {}, {}])",
            self.position[0],
            self.position[1],
            self.acceleration[0],
            self.acceleration[1],
            self.acceleration[2],
            yaw,
            pitch,
            roll
        )
    }
}

impl PedestrianMeasurement {
    /// Get the measurement in a vector format for the given state variant
    pub fn get_vector(&self, kind: OrientationKind) -> DVector<f64> {
        let mut z = DVector::zeros(kind.measurement_dimension());
        z[POSITION] = self.position[0];
        z[POSITION + 1] = self.position[1];
        z.fixed_rows_mut::<3>(ACCELERATION).copy_from(&self.acceleration);
        match kind {
            OrientationKind::Quaternion => {
                z.fixed_rows_mut::<4>(ORIENTATION)
                    .copy_from(&rotation_vector(&self.orientation));
            }
            OrientationKind::Euler => {
                let (yaw, pitch, roll) = attitude::euler_from_quaternion(&self.orientation);
                z[ORIENTATION] = yaw;
                z[ORIENTATION + 1] = pitch;
                z[ORIENTATION + 2] = roll;
            }
        }
        z
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StateTransition;
    use crate::STANDARD_GRAVITY;
    use crate::motion::TurnRateTable;
    use assert_approx_eq::assert_approx_eq;

    fn state_with(kind: OrientationKind, yaw: f64, pitch: f64, roll: f64) -> DVector<f64> {
        let mut state = DVector::zeros(kind.state_dimension());
        state[0] = 4.0;
        state[1] = -3.0;
        state[2] = 0.6;
        state[3] = 0.8;
        state[4] = 0.1;
        match kind {
            OrientationKind::Quaternion => {
                let q = attitude::quaternion_from_euler(yaw, pitch, roll);
                state[5] = q.w;
                state[6] = q.i;
                state[7] = q.j;
                state[8] = q.k;
            }
            OrientationKind::Euler => {
                state[5] = yaw;
                state[6] = pitch;
                state[7] = roll;
            }
        }
        state
    }

    #[test]
    fn dimension_matches_state() {
        assert_eq!(PedestrianModel::new(OrientationKind::Quaternion).get_dimension(), 9);
        assert_eq!(PedestrianModel::new(OrientationKind::Euler).get_dimension(), 8);
    }

    #[test]
    fn expected_position_inverts_the_motion() {
        let table = TurnRateTable::new(vec![(0.0, 0.3), (10.0, -0.2)]);
        for kind in [OrientationKind::Quaternion, OrientationKind::Euler] {
            let model = PedestrianModel::new(kind).with_turn_rates(table.clone());
            let state = state_with(kind, 2.5, 0.05, -0.1);
            let next = model.transition(&state, 0.8, 4.0);
            assert!((next[0] - state[0]).abs() + (next[1] - state[1]).abs() > 0.1);
            let z = model.get_expected_measurement(&next, 0.8, 4.0);
            assert_approx_eq!(z[0], state[0], 1e-9);
            assert_approx_eq!(z[1], state[1], 1e-9);
        }
    }

    #[test]
    fn level_device_reads_gravity_on_z() {
        let model = PedestrianModel::default();
        let state = state_with(OrientationKind::Quaternion, 0.7, 0.0, 0.0);
        let z = model.get_expected_measurement(&state, 0.0, 1.0);
        assert_approx_eq!(z[0], state[0], 1e-12);
        assert_approx_eq!(z[1], state[1], 1e-12);
        assert_approx_eq!(z[2], 0.6, 1e-12);
        assert_approx_eq!(z[3], 0.8, 1e-12);
        assert_approx_eq!(z[4], 0.1 + STANDARD_GRAVITY, 1e-12);
    }

    #[test]
    fn rotation_vector_channel() {
        let model = PedestrianModel::default();
        let mut state = state_with(OrientationKind::Quaternion, 0.4, 0.1, 0.2);
        // Negated quaternion is the same rotation and must give the same channel.
        for i in 5..9 {
            state[i] = -state[i];
        }
        let z = model.get_expected_measurement(&state, 0.5, 1.0);
        let q = attitude::quaternion_from_euler(0.4, 0.1, 0.2);
        assert_approx_eq!(z[5], q.i, 1e-12);
        assert_approx_eq!(z[6], q.j, 1e-12);
        assert_approx_eq!(z[7], q.k, 1e-12);
        assert_approx_eq!(z[8], q.w, 1e-12);
    }

    #[test]
    fn euler_channel_is_wrapped() {
        let model = PedestrianModel::new(OrientationKind::Euler);
        let state = state_with(OrientationKind::Euler, 3.5, 0.1, -0.2);
        let z = model.get_expected_measurement(&state, 0.5, 1.0);
        assert_approx_eq!(z[5], 3.5 - 2.0 * std::f64::consts::PI, 1e-12);
        assert_approx_eq!(z[6], 0.1, 1e-12);
        assert_approx_eq!(z[7], -0.2, 1e-12);
    }

    #[test]
    fn observed_vector_matches_expected_at_truth() {
        let model = PedestrianModel::default();
        let state = state_with(OrientationKind::Quaternion, -1.0, 0.0, 0.0);
        let q = attitude::quaternion_from_euler(-1.0, 0.0, 0.0);
        let expected = model.get_expected_measurement(&state, 0.0, 0.0);
        let observed = PedestrianMeasurement {
            position: [4.0, -3.0],
            acceleration: Vector3::new(0.6, 0.8, 0.1) + gravity_in_body(&q),
            orientation: q,
        };
        let z = observed.get_vector(OrientationKind::Quaternion);
        assert_approx_eq!((z - expected).norm(), 0.0, 1e-12);
    }

    #[test]
    fn euler_measurement_vector() {
        let q = attitude::quaternion_from_euler(0.3, -0.2, 0.1);
        let observed = PedestrianMeasurement {
            position: [1.0, 2.0],
            acceleration: Vector3::new(0.0, 0.0, STANDARD_GRAVITY),
            orientation: q,
        };
        let z = observed.get_vector(OrientationKind::Euler);
        assert_eq!(z.len(), 8);
        assert_approx_eq!(z[5], 0.3, 1e-12);
        assert_approx_eq!(z[6], -0.2, 1e-12);
        assert_approx_eq!(z[7], 0.1, 1e-12);
        assert!(observed.to_string().starts_with("PedestrianMeasurement("));
    }
}
