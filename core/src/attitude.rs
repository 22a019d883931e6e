//! Orientation helpers shared by the motion and measurement models
//!
//! Orientations are body-to-navigation rotations. The navigation frame is the local floor-plan frame
//! with its z axis pointing up, so the heading of the device is the yaw angle of the rotation (ZYX
//! convention, `nalgebra`'s `euler_angles()` ordering is `(roll, pitch, yaw)`).
use nalgebra::{Quaternion, UnitQuaternion, Vector3, Vector4};

use crate::{STANDARD_GRAVITY, wrap_to_pi};

/// Build a rotation from state components `[qw, qx, qy, qz]`
///
/// The quaternion is normalised; a zero or non-finite input yields a NaN rotation rather than a panic.
pub fn quaternion_from_components(w: f64, x: f64, y: f64, z: f64) -> UnitQuaternion<f64> {
    UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z))
}
/// Build a rotation from Euler angles in the state order `(yaw, pitch, roll)`
pub fn quaternion_from_euler(yaw: f64, pitch: f64, roll: f64) -> UnitQuaternion<f64> {
    UnitQuaternion::from_euler_angles(roll, pitch, yaw)
}
/// Euler angles `(yaw, pitch, roll)` of a rotation
pub fn euler_from_quaternion(q: &UnitQuaternion<f64>) -> (f64, f64, f64) {
    let (roll, pitch, yaw) = q.euler_angles();
    (yaw, pitch, roll)
}
/// Navigation-frame heading (yaw) of a body-to-navigation rotation, in (-π, π]
pub fn heading(q: &UnitQuaternion<f64>) -> f64 {
    wrap_to_pi(q.euler_angles().2)
}
/// Rotate an orientation by `turn` radians about the navigation-frame vertical
///
/// Left-multiplying by a pure yaw rotation changes the heading by exactly `turn` and leaves pitch and
/// roll untouched.
pub fn rotate_about_vertical(q: &UnitQuaternion<f64>, turn: f64) -> UnitQuaternion<f64> {
    UnitQuaternion::from_axis_angle(&Vector3::z_axis(), turn) * q
}
/// Gravity reaction as a level accelerometer would read it, expressed in the body frame
///
/// `g * R(q)ᵀ ẑ`, i.e. `g * [2(qx qz - qw qy), 2(qw qx + qy qz), qw² - qx² - qy² + qz²]`.
pub fn gravity_in_body(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    q.inverse_transform_vector(&Vector3::z()) * STANDARD_GRAVITY
}
/// Rotation vector channel `[qx, qy, qz, qw]` with the canonical sign `qw >= 0`
pub fn rotation_vector(q: &UnitQuaternion<f64>) -> Vector4<f64> {
    let sign = if q.w < 0.0 { -1.0 } else { 1.0 };
    Vector4::new(q.i, q.j, q.k, q.w) * sign
}
/// Navigation-frame heading rate from a body-frame angular rate
pub fn heading_rate(q: &UnitQuaternion<f64>, body_rate: &Vector3<f64>) -> f64 {
    (q * body_rate).z
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::{FRAC_PI_2, PI};

    #[test]
    fn heading_of_pure_yaw() {
        for yaw in [0.0, 0.3, -1.2, FRAC_PI_2, PI - 1e-3] {
            let q = quaternion_from_euler(yaw, 0.0, 0.0);
            assert_approx_eq!(heading(&q), yaw, 1e-12);
        }
    }

    #[test]
    fn heading_ignores_small_tilt() {
        let q = quaternion_from_euler(0.7, 0.1, -0.2);
        assert_approx_eq!(heading(&q), 0.7, 1e-12);
    }

    #[test]
    fn euler_round_trip() {
        let q = quaternion_from_euler(-2.0, 0.4, 0.25);
        let (yaw, pitch, roll) = euler_from_quaternion(&q);
        assert_approx_eq!(yaw, -2.0, 1e-12);
        assert_approx_eq!(pitch, 0.4, 1e-12);
        assert_approx_eq!(roll, 0.25, 1e-12);
    }

    #[test]
    fn rotation_about_vertical_adds_to_heading() {
        let q = quaternion_from_euler(PI - 0.1, 0.2, 0.1);
        let turned = rotate_about_vertical(&q, 0.3);
        let (yaw, pitch, roll) = euler_from_quaternion(&turned);
        assert_approx_eq!(yaw, -PI + 0.2, 1e-12);
        assert_approx_eq!(pitch, 0.2, 1e-12);
        assert_approx_eq!(roll, 0.1, 1e-12);
    }

    #[test]
    fn gravity_when_level() {
        let q = quaternion_from_euler(1.3, 0.0, 0.0);
        let g = gravity_in_body(&q);
        assert_approx_eq!(g[0], 0.0, 1e-12);
        assert_approx_eq!(g[1], 0.0, 1e-12);
        assert_approx_eq!(g[2], STANDARD_GRAVITY, 1e-12);
    }

    #[test]
    fn gravity_matches_component_formula() {
        let q = quaternion_from_euler(0.4, -0.3, 0.6);
        let (w, x, y, z) = (q.w, q.i, q.j, q.k);
        let expected = Vector3::new(
            2.0 * (x * z - w * y),
            2.0 * (w * x + y * z),
            w * w - x * x - y * y + z * z,
        ) * STANDARD_GRAVITY;
        assert_approx_eq!((gravity_in_body(&q) - expected).norm(), 0.0, 1e-12);
    }

    #[test]
    fn rotation_vector_has_canonical_sign() {
        let q = quaternion_from_components(-0.9, 0.1, 0.2, 0.3);
        let rv = rotation_vector(&q);
        assert!(rv[3] > 0.0);
        assert_approx_eq!(rv.norm(), 1.0, 1e-12);
        assert!(rv[0] < 0.0);
    }

    #[test]
    fn heading_rate_of_level_device() {
        let q = quaternion_from_euler(0.5, 0.0, 0.0);
        let rate = heading_rate(&q, &Vector3::new(0.0, 0.0, 0.25));
        assert_approx_eq!(rate, 0.25, 1e-12);
    }

    #[test]
    fn nan_components_do_not_panic() {
        let q = quaternion_from_components(f64::NAN, 0.0, 0.0, 0.0);
        assert!(heading(&q).is_nan());
        assert!(gravity_in_body(&q)[2].is_nan());
    }
}
