//! Component layout of state and measurement vectors
//!
//! Sigma-point filtering averages and subtracts vectors whose components do not all live on the real
//! line. Angles wrap around at ±π and a unit quaternion is only defined up to sign. A [VectorLayout]
//! records which components of a vector are angular and where a quaternion block starts so that the
//! unscented transform, the update step and the smoother can all use the same circular-aware
//! operations:
//!
//! - [VectorLayout::weighted_mean]: circular mean `atan2(Σ w sin, Σ w cos)` for angles, sign-aligned
//!   weighted sum plus renormalisation for the quaternion block, arithmetic mean elsewhere.
//! - [VectorLayout::residual]: difference with angles wrapped to (-π, π] and the quaternion block sign
//!   aligned before subtracting.
//! - [VectorLayout::add]: apply a correction and restore the invariants.
use nalgebra::{DMatrix, DVector, Vector4};

use crate::wrap_to_pi;

/// Size of a quaternion block
pub const QUATERNION_LEN: usize = 4;

/// Describes which components of a vector need circular or quaternion treatment
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VectorLayout {
    dimension: usize,
    angular: Vec<usize>,
    quaternion: Option<usize>,
}

impl VectorLayout {
    /// A layout where every component is an ordinary real number
    pub fn linear(dimension: usize) -> Self {
        VectorLayout {
            dimension,
            angular: Vec::new(),
            quaternion: None,
        }
    }
    /// Mark the given components as angles in radians
    pub fn with_angles(mut self, indices: &[usize]) -> Self {
        for &index in indices {
            assert!(
                index < self.dimension,
                "VectorLayout::with_angles: index {index} out of range for dimension {}",
                self.dimension
            );
            assert!(
                !self.in_quaternion(index),
                "VectorLayout::with_angles: index {index} overlaps the quaternion block"
            );
            if !self.angular.contains(&index) {
                self.angular.push(index);
            }
        }
        self.angular.sort_unstable();
        self
    }
    /// Mark four consecutive components starting at `start` as a unit quaternion
    pub fn with_quaternion(mut self, start: usize) -> Self {
        assert!(
            start + QUATERNION_LEN <= self.dimension,
            "VectorLayout::with_quaternion: block does not fit in dimension {}",
            self.dimension
        );
        assert!(
            self.angular
                .iter()
                .all(|&i| i < start || i >= start + QUATERNION_LEN),
            "VectorLayout::with_quaternion: block overlaps angular components"
        );
        self.quaternion = Some(start);
        self
    }
    pub fn dimension(&self) -> usize {
        self.dimension
    }
    pub fn angular(&self) -> &[usize] {
        &self.angular
    }
    pub fn quaternion(&self) -> Option<usize> {
        self.quaternion
    }
    pub fn is_angular(&self, index: usize) -> bool {
        self.angular.binary_search(&index).is_ok()
    }
    fn in_quaternion(&self, index: usize) -> bool {
        self.quaternion
            .is_some_and(|start| index >= start && index < start + QUATERNION_LEN)
    }
    /// Weighted mean of the columns of `points`
    ///
    /// Weights may be negative (the zeroth sigma weight often is); they are expected to sum to one.
    pub fn weighted_mean(&self, points: &DMatrix<f64>, weights: &DVector<f64>) -> DVector<f64> {
        assert_eq!(
            points.nrows(),
            self.dimension,
            "VectorLayout::weighted_mean: points do not match the layout dimension"
        );
        assert_eq!(
            points.ncols(),
            weights.len(),
            "VectorLayout::weighted_mean: expected one weight per point"
        );
        let mut mean = points * weights;
        for &index in &self.angular {
            let (sin_sum, cos_sum) = points
                .row(index)
                .iter()
                .zip(weights.iter())
                .fold((0.0, 0.0), |(s, c), (angle, w)| {
                    (s + w * angle.sin(), c + w * angle.cos())
                });
            mean[index] = sin_sum.atan2(cos_sum);
        }
        if let Some(start) = self.quaternion {
            let reference: Vector4<f64> = points.fixed_view::<4, 1>(start, 0).into_owned();
            let mut sum = Vector4::zeros();
            for (point, w) in points.column_iter().zip(weights.iter()) {
                let q: Vector4<f64> = point.fixed_rows::<4>(start).into_owned();
                let sign = if q.dot(&reference) < 0.0 { -1.0 } else { 1.0 };
                sum += q * (w * sign);
            }
            mean.fixed_rows_mut::<4>(start).copy_from(&renormalized(sum));
        }
        mean
    }
    /// Layout-aware difference `a - b`
    pub fn residual(&self, a: &DVector<f64>, b: &DVector<f64>) -> DVector<f64> {
        assert!(
            a.len() == self.dimension && b.len() == self.dimension,
            "VectorLayout::residual: vectors do not match the layout dimension"
        );
        let mut r = a - b;
        for &index in &self.angular {
            r[index] = wrap_to_pi(r[index]);
        }
        if let Some(start) = self.quaternion {
            let qa = a.fixed_rows::<4>(start);
            let qb = b.fixed_rows::<4>(start);
            if qa.dot(&qb) < 0.0 {
                let flipped = -qa - qb;
                r.fixed_rows_mut::<4>(start).copy_from(&flipped);
            }
        }
        r
    }
    /// Apply a correction `base + delta` and restore the layout invariants
    pub fn add(&self, base: &DVector<f64>, delta: &DVector<f64>) -> DVector<f64> {
        assert!(
            base.len() == self.dimension && delta.len() == self.dimension,
            "VectorLayout::add: vectors do not match the layout dimension"
        );
        let mut sum = base + delta;
        self.normalize(&mut sum);
        sum
    }
    /// Wrap angular components and renormalise the quaternion block in place
    ///
    /// A zero or non-finite quaternion block is left untouched so that NaN propagates instead of
    /// being replaced by an arbitrary rotation.
    pub fn normalize(&self, vector: &mut DVector<f64>) {
        for &index in &self.angular {
            vector[index] = wrap_to_pi(vector[index]);
        }
        if let Some(start) = self.quaternion {
            let q: Vector4<f64> = vector.fixed_rows::<4>(start).into_owned();
            vector.fixed_rows_mut::<4>(start).copy_from(&renormalized(q));
        }
    }
}

fn renormalized(q: Vector4<f64>) -> Vector4<f64> {
    let norm = q.norm();
    if norm > 0.0 && norm.is_finite() {
        q / norm
    } else {
        q
    }
}
