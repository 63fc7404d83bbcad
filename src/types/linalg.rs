//! Linear algebra aliases shared by the codec, estimator and physics stages.

use nalgebra::{Vector2, Vector3};

/// Per-axis triple (accel in m/s², gyro in rad/s, gravity direction).
pub type Vec3 = Vector3<f64>;

/// Platform-plane vector (ball position / velocity).
pub type Vec2 = Vector2<f64>;

/// Magnitude below which a vector is treated as zero.
pub const ZERO_EPSILON: f64 = 1e-9;

#[inline]
pub fn is_finite3(v: &Vec3) -> bool {
    v.iter().all(|c| c.is_finite())
}

#[inline]
pub fn is_finite2(v: &Vec2) -> bool {
    v.iter().all(|c| c.is_finite())
}
