pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};

/// One decoded IMU reading, already scaled to physical units.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImuSample {
    /// IMU id as sent on the wire (1 = platform IMU, 2 = reference IMU).
    pub imu: u8,
    /// Seconds since the start of the connection session.
    pub timestamp: f64,
    /// m/s²
    pub accel: Vec3,
    /// rad/s
    pub gyro: Vec3,
}

impl ImuSample {
    pub fn new(imu: u8, timestamp: f64, accel: Vec3, gyro: Vec3) -> Self {
        Self {
            imu,
            timestamp,
            accel,
            gyro,
        }
    }
}

/// Servo angles in degrees, one per platform actuator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServoAngles {
    pub timestamp: f64,
    pub angles: [i16; 6],
}

impl ServoAngles {
    /// Bar level per servo: -90° maps to 0.0, +90° maps to 1.0.
    pub fn bar_levels(&self) -> [f64; 6] {
        self.angles
            .map(|a| ((f64::from(a) + 90.0) / 180.0).clamp(0.0, 1.0))
    }
}

/// Everything the firmware sends us.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Imu(ImuSample),
    Servo(ServoAngles),
}

impl Frame {
    pub fn timestamp(&self) -> f64 {
        match self {
            Frame::Imu(s) => s.timestamp,
            Frame::Servo(s) => s.timestamp,
        }
    }
}

/// Difference between two paired IMU readings, `A - B` per axis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorSample {
    pub timestamp: f64,
    pub delta_accel: Vec3,
    pub delta_gyro: Vec3,
}

impl ErrorSample {
    pub fn between(a: &ImuSample, b: &ImuSample) -> Self {
        Self {
            timestamp: a.timestamp.max(b.timestamp),
            delta_accel: a.accel - b.accel,
            delta_gyro: a.gyro - b.gyro,
        }
    }

    /// The six plotted series in order: ΔAccel X/Y/Z, ΔGyro X/Y/Z.
    pub fn series(&self) -> [f64; 6] {
        [
            self.delta_accel.x,
            self.delta_accel.y,
            self.delta_accel.z,
            self.delta_gyro.x,
            self.delta_gyro.y,
            self.delta_gyro.z,
        ]
    }
}

/// Normalized gravity direction. The zero vector means "no estimate yet".
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GravityVector {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl GravityVector {
    pub const ZERO: GravityVector = GravityVector {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    /// Returns `None` for vectors too small (or not finite) to normalize.
    pub fn from_vector(v: &Vec3, epsilon: f64) -> Option<Self> {
        if !is_finite3(v) {
            return None;
        }
        let norm = v.norm();
        if norm < epsilon.max(ZERO_EPSILON) {
            return None;
        }
        let unit = v / norm;
        Some(Self {
            x: unit.x,
            y: unit.y,
            z: unit.z,
        })
    }

    pub fn as_vec3(&self) -> Vec3 {
        Vec3::new(self.x, self.y, self.z)
    }

    pub fn magnitude(&self) -> f64 {
        self.as_vec3().norm()
    }

    pub fn is_zero(&self) -> bool {
        self.x == 0.0 && self.y == 0.0 && self.z == 0.0
    }
}

impl Default for GravityVector {
    fn default() -> Self {
        Self::ZERO
    }
}

/// Ball on the platform plane.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BallState {
    pub position: Vec2,
    pub velocity: Vec2,
}

impl BallState {
    pub fn at_rest() -> Self {
        Self {
            position: Vec2::zeros(),
            velocity: Vec2::zeros(),
        }
    }

    pub fn speed(&self) -> f64 {
        self.velocity.norm()
    }
}

impl Default for BallState {
    fn default() -> Self {
        Self::at_rest()
    }
}
