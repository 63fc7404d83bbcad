//! Gravity direction from the platform accelerometer.
//!
//! Raw accelerometer vectors are low-pass filtered and then normalized. When the
//! filtered vector is too small to normalize (free fall, a dead sensor, NaN
//! input) the last valid direction is kept.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::smoothing::{EmaSmoother, HannSmoother};
use crate::types::{is_finite3, GravityVector, Vec3};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GravityFilter {
    Ema { time_constant_s: f64 },
    Hann { window: usize },
}

impl Default for GravityFilter {
    fn default() -> Self {
        GravityFilter::Ema {
            time_constant_s: 0.1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GravityConfig {
    pub filter: GravityFilter,
    /// Nominal accelerometer sample period used by `estimate`
    pub sample_period_s: f64,
    /// Raw magnitude (m/s²) below which the estimate is held
    pub epsilon: f64,
}

impl Default for GravityConfig {
    fn default() -> Self {
        Self {
            filter: GravityFilter::default(),
            sample_period_s: 0.01,
            epsilon: 1e-3,
        }
    }
}

impl GravityConfig {
    pub fn validate(&self) -> Result<(), String> {
        match &self.filter {
            GravityFilter::Ema { time_constant_s } if !(*time_constant_s >= 0.0) => {
                return Err(format!(
                    "gravity time constant must be >= 0, got {}",
                    time_constant_s
                ));
            }
            GravityFilter::Hann { window } if *window == 0 => {
                return Err("gravity Hann window must be at least 1".to_string());
            }
            _ => {}
        }
        if !(self.sample_period_s > 0.0) {
            return Err(format!(
                "gravity sample period must be positive, got {}",
                self.sample_period_s
            ));
        }
        if !(self.epsilon > 0.0) {
            return Err(format!("gravity epsilon must be positive, got {}", self.epsilon));
        }
        Ok(())
    }
}

enum Smoother {
    Ema(EmaSmoother),
    Hann(HannSmoother),
}

impl Smoother {
    fn from_filter(filter: &GravityFilter) -> Self {
        match filter {
            GravityFilter::Ema { time_constant_s } => Smoother::Ema(EmaSmoother::new(*time_constant_s)),
            GravityFilter::Hann { window } => Smoother::Hann(HannSmoother::new(*window)),
        }
    }

    fn apply(&mut self, accel: Vec3, dt: f64) -> Vec3 {
        match self {
            Smoother::Ema(s) => s.apply(accel, dt),
            Smoother::Hann(s) => s.apply(accel),
        }
    }

    fn clear(&mut self) {
        match self {
            Smoother::Ema(s) => s.clear(),
            Smoother::Hann(s) => s.clear(),
        }
    }
}

pub struct GravityEstimator {
    config: GravityConfig,
    smoother: Smoother,
    current: GravityVector,
    rejected: u64,
}

impl GravityEstimator {
    pub fn new(config: GravityConfig) -> Self {
        Self {
            smoother: Smoother::from_filter(&config.filter),
            config,
            current: GravityVector::ZERO,
            rejected: 0,
        }
    }

    /// Feed one accelerometer reading sampled at the nominal period.
    pub fn estimate(&mut self, accel: Vec3) -> GravityVector {
        self.estimate_with_dt(accel, self.config.sample_period_s)
    }

    pub fn estimate_with_dt(&mut self, accel: Vec3, dt: f64) -> GravityVector {
        if !is_finite3(&accel) || accel.norm() < self.config.epsilon {
            // keeps degenerate readings out of the filter state too
            self.rejected += 1;
            debug!("gravity: ignoring degenerate accel {:?}", accel);
            return self.current;
        }
        let dt = if dt.is_finite() && dt > 0.0 {
            dt
        } else {
            self.config.sample_period_s
        };

        let filtered = self.smoother.apply(accel, dt);
        match GravityVector::from_vector(&filtered, self.config.epsilon) {
            Some(g) => self.current = g,
            None => self.rejected += 1,
        }
        self.current
    }

    pub fn current(&self) -> GravityVector {
        self.current
    }

    /// Samples that could not update the estimate
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn reset(&mut self) {
        self.smoother.clear();
        self.current = GravityVector::ZERO;
        self.rejected = 0;
    }
}

/// Platform roll/pitch in degrees as shown by the firmware's tilt gauge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformTilt {
    pub roll_deg: f64,
    pub pitch_deg: f64,
}

impl PlatformTilt {
    /// `ax`/`ay` in raw counts; `full_scale` counts map to ±90°.
    pub fn from_raw(ax: f64, ay: f64, full_scale: f64) -> Self {
        let angle = |raw: f64| {
            if !raw.is_finite() || full_scale <= 0.0 {
                return 0.0;
            }
            (raw / full_scale).clamp(-1.0, 1.0) * 90.0
        };
        Self {
            roll_deg: angle(ax),
            pitch_deg: angle(ay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn hann(window: usize) -> GravityEstimator {
        GravityEstimator::new(GravityConfig {
            filter: GravityFilter::Hann { window },
            ..GravityConfig::default()
        })
    }

    #[test]
    fn test_zero_before_valid_input() {
        let mut est = GravityEstimator::new(GravityConfig::default());
        assert!(est.current().is_zero());
        assert!(est.estimate(Vec3::zeros()).is_zero());
        assert_eq!(est.rejected(), 1);
    }

    #[test]
    fn test_unit_length_output() {
        let mut est = GravityEstimator::new(GravityConfig::default());
        let inputs = [
            Vec3::new(0.0, 0.0, 9.81),
            Vec3::new(1.2, -0.4, 9.6),
            Vec3::new(-5.0, 5.0, 5.0),
            Vec3::new(0.01, 0.0, 0.0),
        ];
        for accel in inputs {
            let g = est.estimate(accel);
            assert_relative_eq!(g.magnitude(), 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_degenerate_input_retains_previous() {
        let mut est = hann(1);
        let g = est.estimate(Vec3::new(0.0, -9.81, 0.0));
        assert_relative_eq!(g.y, -1.0, epsilon = 1e-12);

        assert_eq!(est.estimate(Vec3::zeros()), g);
        assert_eq!(est.estimate(Vec3::new(f64::NAN, 0.0, 1.0)), g);
        assert_eq!(est.estimate(Vec3::new(0.0, f64::INFINITY, 0.0)), g);
        assert_eq!(est.rejected(), 3);
    }

    #[test]
    fn test_near_zero_reading_does_not_move_estimate() {
        let mut est = GravityEstimator::new(GravityConfig::default());
        let g0 = est.estimate(Vec3::new(0.0, 0.0, 9.81));
        let g1 = est.estimate(Vec3::new(5e-4, 0.0, 0.0));
        assert_eq!(g1, g0);
        assert_eq!(est.rejected(), 1);

        // the rejected sample never reached the filter
        let g2 = est.estimate(Vec3::new(0.0, 0.0, 9.81));
        assert_eq!(g2, g0);
    }

    #[test]
    fn test_ema_tracks_rotation() {
        let mut est = GravityEstimator::new(GravityConfig {
            filter: GravityFilter::Ema {
                time_constant_s: 0.05,
            },
            ..GravityConfig::default()
        });
        est.estimate(Vec3::new(0.0, 0.0, 9.81));
        let mut g = GravityVector::ZERO;
        for _ in 0..200 {
            g = est.estimate(Vec3::new(9.81, 0.0, 0.0));
        }
        assert_relative_eq!(g.x, 1.0, epsilon = 1e-6);
        assert_relative_eq!(g.magnitude(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_ema_lags_step_change() {
        let mut est = GravityEstimator::new(GravityConfig::default());
        est.estimate(Vec3::new(0.0, 0.0, 9.81));
        let g = est.estimate(Vec3::new(9.81, 0.0, 0.0));
        // one 10 ms step into a 100 ms filter moves only a little
        assert!(g.z > 0.9);
        assert!(g.x > 0.0);
    }

    #[test]
    fn test_reset() {
        let mut est = hann(5);
        est.estimate(Vec3::new(0.0, 0.0, 9.81));
        est.reset();
        assert!(est.current().is_zero());
        let g = est.estimate(Vec3::new(0.0, 9.81, 0.0));
        assert_relative_eq!(g.y, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_bad_dt_falls_back_to_nominal() {
        let mut a = GravityEstimator::new(GravityConfig::default());
        let mut b = GravityEstimator::new(GravityConfig::default());
        for accel in [Vec3::new(0.0, 0.0, 9.81), Vec3::new(9.81, 0.0, 0.0)] {
            let ga = a.estimate(accel);
            let gb = b.estimate_with_dt(accel, f64::NAN);
            assert_eq!(ga, gb);
        }
    }

    #[test]
    fn test_platform_tilt() {
        let t = PlatformTilt::from_raw(8500.0, -17000.0, 17000.0);
        assert_relative_eq!(t.roll_deg, 45.0, epsilon = 1e-12);
        assert_relative_eq!(t.pitch_deg, -90.0, epsilon = 1e-12);

        let clamped = PlatformTilt::from_raw(40000.0, f64::NAN, 17000.0);
        assert_eq!(clamped.roll_deg, 90.0);
        assert_eq!(clamped.pitch_deg, 0.0);
    }

    #[test]
    fn test_config_validation() {
        assert!(GravityConfig::default().validate().is_ok());
        let bad = GravityConfig {
            filter: GravityFilter::Hann { window: 0 },
            ..GravityConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = GravityConfig {
            epsilon: 0.0,
            ..GravityConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
