//! Ball-on-platform physics
//! Fixed-step integrator that rolls a ball across the platform plane under the
//! planar component of the measured gravity direction.
use log::debug;
use serde::{Deserialize, Serialize};

use crate::types::{is_finite2, BallState, GravityVector, Vec2};

pub const DEFAULT_DT: f64 = 0.016; // s, ~60 Hz
pub const DEFAULT_GRAVITY_SCALE: f64 = 9.8;
const MAX_DT: f64 = 1.0; // s

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum PlatformBounds {
    /// Axis-aligned, centred on the origin
    Rectangle { half_width: f64, half_depth: f64 },
    Circle { radius: f64 },
}

impl Default for PlatformBounds {
    fn default() -> Self {
        // 6 x 4 platform minus the ball's edge margin
        PlatformBounds::Rectangle {
            half_width: 3.0 - 1.0 / 3.0,
            half_depth: 2.0 - 1.0 / 3.0,
        }
    }
}

impl PlatformBounds {
    pub fn contains(&self, p: &Vec2) -> bool {
        match self {
            PlatformBounds::Rectangle {
                half_width,
                half_depth,
            } => p.x.abs() <= *half_width && p.y.abs() <= *half_depth,
            PlatformBounds::Circle { radius } => p.norm() <= *radius,
        }
    }

    fn validate(&self) -> Result<(), String> {
        let dims = match self {
            PlatformBounds::Rectangle {
                half_width,
                half_depth,
            } => vec![*half_width, *half_depth],
            PlatformBounds::Circle { radius } => vec![*radius],
        };
        if dims.iter().all(|d| d.is_finite() && *d > 0.0) {
            Ok(())
        } else {
            Err(format!("platform bounds must be positive, got {:?}", self))
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicsConfig {
    pub dt: f64,
    /// Velocity multiplier per step (1.0 disables damping)
    pub friction: f64,
    /// Fraction of normal speed kept after hitting the edge
    pub restitution: f64,
    pub bounds: PlatformBounds,
    pub gravity_scale: f64,
    pub min_gravity_scale: f64,
    pub max_gravity_scale: f64,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            dt: DEFAULT_DT,
            friction: 0.98,
            restitution: 0.5,
            bounds: PlatformBounds::default(),
            gravity_scale: DEFAULT_GRAVITY_SCALE,
            min_gravity_scale: 0.0,
            max_gravity_scale: 50.0,
        }
    }
}

impl PhysicsConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.dt > 0.0 && self.dt <= MAX_DT) {
            return Err(format!("physics dt must be in (0, {}], got {}", MAX_DT, self.dt));
        }
        if !(0.0..=1.0).contains(&self.friction) {
            return Err(format!("friction must be in [0, 1], got {}", self.friction));
        }
        if !(0.0..=1.0).contains(&self.restitution) {
            return Err(format!(
                "restitution must be in [0, 1], got {}",
                self.restitution
            ));
        }
        if !(self.min_gravity_scale.is_finite()
            && self.max_gravity_scale.is_finite()
            && self.min_gravity_scale <= self.max_gravity_scale)
        {
            return Err(format!(
                "gravity scale range [{}, {}] is invalid",
                self.min_gravity_scale, self.max_gravity_scale
            ));
        }
        self.bounds.validate()
    }
}

pub struct PlatformPhysics {
    config: PhysicsConfig,
    ball: BallState,
    gravity_scale: f64,
    bounces: u64,
}

impl PlatformPhysics {
    pub fn new(config: PhysicsConfig) -> Self {
        let gravity_scale =
            clamp_scale(&config, config.gravity_scale).unwrap_or(DEFAULT_GRAVITY_SCALE);
        Self {
            config,
            ball: BallState::at_rest(),
            gravity_scale,
            bounces: 0,
        }
    }

    pub fn dt(&self) -> f64 {
        self.config.dt
    }

    pub fn ball(&self) -> BallState {
        self.ball
    }

    pub fn gravity_scale(&self) -> f64 {
        self.gravity_scale
    }

    pub fn bounces(&self) -> u64 {
        self.bounces
    }

    pub fn bounds(&self) -> &PlatformBounds {
        &self.config.bounds
    }

    /// Clamp and apply; non-finite values leave the scale unchanged.
    /// Returns the scale now in effect.
    pub fn set_gravity_scale(&mut self, value: f64) -> f64 {
        match clamp_scale(&self.config, value) {
            Some(scale) => self.gravity_scale = scale,
            None => debug!("physics: ignoring gravity scale {}", value),
        }
        self.gravity_scale
    }

    pub fn reset(&mut self) {
        self.ball = BallState::at_rest();
    }

    /// Advance one fixed step. A zero gravity vector applies no force.
    pub fn step(&mut self, gravity: &GravityVector) -> BallState {
        let dt = self.config.dt;
        let accel = Vec2::new(gravity.x, gravity.y) * self.gravity_scale;

        let mut velocity = self.ball.velocity + accel * dt;
        velocity *= self.config.friction;
        let mut position = self.ball.position + velocity * dt;

        if !(is_finite2(&position) && is_finite2(&velocity)) {
            // unreachable with validated config and unit gravity
            position = Vec2::zeros();
            velocity = Vec2::zeros();
        }

        if self.resolve_boundary(&mut position, &mut velocity) {
            self.bounces += 1;
        }

        self.ball = BallState { position, velocity };
        self.ball
    }

    /// Clamp into bounds and reflect the outward normal component.
    fn resolve_boundary(&self, position: &mut Vec2, velocity: &mut Vec2) -> bool {
        let e = self.config.restitution;
        match self.config.bounds {
            PlatformBounds::Rectangle {
                half_width,
                half_depth,
            } => {
                let mut hit = false;
                for (axis, limit) in [(0usize, half_width), (1usize, half_depth)] {
                    if position[axis] > limit {
                        position[axis] = limit;
                        if velocity[axis] > 0.0 {
                            velocity[axis] = -velocity[axis] * e;
                        }
                        hit = true;
                    } else if position[axis] < -limit {
                        position[axis] = -limit;
                        if velocity[axis] < 0.0 {
                            velocity[axis] = -velocity[axis] * e;
                        }
                        hit = true;
                    }
                }
                hit
            }
            PlatformBounds::Circle { radius } => {
                let dist = position.norm();
                if dist <= radius {
                    return false;
                }
                let normal = *position / dist;
                *position = normal * radius;
                let vn = velocity.dot(&normal);
                if vn > 0.0 {
                    *velocity -= normal * (vn * (1.0 + e));
                }
                true
            }
        }
    }
}

// max/min rather than `clamp`, which panics on an inverted or NaN range
fn clamp_scale(config: &PhysicsConfig, value: f64) -> Option<f64> {
    if !value.is_finite() {
        return None;
    }
    Some(
        value
            .max(config.min_gravity_scale)
            .min(config.max_gravity_scale),
    )
}
