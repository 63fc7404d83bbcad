use std::collections::{HashMap, VecDeque};

use crate::types::Vec3;

/// Hann-window smoothing over the last `window_size` vectors
pub struct HannSmoother {
    window: VecDeque<Vec3>,
    window_size: usize,
    weights_cache: HashMap<usize, Vec<f64>>,
}

impl HannSmoother {
    /// Create a new smoother with given window size (typically 9)
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        HannSmoother {
            window: VecDeque::with_capacity(window_size),
            window_size,
            weights_cache: HashMap::new(),
        }
    }

    /// Push a vector and return the weighted average of the current window
    pub fn apply(&mut self, value: Vec3) -> Vec3 {
        self.window.push_back(value);
        while self.window.len() > self.window_size {
            self.window.pop_front();
        }

        let length = self.window.len();
        if length == 1 {
            return value;
        }

        let weights = self
            .weights_cache
            .entry(length)
            .or_insert_with(|| hann_weights(length));

        self.window
            .iter()
            .zip(weights.iter())
            .fold(Vec3::zeros(), |acc, (v, w)| acc + v * *w)
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }
}

/// Normalized Hann weights: 0.5 - 0.5 * cos(2πi / (length-1))
fn hann_weights(length: usize) -> Vec<f64> {
    if length <= 1 {
        return vec![1.0];
    }
    if length == 2 {
        return vec![0.5, 0.5];
    }

    let mut weights: Vec<f64> = (0..length)
        .map(|i| {
            let angle = (2.0 * std::f64::consts::PI * i as f64) / (length as f64 - 1.0);
            0.5 - 0.5 * angle.cos()
        })
        .collect();

    let sum: f64 = weights.iter().sum();
    let total = if sum > 0.0 { sum } else { 1.0 };
    weights.iter_mut().for_each(|w| *w /= total);
    weights
}

/// First-order low-pass: `y += alpha * (x - y)` with `alpha = dt / (tau + dt)`
pub struct EmaSmoother {
    time_constant_s: f64,
    state: Option<Vec3>,
}

impl EmaSmoother {
    pub fn new(time_constant_s: f64) -> Self {
        EmaSmoother {
            time_constant_s: time_constant_s.max(0.0),
            state: None,
        }
    }

    pub fn alpha(&self, dt: f64) -> f64 {
        if dt <= 0.0 {
            return 0.0;
        }
        dt / (self.time_constant_s + dt)
    }

    pub fn apply(&mut self, value: Vec3, dt: f64) -> Vec3 {
        let next = match self.state {
            None => value,
            Some(prev) => prev + (value - prev) * self.alpha(dt),
        };
        self.state = Some(next);
        next
    }

    pub fn current(&self) -> Option<Vec3> {
        self.state
    }

    pub fn clear(&mut self) {
        self.state = None;
    }
}
