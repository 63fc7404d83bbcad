//! Pairing of the two IMU streams and the bounded history of their difference.
//!
//! Stream A is the platform IMU, stream B the reference (second IMU or a
//! filtered copy of A). Every emitted sample is `A - B`.

use std::collections::VecDeque;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::types::{ErrorSample, ImuSample};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stream {
    A,
    B,
}

impl Stream {
    pub fn other(self) -> Self {
        match self {
            Stream::A => Stream::B,
            Stream::B => Stream::A,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum PairingPolicy {
    /// Match each sample with the closest pending sample of the other stream
    NearestTimestamp { tolerance_s: f64 },
    /// Pair with whatever the other stream sent last
    LatestValue,
}

impl Default for PairingPolicy {
    fn default() -> Self {
        PairingPolicy::NearestTimestamp { tolerance_s: 0.02 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub capacity: usize,
    pub pairing: PairingPolicy,
    /// Unmatched samples kept per stream
    pub pending_capacity: usize,
    /// Seconds shown by the error plot
    pub plot_window_s: f64,
    pub degraded_threshold: f64,
    /// Pairing attempts needed before the drop rate is judged
    pub min_attempts: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            capacity: 200,
            pairing: PairingPolicy::default(),
            pending_capacity: 64,
            plot_window_s: 4.0,
            degraded_threshold: 0.25,
            min_attempts: 20,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.capacity == 0 {
            return Err("error history capacity must be at least 1".to_string());
        }
        if self.pending_capacity == 0 {
            return Err("pending capacity must be at least 1".to_string());
        }
        if let PairingPolicy::NearestTimestamp { tolerance_s } = self.pairing {
            if !(tolerance_s.is_finite() && tolerance_s >= 0.0) {
                return Err(format!("pairing tolerance must be >= 0, got {}", tolerance_s));
            }
        }
        if !(self.plot_window_s > 0.0) {
            return Err(format!("plot window must be positive, got {}", self.plot_window_s));
        }
        if !(0.0..=1.0).contains(&self.degraded_threshold) {
            return Err(format!(
                "degraded threshold must be in [0, 1], got {}",
                self.degraded_threshold
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PairingDiagnostics {
    pub paired: u64,
    pub dropped: u64,
    pub drop_rate: f64,
    pub degraded: bool,
}

/// Per-series statistics over the history, ordered like `ErrorSample::series`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub count: usize,
    pub mean: [f64; 6],
    pub rms: [f64; 6],
}

/// Y-axis range for a plotted series.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlotRange {
    pub min: f64,
    pub max: f64,
}

impl PlotRange {
    /// Min/max with a 10% margin; a flat series gets ±1 around its value.
    pub fn from_samples<I: IntoIterator<Item = f64>>(values: I) -> Self {
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for v in values.into_iter().filter(|v| v.is_finite()) {
            lo = lo.min(v);
            hi = hi.max(v);
        }
        if !lo.is_finite() {
            return Self { min: -1.0, max: 1.0 };
        }
        let span = hi - lo;
        if span < 1e-12 {
            return Self {
                min: lo - 1.0,
                max: hi + 1.0,
            };
        }
        let margin = span * 0.1;
        Self {
            min: lo - margin,
            max: hi + margin,
        }
    }
}

pub struct ErrorTracker {
    config: TrackerConfig,
    history: VecDeque<ErrorSample>,
    pending_a: VecDeque<ImuSample>,
    pending_b: VecDeque<ImuSample>,
    latest_a: Option<ImuSample>,
    latest_b: Option<ImuSample>,
    paired: u64,
    dropped: u64,
    degraded: bool,
}

impl ErrorTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            history: VecDeque::with_capacity(config.capacity),
            pending_a: VecDeque::new(),
            pending_b: VecDeque::new(),
            latest_a: None,
            latest_b: None,
            paired: 0,
            dropped: 0,
            degraded: false,
            config,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    fn tolerance(&self) -> Option<f64> {
        match self.config.pairing {
            PairingPolicy::NearestTimestamp { tolerance_s } => Some(tolerance_s),
            PairingPolicy::LatestValue => None,
        }
    }

    /// Compare an explicit pair. Pairs further apart than the tolerance are
    /// dropped and counted.
    pub fn observe(&mut self, a: &ImuSample, b: &ImuSample) -> Option<ErrorSample> {
        if let Some(tolerance) = self.tolerance() {
            if (a.timestamp - b.timestamp).abs() > tolerance {
                self.record_drops(1);
                return None;
            }
        }
        Some(self.record(a, b))
    }

    /// Feed one sample from a stream and pair it under the configured policy.
    pub fn push(&mut self, stream: Stream, sample: ImuSample) -> Option<ErrorSample> {
        match self.tolerance() {
            None => self.push_latest(stream, sample),
            Some(tolerance) => self.push_nearest(stream, sample, tolerance),
        }
    }

    fn push_latest(&mut self, stream: Stream, sample: ImuSample) -> Option<ErrorSample> {
        let (own, other) = match stream {
            Stream::A => (&mut self.latest_a, self.latest_b.clone()),
            Stream::B => (&mut self.latest_b, self.latest_a.clone()),
        };
        *own = Some(sample.clone());
        let other = other?;
        Some(match stream {
            Stream::A => self.record(&sample, &other),
            Stream::B => self.record(&other, &sample),
        })
    }

    fn push_nearest(
        &mut self,
        stream: Stream,
        sample: ImuSample,
        tolerance: f64,
    ) -> Option<ErrorSample> {
        let horizon = sample.timestamp - tolerance;
        let other = self.pending_mut(stream.other());

        // other-stream samples this old can never match again
        let mut stale = 0;
        while other.front().is_some_and(|s| s.timestamp < horizon) {
            other.pop_front();
            stale += 1;
        }

        let nearest = other
            .iter()
            .enumerate()
            .map(|(i, s)| (i, (s.timestamp - sample.timestamp).abs()))
            .filter(|(_, gap)| *gap <= tolerance)
            .min_by(|x, y| x.1.total_cmp(&y.1))
            .map(|(i, _)| i);
        let matched = nearest.and_then(|i| other.remove(i));
        self.record_drops(stale);

        if let Some(partner) = matched {
            return Some(match stream {
                Stream::A => self.record(&sample, &partner),
                Stream::B => self.record(&partner, &sample),
            });
        }

        let capacity = self.config.pending_capacity;
        let own = self.pending_mut(stream);
        own.push_back(sample);
        let mut overflow = 0;
        while own.len() > capacity {
            own.pop_front();
            overflow += 1;
        }
        self.record_drops(overflow);
        None
    }

    fn pending_mut(&mut self, stream: Stream) -> &mut VecDeque<ImuSample> {
        match stream {
            Stream::A => &mut self.pending_a,
            Stream::B => &mut self.pending_b,
        }
    }

    fn record(&mut self, a: &ImuSample, b: &ImuSample) -> ErrorSample {
        let sample = ErrorSample::between(a, b);
        if self.history.len() == self.config.capacity {
            self.history.pop_front();
        }
        self.history.push_back(sample.clone());
        self.paired += 1;
        self.update_degraded();
        sample
    }

    fn record_drops(&mut self, count: u64) {
        if count == 0 {
            return;
        }
        self.dropped += count;
        debug!("tracker: dropped {} unpaired samples", count);
        self.update_degraded();
    }

    fn update_degraded(&mut self) {
        let diag = self.diagnostics();
        if diag.degraded && !self.degraded {
            warn!(
                "IMU pairing degraded: {:.0}% of samples dropped ({} paired, {} dropped)",
                diag.drop_rate * 100.0,
                diag.paired,
                diag.dropped
            );
        }
        self.degraded = diag.degraded;
    }

    pub fn diagnostics(&self) -> PairingDiagnostics {
        let attempts = self.paired + self.dropped;
        let drop_rate = if attempts == 0 {
            0.0
        } else {
            self.dropped as f64 / attempts as f64
        };
        PairingDiagnostics {
            paired: self.paired,
            dropped: self.dropped,
            drop_rate,
            degraded: attempts >= self.config.min_attempts
                && drop_rate > self.config.degraded_threshold,
        }
    }

    /// Oldest to newest.
    pub fn history(&self) -> impl Iterator<Item = &ErrorSample> + '_ {
        self.history.iter()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn latest(&self) -> Option<&ErrorSample> {
        self.history.back()
    }

    /// Samples no older than `seconds` before the newest one.
    pub fn window(&self, seconds: f64) -> Vec<ErrorSample> {
        let Some(newest) = self.history.back() else {
            return Vec::new();
        };
        let cutoff = newest.timestamp - seconds;
        self.history
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    /// Samples inside the configured plot window.
    pub fn plot_window(&self) -> Vec<ErrorSample> {
        self.window(self.config.plot_window_s)
    }

    pub fn summary(&self) -> ErrorSummary {
        let count = self.history.len();
        let mut mean = [0.0; 6];
        let mut rms = [0.0; 6];
        if count == 0 {
            return ErrorSummary { count, mean, rms };
        }
        for sample in &self.history {
            for (i, v) in sample.series().iter().enumerate() {
                mean[i] += v;
                rms[i] += v * v;
            }
        }
        let n = count as f64;
        for i in 0..6 {
            mean[i] /= n;
            rms[i] = (rms[i] / n).sqrt();
        }
        ErrorSummary { count, mean, rms }
    }

    /// Forget unmatched samples (session boundary: timestamps restart).
    pub fn clear_pending(&mut self) {
        self.pending_a.clear();
        self.pending_b.clear();
        self.latest_a = None;
        self.latest_b = None;
    }

    pub fn clear(&mut self) {
        self.clear_pending();
        self.history.clear();
        self.paired = 0;
        self.dropped = 0;
        self.degraded = false;
    }
}
