use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub imu_silence_s: f64,
    pub servo_silence_s: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            imu_silence_s: 1.0,
            servo_silence_s: 5.0,
        }
    }
}

/// Longest silence threshold accepted from config, seconds.
const MAX_SILENCE_S: f64 = 3600.0;

impl HealthConfig {
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("imu_silence_s", self.imu_silence_s),
            ("servo_silence_s", self.servo_silence_s),
        ] {
            if !(value > 0.0 && value <= MAX_SILENCE_S) {
                return Err(format!(
                    "{} must be in (0, {}], got {}",
                    name, MAX_SILENCE_S, value
                ));
            }
        }
        Ok(())
    }
}

/// Tracks arrival of one frame stream
#[derive(Clone, Debug)]
pub struct StreamHealth {
    pub name: String,
    pub silence_threshold: Duration,
    last_update: Option<Instant>,
    since: Instant,
    samples: u64,
    silent: bool,
}

impl StreamHealth {
    pub fn new(name: &str, silence_threshold_secs: f64, now: Instant) -> Self {
        StreamHealth {
            name: name.to_string(),
            // out-of-range thresholds mean "never silent"
            silence_threshold: Duration::try_from_secs_f64(silence_threshold_secs)
                .unwrap_or(Duration::MAX),
            last_update: None,
            since: now,
            samples: 0,
            silent: false,
        }
    }

    pub fn update(&mut self, now: Instant) {
        self.last_update = Some(now);
        self.samples += 1;
    }

    /// Time since the last sample, or since the watch started if none arrived.
    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_update.unwrap_or(self.since))
    }

    pub fn is_silent(&self, now: Instant) -> bool {
        self.silence(now) > self.silence_threshold
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Restart the silence clock (new connection session).
    pub fn restart(&mut self, now: Instant) {
        self.last_update = None;
        self.since = now;
        self.silent = false;
    }

    fn status(&self, now: Instant) -> StreamStatus {
        StreamStatus {
            name: self.name.clone(),
            healthy: !self.is_silent(now),
            silence_s: self.silence(now).as_secs_f64(),
            samples: self.samples,
        }
    }

    /// Edge-triggered logging; returns the current status.
    fn check(&mut self, now: Instant, watched: bool) -> StreamStatus {
        let status = self.status(now);
        if !watched {
            self.silent = false;
            return status;
        }
        if !status.healthy && !self.silent {
            warn!(
                "[HEALTH] {} SILENT for {:.1}s",
                self.name, status.silence_s
            );
        } else if status.healthy && self.silent {
            info!("[HEALTH] {} recovered", self.name);
        }
        self.silent = !status.healthy;
        status
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub name: String,
    pub healthy: bool,
    pub silence_s: f64,
    pub samples: u64,
}

/// Report of link health status
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub imu1: StreamStatus,
    pub imu2: StreamStatus,
    pub servo: StreamStatus,
    /// All required streams are arriving
    pub link_healthy: bool,
}

/// Silence detection for the IMU and servo streams of the current session
pub struct HealthMonitor {
    pub imu1: StreamHealth,
    pub imu2: StreamHealth,
    pub servo: StreamHealth,
}

impl HealthMonitor {
    pub fn new(config: &HealthConfig, now: Instant) -> Self {
        HealthMonitor {
            imu1: StreamHealth::new("IMU1", config.imu_silence_s, now),
            imu2: StreamHealth::new("IMU2", config.imu_silence_s, now),
            servo: StreamHealth::new("Servo", config.servo_silence_s, now),
        }
    }

    pub fn restart(&mut self, now: Instant) {
        self.imu1.restart(now);
        self.imu2.restart(now);
        self.servo.restart(now);
    }

    /// `connected` gates the warnings; `require_imu2` is false when the
    /// comparison does not use a second sensor.
    pub fn check_health(&mut self, now: Instant, connected: bool, require_imu2: bool) -> HealthReport {
        let imu1 = self.imu1.check(now, connected);
        let imu2 = self.imu2.check(now, connected && require_imu2);
        // servo frames are optional; never logged
        let servo = self.servo.check(now, false);
        let link_healthy = connected && imu1.healthy && (!require_imu2 || imu2.healthy);
        HealthReport {
            imu1,
            imu2,
            servo,
            link_healthy,
        }
    }

    /// Format health status for logging
    pub fn format_status(report: &HealthReport) -> String {
        let fmt = |s: &StreamStatus| {
            if s.healthy {
                "✓".to_string()
            } else {
                format!("⚠ (silent {:.1}s)", s.silence_s)
            }
        };
        format!(
            "Health: IMU1 {} | IMU2 {} | Servo {}",
            fmt(&report.imu1),
            fmt(&report.imu2),
            fmt(&report.servo)
        )
    }
}
