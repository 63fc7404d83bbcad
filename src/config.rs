use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::codec::FrameFormat;
use crate::connection::SerialSettings;
use crate::error::{TelemetryError, TelemetryResult};
use crate::gravity::GravityConfig;
use crate::physics::PhysicsConfig;
use crate::pipeline::PipelineConfig;
use crate::simulator::SimulatorConfig;
use crate::tracker::TrackerConfig;

/// Everything tunable, loaded from one JSON file. Missing sections and
/// fields fall back to their defaults.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub serial: SerialSettings,
    pub frame: FrameFormat,
    pub tracker: TrackerConfig,
    pub gravity: GravityConfig,
    pub physics: PhysicsConfig,
    pub pipeline: PipelineConfig,
    pub simulator: SimulatorConfig,
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> TelemetryResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| TelemetryError::Config(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_json(&text)
            .map_err(|e| TelemetryError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    pub fn from_json(text: &str) -> TelemetryResult<Self> {
        let config: AppConfig =
            serde_json::from_str(text).map_err(|e| TelemetryError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> TelemetryResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| TelemetryError::Config(e.to_string()))
    }

    pub fn validate(&self) -> TelemetryResult<()> {
        let checks = [
            ("serial", self.serial.validate()),
            ("frame", self.frame.validate()),
            ("tracker", self.tracker.validate()),
            ("gravity", self.gravity.validate()),
            ("physics", self.physics.validate()),
            ("pipeline", self.pipeline.validate()),
            ("simulator", self.simulator.validate()),
        ];
        for (section, result) in checks {
            result.map_err(|e| TelemetryError::Config(format!("{}: {}", section, e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gravity::GravityFilter;
    use crate::physics::PlatformBounds;
    use crate::pipeline::ComparisonMode;
    use crate::tracker::PairingPolicy;

    #[test]
    fn test_defaults_are_valid() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = AppConfig::from_json(
            r#"{
                "serial": { "port": "/dev/ttyUSB0" },
                "physics": { "friction": 1.0, "bounds": { "shape": "circle", "radius": 2.0 } },
                "tracker": { "pairing": { "policy": "latest_value" } },
                "gravity": { "filter": { "kind": "hann", "window": 9 } },
                "pipeline": { "comparison": "raw_vs_filtered" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.serial.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.serial.baud_rate, 115200);
        assert_eq!(config.physics.friction, 1.0);
        assert_eq!(config.physics.restitution, 0.5);
        assert_eq!(config.physics.bounds, PlatformBounds::Circle { radius: 2.0 });
        assert_eq!(config.tracker.pairing, PairingPolicy::LatestValue);
        assert_eq!(config.tracker.capacity, 200);
        assert_eq!(config.gravity.filter, GravityFilter::Hann { window: 9 });
        assert_eq!(config.pipeline.comparison, ComparisonMode::RawVsFiltered);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = AppConfig::from_json(r#"{ "physics": { "dt": -1.0 } }"#).unwrap_err();
        assert!(err.to_string().contains("physics"));

        let err = AppConfig::from_json(r#"{ "serial": { "baud_rate": "fast" } }"#).unwrap_err();
        assert!(matches!(err, TelemetryError::Config(_)));
    }

    #[test]
    fn test_json_round_trip() {
        let mut config = AppConfig::default();
        config.simulator.corrupt_every = 7;
        config.pipeline.comparison = ComparisonMode::RawVsFiltered;
        let text = config.to_json().unwrap();
        let parsed = AppConfig::from_json(&text).unwrap();
        assert_eq!(parsed.simulator.corrupt_every, 7);
        assert_eq!(parsed.pipeline, config.pipeline);
        assert_eq!(parsed.serial, config.serial);
        assert_eq!(parsed.tracker, config.tracker);
    }

    #[test]
    fn test_load_missing_file() {
        let err = AppConfig::load("/nonexistent/platform.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/platform.json"));
    }
}
