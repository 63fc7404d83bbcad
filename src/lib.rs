pub mod codec;
pub mod config;
pub mod connection;
pub mod dashboard;
pub mod error;
pub mod gravity;
pub mod health_monitor;
pub mod live_status;
pub mod physics;
pub mod pipeline;
pub mod service;
pub mod simulator;
pub mod smoothing;
pub mod tracker;
pub mod types;

pub use codec::{FrameCodec, FrameFormat};
pub use config::AppConfig;
pub use connection::{ConnectionManager, ConnectionState, PortOpener, SerialPortOpener};
pub use error::{FrameError, TelemetryError, TelemetryResult};
pub use gravity::GravityEstimator;
pub use physics::PlatformPhysics;
pub use pipeline::{Snapshot, TelemetryPipeline};
pub use service::TelemetryService;
pub use tracker::ErrorTracker;
