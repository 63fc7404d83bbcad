//! Per-tick orchestration.
//!
//! One `tick()` drains the frame queue, feeds the tracker and gravity
//! estimator, advances the physics by one fixed step and publishes an
//! immutable snapshot. Ticks are synchronous: a snapshot never reflects a
//! half-applied step.

use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

use crate::codec::FrameFormat;
use crate::config::AppConfig;
use crate::connection::{ConnectionState, LinkCounters, LinkStats, SessionFrame};
use crate::gravity::{GravityEstimator, PlatformTilt};
use crate::health_monitor::{HealthConfig, HealthMonitor, HealthReport, StreamStatus};
use crate::physics::PlatformPhysics;
use crate::smoothing::HannSmoother;
use crate::tracker::{ErrorSummary, ErrorTracker, PairingDiagnostics, PlotRange, Stream};
use crate::types::{BallState, ErrorSample, Frame, GravityVector, ImuSample, ServoAngles};

/// What stream B of the error tracker is compared against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonMode {
    /// Platform IMU against the reference IMU
    DualImu,
    /// Platform IMU against a smoothed copy of itself
    RawVsFiltered,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub comparison: ComparisonMode,
    pub primary_imu: u8,
    pub secondary_imu: u8,
    /// Hann window used for the filtered reference in `RawVsFiltered`
    pub reference_window: usize,
    pub queue_capacity: usize,
    pub max_frames_per_tick: usize,
    pub health: HealthConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            comparison: ComparisonMode::DualImu,
            primary_imu: 1,
            secondary_imu: 2,
            reference_window: 9,
            queue_capacity: 512,
            max_frames_per_tick: 256,
            health: HealthConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.primary_imu == self.secondary_imu {
            return Err(format!(
                "primary and secondary IMU ids must differ (both {})",
                self.primary_imu
            ));
        }
        if self.reference_window == 0 {
            return Err("reference window must be at least 1".to_string());
        }
        if self.queue_capacity == 0 || self.max_frames_per_tick == 0 {
            return Err("queue capacity and frames per tick must be positive".to_string());
        }
        self.health.validate()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    ResetBall,
    SetGravityScale(f64),
}

/// Everything a UI needs to draw one frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tick: u64,
    pub sim_time: f64,
    pub connection: ConnectionState,
    pub status_text: String,
    pub button_label: String,
    pub ball: BallState,
    pub bounces: u64,
    pub gravity: GravityVector,
    pub gravity_scale: f64,
    pub tilt: PlatformTilt,
    /// Planar G-force of the platform IMU, in g
    pub g_force: [f64; 2],
    pub imu1: Option<ImuSample>,
    /// Second IMU, or the filtered reference in raw-vs-filtered mode
    pub imu2: Option<ImuSample>,
    pub latest_error: Option<ErrorSample>,
    /// Error samples inside the plot window, oldest first
    pub error_history: Vec<ErrorSample>,
    pub accel_range: PlotRange,
    pub gyro_range: PlotRange,
    pub servo: Option<ServoAngles>,
    pub link: LinkCounters,
    pub ignored_frames: u64,
    pub pairing: PairingDiagnostics,
    pub health: HealthReport,
}

/// Queues the pipeline reads from.
pub struct PipelineInputs {
    pub frames: mpsc::Receiver<SessionFrame>,
    pub commands: mpsc::Receiver<Command>,
    pub connection: watch::Receiver<ConnectionState>,
    pub link: Arc<LinkStats>,
}

struct Reference {
    accel: HannSmoother,
    gyro: HannSmoother,
}

pub struct TelemetryPipeline {
    config: PipelineConfig,
    format: FrameFormat,
    inputs: PipelineInputs,
    tracker: ErrorTracker,
    gravity: GravityEstimator,
    physics: PlatformPhysics,
    health: HealthMonitor,
    reference: Reference,
    connection: ConnectionState,
    // session of the last ingested frame
    session: Option<u64>,
    last_primary_ts: Option<f64>,
    imu1: Option<ImuSample>,
    imu2: Option<ImuSample>,
    servo: Option<ServoAngles>,
    tilt: PlatformTilt,
    g_force: [f64; 2],
    ignored_frames: u64,
    tick: u64,
    sim_time: f64,
    snapshots: watch::Sender<Arc<Snapshot>>,
}

impl TelemetryPipeline {
    pub fn new(config: &AppConfig, inputs: PipelineInputs) -> Self {
        let now = Instant::now();
        let connection = inputs.connection.borrow().clone();
        let window = config.pipeline.reference_window;
        let mut pipeline = Self {
            config: config.pipeline.clone(),
            format: config.frame.clone(),
            tracker: ErrorTracker::new(config.tracker.clone()),
            gravity: GravityEstimator::new(config.gravity.clone()),
            physics: PlatformPhysics::new(config.physics.clone()),
            health: HealthMonitor::new(&config.pipeline.health, now),
            reference: Reference {
                accel: HannSmoother::new(window),
                gyro: HannSmoother::new(window),
            },
            connection,
            session: None,
            last_primary_ts: None,
            imu1: None,
            imu2: None,
            servo: None,
            tilt: PlatformTilt::default(),
            g_force: [0.0; 2],
            ignored_frames: 0,
            tick: 0,
            sim_time: 0.0,
            inputs,
            snapshots: watch::channel(Arc::new(Snapshot::idle())).0,
        };
        let initial = pipeline.snapshot_now(now);
        pipeline.snapshots.send_replace(Arc::new(initial));
        pipeline
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshots.subscribe()
    }

    pub fn latest(&self) -> Arc<Snapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn dt(&self) -> f64 {
        self.physics.dt()
    }

    /// Per-axis statistics over the whole error history.
    pub fn error_summary(&self) -> ErrorSummary {
        self.tracker.summary()
    }

    /// Accelerometer readings the gravity estimator could not use.
    pub fn gravity_rejected(&self) -> u64 {
        self.gravity.rejected()
    }

    /// Run one fixed step and publish the result.
    pub fn tick(&mut self) -> Arc<Snapshot> {
        let now = Instant::now();

        while let Ok(command) = self.inputs.commands.try_recv() {
            self.apply(command);
        }

        self.sync_connection(now);

        let mut drained = 0;
        while drained < self.config.max_frames_per_tick {
            match self.inputs.frames.try_recv() {
                Ok(frame) => self.ingest(frame, now),
                Err(_) => break,
            }
            drained += 1;
        }

        self.physics.step(&self.gravity.current());
        self.tick += 1;
        self.sim_time += self.physics.dt();

        let snapshot = Arc::new(self.snapshot_now(now));
        self.snapshots.send_replace(snapshot.clone());
        snapshot
    }

    /// Tick at the physics rate until `shutdown` flips to true or its sender
    /// goes away.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let period = match Duration::try_from_secs_f64(self.physics.dt()) {
            Ok(period) if !period.is_zero() => period,
            _ => {
                warn!("Unusable tick period {}s, using 16 ms", self.physics.dt());
                Duration::from_millis(16)
            }
        };
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Pipeline running at {:.1} Hz", 1.0 / self.physics.dt());

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Pipeline stopped after {} ticks", self.tick);
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::ResetBall => {
                self.physics.reset();
                debug!("Ball reset");
            }
            Command::SetGravityScale(value) => {
                let applied = self.physics.set_gravity_scale(value);
                debug!("Gravity scale {} -> {}", value, applied);
            }
        }
    }

    fn sync_connection(&mut self, now: Instant) {
        let state = self.inputs.connection.borrow_and_update().clone();
        if state == self.connection {
            return;
        }
        if state.is_connected() {
            self.start_session(now);
        }
        self.connection = state;
    }

    /// Reader timestamps restart at zero for every session, so nothing
    /// time-keyed may carry over.
    fn start_session(&mut self, now: Instant) {
        self.tracker.clear_pending();
        self.reference.accel.clear();
        self.reference.gyro.clear();
        self.health.restart(now);
        self.last_primary_ts = None;
    }

    fn ingest(&mut self, tagged: SessionFrame, now: Instant) {
        match self.session {
            Some(current) if tagged.session < current => {
                self.ignored_frames += 1;
                debug!(
                    "Dropping frame from old session {} (t={:.3}s)",
                    tagged.session,
                    tagged.frame.timestamp()
                );
                return;
            }
            Some(current) if tagged.session == current => {}
            _ => {
                // a reconnect can land between two ticks without a visible
                // state change; the session id still moves forward
                self.start_session(now);
                self.session = Some(tagged.session);
            }
        }

        match tagged.frame {
            Frame::Imu(sample) if sample.imu == self.config.primary_imu => {
                self.health.imu1.update(now);
                self.ingest_primary(sample);
            }
            Frame::Imu(sample) if sample.imu == self.config.secondary_imu => {
                self.health.imu2.update(now);
                if self.config.comparison == ComparisonMode::DualImu {
                    self.tracker.push(Stream::B, sample.clone());
                    self.imu2 = Some(sample);
                }
            }
            Frame::Imu(sample) => {
                self.ignored_frames += 1;
                debug!("Ignoring frame from IMU {}", sample.imu);
            }
            Frame::Servo(angles) => {
                self.health.servo.update(now);
                self.servo = Some(angles);
            }
        }
    }

    fn ingest_primary(&mut self, sample: ImuSample) {
        let dt = self
            .last_primary_ts
            .map(|prev| sample.timestamp - prev)
            .unwrap_or(0.0);
        self.last_primary_ts = Some(sample.timestamp);
        // dt of zero (same read chunk) falls back to the nominal period
        self.gravity.estimate_with_dt(sample.accel, dt);

        let counts = self.format.accel_counts(&sample.accel);
        self.tilt = PlatformTilt::from_raw(counts.x, counts.y, self.format.tilt_full_scale);
        self.g_force = self.format.g_force(&sample.accel);

        match self.config.comparison {
            ComparisonMode::DualImu => {
                self.tracker.push(Stream::A, sample.clone());
            }
            ComparisonMode::RawVsFiltered => {
                let filtered = ImuSample {
                    accel: self.reference.accel.apply(sample.accel),
                    gyro: self.reference.gyro.apply(sample.gyro),
                    ..sample.clone()
                };
                self.tracker.observe(&sample, &filtered);
                self.imu2 = Some(filtered);
            }
        }
        self.imu1 = Some(sample);
    }

    fn snapshot_now(&mut self, now: Instant) -> Snapshot {
        let require_imu2 = self.config.comparison == ComparisonMode::DualImu;
        let health = self.health.check_health(now, self.connection.is_connected(), require_imu2);
        let error_history = self.tracker.plot_window();
        let accel_range = PlotRange::from_samples(
            error_history
                .iter()
                .flat_map(|s| s.delta_accel.iter().copied()),
        );
        let gyro_range = PlotRange::from_samples(
            error_history
                .iter()
                .flat_map(|s| s.delta_gyro.iter().copied()),
        );

        Snapshot {
            tick: self.tick,
            sim_time: self.sim_time,
            status_text: self.connection.status_text(),
            button_label: self.connection.button_label().to_string(),
            connection: self.connection.clone(),
            ball: self.physics.ball(),
            bounces: self.physics.bounces(),
            gravity: self.gravity.current(),
            gravity_scale: self.physics.gravity_scale(),
            tilt: self.tilt,
            g_force: self.g_force,
            imu1: self.imu1.clone(),
            imu2: self.imu2.clone(),
            latest_error: self.tracker.latest().cloned(),
            error_history,
            accel_range,
            gyro_range,
            servo: self.servo.clone(),
            link: self.inputs.link.counters(),
            ignored_frames: self.ignored_frames,
            pairing: self.tracker.diagnostics(),
            health,
        }
    }
}

impl Snapshot {
    /// Placeholder published before the first tick.
    pub fn idle() -> Self {
        let idle = StreamStatus {
            name: String::new(),
            healthy: false,
            silence_s: 0.0,
            samples: 0,
        };
        Snapshot {
            tick: 0,
            sim_time: 0.0,
            connection: ConnectionState::Disconnected,
            status_text: ConnectionState::Disconnected.status_text(),
            button_label: ConnectionState::Disconnected.button_label().to_string(),
            ball: BallState::at_rest(),
            bounces: 0,
            gravity: GravityVector::ZERO,
            gravity_scale: 0.0,
            tilt: PlatformTilt::default(),
            g_force: [0.0; 2],
            imu1: None,
            imu2: None,
            latest_error: None,
            error_history: Vec::new(),
            accel_range: PlotRange::from_samples(std::iter::empty()),
            gyro_range: PlotRange::from_samples(std::iter::empty()),
            servo: None,
            link: LinkCounters::default(),
            ignored_frames: 0,
            pairing: PairingDiagnostics::default(),
            health: HealthReport {
                imu1: idle.clone(),
                imu2: idle.clone(),
                servo: idle,
                link_healthy: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{PairingPolicy, TrackerConfig};
    use crate::types::Vec3;
    use approx::assert_relative_eq;

    struct Harness {
        pipeline: TelemetryPipeline,
        frames: mpsc::Sender<SessionFrame>,
        commands: mpsc::Sender<Command>,
        connection: watch::Sender<ConnectionState>,
    }

    fn harness(config: AppConfig) -> Harness {
        let (frames, frames_rx) = mpsc::channel(config.pipeline.queue_capacity);
        let (commands, commands_rx) = mpsc::channel(8);
        let (connection, connection_rx) = watch::channel(ConnectionState::Disconnected);
        let pipeline = TelemetryPipeline::new(
            &config,
            PipelineInputs {
                frames: frames_rx,
                commands: commands_rx,
                connection: connection_rx,
                link: Arc::new(LinkStats::default()),
            },
        );
        Harness {
            pipeline,
            frames,
            commands,
            connection,
        }
    }

    fn imu_in(session: u64, id: u8, ts: f64, accel: Vec3) -> SessionFrame {
        SessionFrame {
            session,
            frame: Frame::Imu(ImuSample::new(id, ts, accel, Vec3::new(0.01, 0.0, -0.01))),
        }
    }

    fn imu(id: u8, ts: f64, accel: Vec3) -> SessionFrame {
        imu_in(1, id, ts, accel)
    }

    fn connected() -> ConnectionState {
        ConnectionState::Connected {
            port: "sim".to_string(),
        }
    }

    #[tokio::test]
    async fn test_initial_snapshot() {
        let h = harness(AppConfig::default());
        let snap = h.pipeline.latest();
        assert_eq!(snap.tick, 0);
        assert_eq!(snap.status_text, "✗ Disconnected");
        assert_eq!(snap.gravity_scale, 9.8);
        assert!(snap.gravity.is_zero());
    }

    #[tokio::test]
    async fn test_dual_imu_tick() {
        let mut h = harness(AppConfig::default());
        h.connection.send_replace(connected());
        let tilt = Vec3::new(0.0, -4.9, 8.5);
        for i in 0..10 {
            let ts = i as f64 * 0.01;
            h.frames.try_send(imu(1, ts, tilt)).unwrap();
            h.frames
                .try_send(imu(2, ts, tilt + Vec3::new(0.0, 0.0, 0.1)))
                .unwrap();
        }

        let snap = h.pipeline.tick();
        assert_eq!(snap.tick, 1);
        assert!(snap.connection.is_connected());
        assert_eq!(snap.pairing.paired, 10);
        assert_eq!(snap.error_history.len(), 10);
        let latest = snap.latest_error.as_ref().unwrap();
        assert_relative_eq!(latest.delta_accel.z, -0.1, epsilon = 1e-12);
        assert_relative_eq!(snap.gravity.magnitude(), 1.0, epsilon = 1e-9);
        assert!(snap.gravity.y < 0.0);
        // gravity pulls the ball towards -y
        assert!(snap.ball.velocity.y < 0.0);
        assert!(snap.health.link_healthy);
        assert!(snap.imu1.is_some() && snap.imu2.is_some());
    }

    #[tokio::test]
    async fn test_tilt_and_g_force() {
        let mut h = harness(AppConfig::default());
        let fmt = FrameFormat::default();
        let accel = Vec3::new(fmt.accel_from_raw(8500), fmt.accel_from_raw(-16390), 0.0);
        h.frames.try_send(imu(1, 0.0, accel)).unwrap();
        let snap = h.pipeline.tick();
        assert_relative_eq!(snap.tilt.roll_deg, 45.0, epsilon = 1e-9);
        assert_relative_eq!(snap.g_force[1], -1.0, epsilon = 1e-9);
    }

    #[tokio::test]
    async fn test_commands_apply_before_step() {
        let mut h = harness(AppConfig::default());
        h.frames
            .try_send(imu(1, 0.0, Vec3::new(9.81, 0.0, 0.0)))
            .unwrap();
        for _ in 0..20 {
            h.pipeline.tick();
        }
        assert!(h.pipeline.latest().ball.position.x > 0.0);

        h.commands.try_send(Command::ResetBall).unwrap();
        h.commands.try_send(Command::SetGravityScale(0.0)).unwrap();
        let snap = h.pipeline.tick();
        assert_eq!(snap.ball, BallState::at_rest());
        assert_eq!(snap.gravity_scale, 0.0);

        h.commands.try_send(Command::SetGravityScale(1e6)).unwrap();
        assert_eq!(h.pipeline.tick().gravity_scale, 50.0);
    }

    #[tokio::test]
    async fn test_frames_per_tick_bounded() {
        let mut config = AppConfig::default();
        config.pipeline.max_frames_per_tick = 4;
        let mut h = harness(config);
        for i in 0..10 {
            h.frames
                .try_send(imu(1, i as f64 * 0.01, Vec3::new(0.0, 0.0, 9.81)))
                .unwrap();
        }
        assert_eq!(h.pipeline.tick().health.imu1.samples, 4);
        assert_eq!(h.pipeline.tick().health.imu1.samples, 8);
        assert_eq!(h.pipeline.tick().health.imu1.samples, 10);
        assert!(h.pipeline.inputs.frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_raw_vs_filtered() {
        let mut config = AppConfig::default();
        config.pipeline.comparison = ComparisonMode::RawVsFiltered;
        config.tracker = TrackerConfig {
            pairing: PairingPolicy::NearestTimestamp { tolerance_s: 0.0 },
            ..TrackerConfig::default()
        };
        let mut h = harness(config);
        h.connection.send_replace(connected());
        for i in 0..5 {
            h.frames
                .try_send(imu(1, i as f64 * 0.01, Vec3::new(i as f64, 0.0, 9.81)))
                .unwrap();
        }
        // a second IMU is ignored in this mode
        h.frames
            .try_send(imu(2, 0.05, Vec3::new(100.0, 0.0, 0.0)))
            .unwrap();
        let snap = h.pipeline.tick();
        assert_eq!(snap.pairing.paired, 5);
        // the first sample equals its own filtered value
        assert_relative_eq!(snap.error_history[0].delta_accel.x, 0.0);
        // a rising input runs ahead of its smoothed copy
        assert!(snap.latest_error.as_ref().unwrap().delta_accel.x > 0.0);
        assert_eq!(snap.imu2.as_ref().unwrap().imu, 1);
        assert!(snap.health.link_healthy);
    }

    #[tokio::test]
    async fn test_unknown_imu_and_servo() {
        let mut h = harness(AppConfig::default());
        h.frames
            .try_send(imu(7, 0.0, Vec3::new(0.0, 0.0, 9.81)))
            .unwrap();
        h.frames
            .try_send(SessionFrame {
                session: 1,
                frame: Frame::Servo(ServoAngles {
                    timestamp: 0.0,
                    angles: [0, 10, 20, 30, 40, 50],
                }),
            })
            .unwrap();
        let snap = h.pipeline.tick();
        assert_eq!(snap.ignored_frames, 1);
        assert_eq!(snap.servo.as_ref().unwrap().angles[5], 50);
        assert!(snap.gravity.is_zero());
    }

    #[tokio::test]
    async fn test_reconnect_between_ticks_starts_fresh_pairing() {
        let mut h = harness(AppConfig::default());
        let port = ConnectionState::Connected {
            port: "COM3".to_string(),
        };
        h.connection.send_replace(port.clone());
        h.frames
            .try_send(imu_in(1, 1, 5.0, Vec3::new(100.0, 0.0, 0.0)))
            .unwrap();
        h.pipeline.tick();

        // disconnect and reconnect collapse into an unchanged watch value
        h.connection.send_replace(ConnectionState::Disconnected);
        h.connection.send_replace(port);
        h.frames
            .try_send(imu_in(3, 2, 5.0, Vec3::zeros()))
            .unwrap();
        let snap = h.pipeline.tick();

        assert_eq!(snap.pairing.paired, 0);
        assert!(snap.latest_error.is_none());
    }

    #[tokio::test]
    async fn test_frames_from_old_session_are_dropped() {
        let mut h = harness(AppConfig::default());
        let accel = Vec3::new(0.0, 0.0, 9.81);
        h.frames.try_send(imu_in(3, 1, 0.0, accel)).unwrap();
        h.frames.try_send(imu_in(1, 2, 0.0, accel)).unwrap();
        h.frames.try_send(imu_in(3, 2, 0.0, accel)).unwrap();
        let snap = h.pipeline.tick();

        assert_eq!(snap.ignored_frames, 1);
        assert_eq!(snap.pairing.paired, 1);
        assert_eq!(snap.health.imu2.samples, 1);
    }

    #[tokio::test]
    async fn test_subscribers_see_each_tick() {
        let mut h = harness(AppConfig::default());
        let mut rx = h.pipeline.subscribe();
        h.pipeline.tick();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().tick, 1);
        assert_relative_eq!(h.pipeline.latest().sim_time, 0.016);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness(AppConfig::default());
        let mut rx = h.pipeline.subscribe();
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(h.pipeline.run(stop_rx));

        rx.changed().await.unwrap();
        assert!(rx.borrow().tick >= 1);
        stop.send_replace(true);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
