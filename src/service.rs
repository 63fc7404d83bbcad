//! Command surface for UI collaborators.
//!
//! `TelemetryService` wires the connection manager, the frame queue and the
//! tick task together. Commands are cheap and non-blocking; reads return the
//! latest published snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{info, warn};
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::connection::{ConnectionManager, ConnectionState, PortOpener, StateTransition};
use crate::error::{TelemetryError, TelemetryResult};
use crate::pipeline::{Command, PipelineInputs, Snapshot, TelemetryPipeline};

const COMMAND_QUEUE: usize = 32;

pub struct TelemetryService {
    connection: Arc<ConnectionManager>,
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<Arc<Snapshot>>,
    shutdown: watch::Sender<bool>,
    tick_task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl TelemetryService {
    /// Validate `config` and start the tick task on the current runtime.
    pub fn start(config: &AppConfig, opener: Arc<dyn PortOpener>) -> TelemetryResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| TelemetryError::Config(format!("no tokio runtime: {}", e)))?;

        let (frames_tx, frames_rx) = mpsc::channel(config.pipeline.queue_capacity);
        let (commands, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let connection = Arc::new(ConnectionManager::new(
            opener,
            config.serial.clone(),
            config.frame.clone(),
            frames_tx,
            runtime.clone(),
        ));

        let pipeline = TelemetryPipeline::new(
            config,
            PipelineInputs {
                frames: frames_rx,
                commands: commands_rx,
                connection: connection.subscribe(),
                link: connection.stats_handle(),
            },
        );
        let snapshots = pipeline.subscribe();
        let tick_task = runtime.spawn(pipeline.run(shutdown_rx));
        info!("Telemetry service started");

        Ok(Self {
            connection,
            commands,
            snapshots,
            shutdown,
            tick_task: Mutex::new(Some(tick_task)),
            stopped: AtomicBool::new(false),
        })
    }

    fn ensure_running(&self) -> TelemetryResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TelemetryError::PipelineStopped);
        }
        Ok(())
    }

    pub fn connect(&self, port: &str) -> TelemetryResult<()> {
        self.ensure_running()?;
        self.connection.connect(port)
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    pub fn reset_ball(&self) -> TelemetryResult<()> {
        self.send(Command::ResetBall)
    }

    /// Queued for the next tick; the value is clamped there.
    pub fn set_gravity_scale(&self, value: f64) -> TelemetryResult<()> {
        self.send(Command::SetGravityScale(value))
    }

    fn send(&self, command: Command) -> TelemetryResult<()> {
        self.ensure_running()?;
        match self.commands.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(command)) => {
                warn!("Command queue full, dropping {:?}", command);
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(TelemetryError::PipelineStopped),
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshots.clone()
    }

    pub fn subscribe_transitions(&self) -> tokio::sync::broadcast::Receiver<StateTransition> {
        self.connection.subscribe_transitions()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Scale in effect as of the last published tick.
    pub fn gravity_scale(&self) -> f64 {
        self.snapshots.borrow().gravity_scale
    }

    /// Disconnect and stop the tick task. Later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connection.disconnect();
        self.shutdown.send_replace(true);

        let task = self
            .tick_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Tick task ended abnormally: {}", e);
            }
        }
        info!("Telemetry service stopped");
    }
}

impl Drop for TelemetryService {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}
