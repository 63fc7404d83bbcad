//! Serial transport lifecycle.
//!
//! `ConnectionManager` owns the connection state machine and the reader task.
//! Decoded frames are pushed into a bounded queue with `try_send`; when the
//! consumer falls behind frames are dropped and counted rather than blocking
//! the serial reader.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::codec::{CodecStats, FrameCodec, FrameFormat};
use crate::error::{TelemetryError, TelemetryResult};
use crate::types::Frame;

pub type BoxedTransport = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerialParity {
    None,
    Odd,
    Even,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Port to open at startup (CLI only; the service connects on command)
    pub port: Option<String>,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: SerialParity,
    pub stop_bits: u8,
    /// Bytes requested per read
    pub read_buffer: usize,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 115200,
            data_bits: 8,
            parity: SerialParity::None,
            stop_bits: 1,
            read_buffer: 1024,
        }
    }
}

impl SerialSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.baud_rate == 0 {
            return Err("baud rate must be positive".to_string());
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(format!("data bits must be 5-8, got {}", self.data_bits));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(format!("stop bits must be 1 or 2, got {}", self.stop_bits));
        }
        if self.read_buffer == 0 {
            return Err("read buffer must be at least 1 byte".to_string());
        }
        Ok(())
    }
}

/// Opens a byte transport for a port name. Called from inside the runtime.
pub trait PortOpener: Send + Sync {
    fn open(&self, port: &str, settings: &SerialSettings) -> io::Result<BoxedTransport>;
}

/// Real serial ports through `tokio-serial`.
pub struct SerialPortOpener;

impl PortOpener for SerialPortOpener {
    fn open(&self, port: &str, settings: &SerialSettings) -> io::Result<BoxedTransport> {
        use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, StopBits};

        let data_bits = match settings.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };
        let parity = match settings.parity {
            SerialParity::None => Parity::None,
            SerialParity::Odd => Parity::Odd,
            SerialParity::Even => Parity::Even,
        };
        let stop_bits = match settings.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };

        let stream = tokio_serial::new(port, settings.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .open_native_async()
            .map_err(io::Error::from)?;
        Ok(Box::new(stream))
    }
}

/// Serial ports visible to the OS.
pub fn available_ports() -> TelemetryResult<Vec<String>> {
    tokio_serial::available_ports()
        .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
        .map_err(|e| TelemetryError::TransportIo(e.to_string()))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting { port: String },
    Connected { port: String },
    Error { reason: String },
}

impl ConnectionState {
    pub fn status_text(&self) -> String {
        match self {
            ConnectionState::Disconnected => "✗ Disconnected".to_string(),
            ConnectionState::Connecting { port } => format!("… Connecting to {}", port),
            ConnectionState::Connected { port } => format!("✓ Connected to {}", port),
            ConnectionState::Error { reason } => format!("✗ {}", reason),
        }
    }

    /// Label for the connect/disconnect toggle.
    pub fn button_label(&self) -> &'static str {
        if self.is_busy() {
            "Disconnect"
        } else {
            "Connect"
        }
    }

    /// A session is in progress (opening or open).
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting { .. } | ConnectionState::Connected { .. }
        )
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }
}

/// A decoded frame tagged with the session that read it. Sessions are numbered
/// in increasing order, so a consumer can tell a reconnect apart even when the
/// published state looks the same before and after.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionFrame {
    pub session: u64,
    pub frame: Frame,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Link counters shared between the reader task and readers of snapshots.
/// Cumulative across sessions.
#[derive(Debug, Default)]
pub struct LinkStats {
    bytes_read: AtomicU64,
    frames: AtomicU64,
    frame_errors: AtomicU64,
    bytes_skipped: AtomicU64,
    queue_drops: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkCounters {
    pub bytes_read: u64,
    pub frames: u64,
    pub frame_errors: u64,
    pub bytes_skipped: u64,
    pub queue_drops: u64,
}

impl LinkStats {
    pub fn counters(&self) -> LinkCounters {
        LinkCounters {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            frame_errors: self.frame_errors.load(Ordering::Relaxed),
            bytes_skipped: self.bytes_skipped.load(Ordering::Relaxed),
            queue_drops: self.queue_drops.load(Ordering::Relaxed),
        }
    }

    fn add_codec_delta(&self, now: CodecStats, before: CodecStats) {
        self.frames
            .fetch_add(now.frames - before.frames, Ordering::Relaxed);
        self.frame_errors
            .fetch_add(now.errors - before.errors, Ordering::Relaxed);
        self.bytes_skipped
            .fetch_add(now.bytes_skipped - before.bytes_skipped, Ordering::Relaxed);
    }
}

struct Shared {
    state: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<StateTransition>,
    // bumped by every connect/disconnect; a reader only reports failures for
    // the generation it was started with
    generation: AtomicU64,
    stats: Arc<LinkStats>,
}

impl Shared {
    fn transition(&self, generation: Option<u64>, to: ConnectionState) -> bool {
        self.state.send_if_modified(|current| {
            if let Some(g) = generation {
                if g != self.generation.load(Ordering::SeqCst) {
                    return false;
                }
            }
            if *current == to {
                return false;
            }
            let from = std::mem::replace(current, to.clone());
            info!("Connection: {} -> {}", from.status_text(), to.status_text());
            // no subscribers is fine
            let _ = self.transitions.send(StateTransition {
                from,
                to: to.clone(),
            });
            true
        })
    }
}

struct Session {
    port: String,
    task: JoinHandle<()>,
}

pub struct ConnectionManager {
    shared: Arc<Shared>,
    opener: Arc<dyn PortOpener>,
    settings: SerialSettings,
    format: FrameFormat,
    frames: mpsc::Sender<SessionFrame>,
    runtime: Handle,
    session: Mutex<Option<Session>>,
}

impl ConnectionManager {
    pub fn new(
        opener: Arc<dyn PortOpener>,
        settings: SerialSettings,
        format: FrameFormat,
        frames: mpsc::Sender<SessionFrame>,
        runtime: Handle,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(32);
        Self {
            shared: Arc::new(Shared {
                state,
                transitions,
                generation: AtomicU64::new(0),
                stats: Arc::new(LinkStats::default()),
            }),
            opener,
            settings,
            format,
            frames,
            runtime,
            session: Mutex::new(None),
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        // the guarded data is a task handle; a panic elsewhere can't corrupt it
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.shared.transitions.subscribe()
    }

    pub fn link_stats(&self) -> LinkCounters {
        self.shared.stats.counters()
    }

    /// Shared handle to the counters, for readers outside the manager.
    pub fn stats_handle(&self) -> Arc<LinkStats> {
        self.shared.stats.clone()
    }

    /// Port of the current session, if any.
    pub fn port(&self) -> Option<String> {
        self.lock_session().as_ref().map(|s| s.port.clone())
    }

    /// Open `port` and start reading. Fails without touching the state when a
    /// session is already opening or open.
    pub fn connect(&self, port: &str) -> TelemetryResult<()> {
        let mut session = self.lock_session();

        let current = self.state();
        if current.is_busy() {
            return Err(TelemetryError::PortOpen {
                port: port.to_string(),
                reason: format!("busy ({})", current.status_text()),
            });
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.transition(
            None,
            ConnectionState::Connecting {
                port: port.to_string(),
            },
        );

        let opened = {
            let _guard = self.runtime.enter();
            self.opener.open(port, &self.settings)
        };

        let transport = match opened {
            Ok(t) => t,
            Err(e) => {
                let err = TelemetryError::PortOpen {
                    port: port.to_string(),
                    reason: e.to_string(),
                };
                warn!("{}", err);
                self.shared.transition(
                    None,
                    ConnectionState::Error {
                        reason: err.to_string(),
                    },
                );
                return Err(err);
            }
        };

        self.shared.transition(
            None,
            ConnectionState::Connected {
                port: port.to_string(),
            },
        );

        let task = self.runtime.spawn(read_loop(
            transport,
            self.shared.clone(),
            generation,
            self.frames.clone(),
            self.format.clone(),
            self.settings.read_buffer,
        ));
        if let Some(old) = session.replace(Session {
            port: port.to_string(),
            task,
        }) {
            old.task.abort();
        }
        Ok(())
    }

    /// Stop the reader and close the port. Safe to call in any state.
    pub fn disconnect(&self) {
        let mut session = self.lock_session();
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(s) = session.take() {
            // aborting drops the transport, which closes the port
            s.task.abort();
            debug!("Reader for {} stopped", s.port);
        }
        self.shared.transition(None, ConnectionState::Disconnected);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(s) = self.lock_session().take() {
            s.task.abort();
        }
    }
}

async fn read_loop(
    mut transport: BoxedTransport,
    shared: Arc<Shared>,
    generation: u64,
    frames: mpsc::Sender<SessionFrame>,
    format: FrameFormat,
    buffer_size: usize,
) {
    let mut codec = FrameCodec::new(format);
    let mut buf = vec![0u8; buffer_size.max(1)];
    let started = Instant::now();

    let reason = loop {
        let n = match transport.read(&mut buf).await {
            Ok(0) => break "port closed".to_string(),
            Ok(n) => n,
            Err(e) => break e.to_string(),
        };
        shared.stats.bytes_read.fetch_add(n as u64, Ordering::Relaxed);

        let received_at = started.elapsed().as_secs_f64();
        let before = codec.stats();
        for result in codec.decode(&buf[..n], received_at) {
            match result {
                Ok(frame) => match frames.try_send(SessionFrame {
                    session: generation,
                    frame,
                }) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        shared.stats.queue_drops.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!("Frame queue closed, reader exiting");
                        return;
                    }
                },
                Err(e) => debug!("Dropped frame: {}", e),
            }
        }
        shared.stats.add_codec_delta(codec.stats(), before);
    };

    let err = TelemetryError::TransportIo(reason);
    if shared.transition(
        Some(generation),
        ConnectionState::Error {
            reason: err.to_string(),
        },
    ) {
        warn!("{}", err);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    use crate::codec::FrameCodec;

    /// Hands out the client end of a duplex pipe once per `arm`.
    #[derive(Default)]
    pub(crate) struct DuplexOpener {
        pending: Mutex<Option<DuplexStream>>,
    }

    impl DuplexOpener {
        pub(crate) fn arm(&self) -> DuplexStream {
            let (client, server) = tokio::io::duplex(4096);
            *self.pending.lock().unwrap() = Some(client);
            server
        }
    }

    impl PortOpener for DuplexOpener {
        fn open(&self, port: &str, _settings: &SerialSettings) -> io::Result<BoxedTransport> {
            match self.pending.lock().unwrap().take() {
                Some(stream) => Ok(Box::new(stream)),
                None => Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no such port {}", port),
                )),
            }
        }
    }

    fn manager(
        opener: Arc<dyn PortOpener>,
        capacity: usize,
    ) -> (ConnectionManager, mpsc::Receiver<SessionFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        let manager = ConnectionManager::new(
            opener,
            SerialSettings::default(),
            FrameFormat::default(),
            tx,
            Handle::current(),
        );
        (manager, rx)
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn imu_line(values: [i16; 6]) -> String {
        FrameCodec::new(FrameFormat::default()).encode_raw_imu(1, &values)
    }

    #[tokio::test]
    async fn test_nonexistent_port_goes_to_error() {
        let (manager, _rx) = manager(Arc::new(SerialPortOpener), 8);
        let mut transitions = manager.subscribe_transitions();

        let result = manager.connect("/dev/does-not-exist-imu");
        assert!(matches!(result, Err(TelemetryError::PortOpen { .. })));

        let first = transitions.recv().await.unwrap();
        assert_eq!(first.from, ConnectionState::Disconnected);
        assert!(matches!(first.to, ConnectionState::Connecting { .. }));
        let second = transitions.recv().await.unwrap();
        assert!(matches!(second.to, ConnectionState::Error { .. }));
        assert!(transitions.try_recv().is_err());

        let state = manager.state();
        assert!(state.status_text().contains("Failed to open port /dev/does-not-exist-imu"));
        assert_eq!(state.button_label(), "Connect");
    }

    #[tokio::test]
    async fn test_frames_flow_until_eof() {
        let opener = Arc::new(DuplexOpener::default());
        let (manager, mut rx) = manager(opener.clone(), 16);
        let mut server = opener.arm();

        manager.connect("sim0").unwrap();
        assert_eq!(
            manager.state(),
            ConnectionState::Connected {
                port: "sim0".to_string()
            }
        );
        assert_eq!(manager.state().button_label(), "Disconnect");
        assert_eq!(manager.port().as_deref(), Some("sim0"));

        let line = imu_line([1, 2, 3, 4, 5, 6]);
        let (head, tail) = line.split_at(10);
        server.write_all(head.as_bytes()).await.unwrap();
        server.write_all(tail.as_bytes()).await.unwrap();
        server.write_all(b"garbage\n").await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(frame.frame, Frame::Imu(ref s) if s.imu == 1));

        wait_for(|| manager.link_stats().frame_errors == 1).await;
        assert_eq!(manager.link_stats().frames, 1);

        drop(server);
        wait_for(|| matches!(manager.state(), ConnectionState::Error { .. })).await;
        assert!(manager.state().status_text().contains("port closed"));
    }

    #[tokio::test]
    async fn test_connect_while_busy_is_rejected() {
        let opener = Arc::new(DuplexOpener::default());
        let (manager, _rx) = manager(opener.clone(), 8);
        let _server = opener.arm();
        manager.connect("sim0").unwrap();

        let mut transitions = manager.subscribe_transitions();
        let again = manager.connect("sim1");
        assert!(matches!(again, Err(TelemetryError::PortOpen { ref port, .. }) if port == "sim1"));
        assert_eq!(
            manager.state(),
            ConnectionState::Connected {
                port: "sim0".to_string()
            }
        );
        assert!(transitions.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_stops_reader() {
        let opener = Arc::new(DuplexOpener::default());
        let (manager, mut rx) = manager(opener.clone(), 8);
        let mut server = opener.arm();
        manager.connect("sim0").unwrap();

        let mut transitions = manager.subscribe_transitions();
        manager.disconnect();
        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.port().is_none());

        let t = transitions.recv().await.unwrap();
        assert_eq!(t.to, ConnectionState::Disconnected);
        assert!(transitions.try_recv().is_err());

        // the aborted reader must not deliver frames or report the EOF
        let _ = server.write_all(imu_line([0; 6]).as_bytes()).await;
        drop(server);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_each_session_tags_frames_with_a_newer_id() {
        let opener = Arc::new(DuplexOpener::default());
        let (manager, mut rx) = manager(opener.clone(), 8);
        let line = imu_line([1, 1, 1, 1, 1, 1]);

        let mut server = opener.arm();
        manager.connect("COM3").unwrap();
        server.write_all(line.as_bytes()).await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();

        manager.disconnect();
        let mut server = opener.arm();
        manager.connect("COM3").unwrap();
        server.write_all(line.as_bytes()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(first.frame, Frame::Imu(_)));
        assert!(matches!(second.frame, Frame::Imu(_)));
        assert!(second.session > first.session);
    }

    #[tokio::test]
    async fn test_reconnect_after_error() {
        let opener = Arc::new(DuplexOpener::default());
        let (manager, mut rx) = manager(opener.clone(), 8);

        assert!(manager.connect("sim0").is_err());
        assert!(matches!(manager.state(), ConnectionState::Error { .. }));

        let mut server = opener.arm();
        manager.connect("sim0").unwrap();
        assert!(manager.state().is_connected());
        server
            .write_all(imu_line([7, 7, 7, 7, 7, 7]).as_bytes())
            .await
            .unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert!(frame.is_some());
    }

    #[tokio::test]
    async fn test_full_queue_drops_frames() {
        let opener = Arc::new(DuplexOpener::default());
        let (manager, _rx) = manager(opener.clone(), 1);
        let mut server = opener.arm();
        manager.connect("sim0").unwrap();

        let burst: String = (0..5).map(|i| imu_line([i, 0, 0, 0, 0, 0])).collect();
        server.write_all(burst.as_bytes()).await.unwrap();

        wait_for(|| manager.link_stats().frames == 5).await;
        let stats = manager.link_stats();
        assert_eq!(stats.queue_drops, 4);
        assert_eq!(stats.bytes_read, burst.len() as u64);
    }

    #[test]
    fn test_status_text() {
        assert_eq!(ConnectionState::Disconnected.status_text(), "✗ Disconnected");
        let connected = ConnectionState::Connected {
            port: "COM3".to_string(),
        };
        assert_eq!(connected.status_text(), "✓ Connected to COM3");
        assert_eq!(connected.button_label(), "Disconnect");
        assert!(!ConnectionState::Error {
            reason: "x".to_string()
        }
        .is_busy());
    }

    #[test]
    fn test_settings_validation() {
        assert!(SerialSettings::default().validate().is_ok());
        let bad = SerialSettings {
            data_bits: 9,
            ..SerialSettings::default()
        };
        assert!(bad.validate().is_err());
    }
}
