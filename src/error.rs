use thiserror::Error;

/// A single malformed line on the serial link. Always recoverable: the codec
/// drops the line and carries on with the next one.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("No frame marker in line")]
    UnknownMarker,

    #[error("Missing checksum delimiter")]
    MissingChecksum,

    #[error("Invalid checksum field: {0:?}")]
    BadChecksumFormat(String),

    #[error("Expected {expected} data fields, got {actual}")]
    FieldCount { expected: usize, actual: usize },

    #[error("Invalid data field {index}: {value:?}")]
    InvalidField { index: usize, value: String },

    #[error("CRC mismatch: received {received:#04x}, calculated {calculated:#04x}")]
    ChecksumMismatch { received: u8, calculated: u8 },

    #[error("Line exceeds {limit} bytes without terminator")]
    Oversized { limit: usize },
}

/// Errors surfaced by the telemetry core
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TelemetryError {
    #[error("Failed to open port {port}: {reason}")]
    PortOpen { port: String, reason: String },

    #[error("Transport I/O error: {0}")]
    TransportIo(String),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Pipeline stopped")]
    PipelineStopped,
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;
