//! Error types for the broadcast engine
//!
//! Only capture faults end a session. Everything that happens on a single
//! endpoint (late packets, dropouts, stale receivers, failed calibration) is
//! isolated to that endpoint and surfaced through its metrics.

use thiserror::Error;

use crate::endpoints::EndpointId;
use crate::protocol::StreamFormat;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Calibration failed: {0}")]
    Calibration(#[from] CalibrationError),

    #[error("Endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capture subsystem errors. All of them are fatal to a running session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("Capture unavailable: {0}")]
    Unavailable(String),

    #[error("Capture format changed from {expected} to {actual}")]
    FormatChanged {
        expected: StreamFormat,
        actual: StreamFormat,
    },

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),

    #[error("Invalid packet: {0}")]
    InvalidPacket(&'static str),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Timeout")]
    Timeout,

    #[error("Receiver closed")]
    Closed,
}

/// Render collaborator errors
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Render target is not open")]
    NotOpen,
}

/// Calibration errors. A failed run is retryable and never touches playback.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("Another calibration is already in flight")]
    Busy,

    #[error("Render collaborator reports no playout instant")]
    NoFeedback,

    #[error("Only {got} of {needed} probe samples collected")]
    InsufficientSamples { got: usize, needed: usize },

    #[error("Measurements too noisy: spread {spread_ms:.1} ms")]
    TooNoisy { spread_ms: f64 },

    #[error("Calibration cancelled")]
    Cancelled,

    #[error("Endpoint {0} cannot be calibrated from this process")]
    NotCalibratable(EndpointId),
}

/// Endpoint management errors
#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("Endpoint not found: {0}")]
    NotFound(EndpointId),

    #[error("Endpoint already exists: {0}")]
    AlreadyExists(EndpointId),

    #[error("Volume {0} outside 0.0..=1.0")]
    InvalidVolume(f32),

    #[error("Delay {delay_ms:.1} ms outside ±{limit_ms} ms")]
    InvalidDelay { delay_ms: f64, limit_ms: u64 },
}

/// Session lifecycle errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session is already running")]
    AlreadyRunning,

    #[error("Session is not running")]
    NotRunning,

    #[error("Session ended: {0}")]
    Fatal(CaptureError),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
