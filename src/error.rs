//! Error types for trackgate.

use thiserror::Error;

/// Main error type for all gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Framing violation (bad header, length mismatch, missing terminator).
    #[error("invalid frame: {0}")]
    Framing(String),

    /// No registered protocol claims the byte stream.
    #[error("unrecognized protocol, first bytes: {0}")]
    ProtocolUnrecognized(String),

    /// IMEI not resolvable to an internal device id.
    #[error("unknown device imei: {0}")]
    DeviceUnknown(String),

    /// Malformed command parameters.
    #[error("invalid command parameters: {0}")]
    CommandInvalid(String),

    /// Queue was closed while an operation was in flight.
    #[error("queue closed")]
    QueueClosed,
}

/// Result type alias using GatewayError.
pub type Result<T> = std::result::Result<T, GatewayError>;
