//! Error types for the realtime layer.

use thiserror::Error;

/// Main error type for realtime operations.
///
/// Only the admission path (`register`) and typed live-query decoding surface
/// these to callers. Fan-out failures are logged and turned into cleanup.
#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Write failed: {0}")]
    Write(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Payload does not match {expected}: {reason}")]
    Payload {
        expected: &'static str,
        reason: String,
    },

    #[error("Unknown event kind: {0}")]
    UnknownEventKind(String),
}

impl From<serde_json::Error> for RealtimeError {
    fn from(e: serde_json::Error) -> Self {
        RealtimeError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for RealtimeError {
    fn from(e: std::io::Error) -> Self {
        RealtimeError::Write(e.to_string())
    }
}

/// Result type for realtime operations.
pub type Result<T> = std::result::Result<T, RealtimeError>;
