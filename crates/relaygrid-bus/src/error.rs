//! Message bus error types.

use thiserror::Error;

/// Errors raised by brokers and RPC endpoints.
///
/// Call timeouts are not errors; they are reported through
/// [`CallOutcome::Timeout`](crate::CallOutcome::Timeout).
#[derive(Debug, Error)]
pub enum BusError {
    #[error("endpoint not connected: call connect() first")]
    NotConnected,

    #[error("endpoint already connected")]
    AlreadyConnected,

    #[error("broker connection closed")]
    Closed,

    #[error("broker connection failed: {0}")]
    Connect(String),

    #[error("invalid frame: {0}")]
    Frame(String),

    #[error("message encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BusResult<T> = Result<T, BusError>;
