//! Slot error types.

use relaygrid_bus::BusError;
use thiserror::Error;

/// Errors raised while filling or releasing worker slots.
#[derive(Debug, Error)]
pub enum SlotError {
    #[error("no worker for slot {position}: allocation failed")]
    Unavailable { position: usize },

    #[error("createWorker failed after {attempts} attempts: {reason}")]
    CreateFailed { attempts: u32, reason: String },

    #[error("{method} on {target} timed out")]
    Timeout { target: String, method: String },

    #[error("unexpected reply to {method}: {reason}")]
    Reply { method: String, reason: String },

    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

pub type SlotResult<T> = Result<T, SlotError>;
