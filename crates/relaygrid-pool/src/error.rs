//! Pool error types.

use relaygrid_bus::BusError;
use thiserror::Error;

/// Errors raised by the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to launch worker: {0}")]
    Launch(String),

    #[error("failed to resolve host address: {0}")]
    Address(String),

    #[error("pool not started")]
    NotStarted,

    #[error("pool is shutting down")]
    ShuttingDown,

    #[error("no worker capacity (max_processes = {max})")]
    NoCapacity { max: usize },

    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

pub type PoolResult<T> = Result<T, PoolError>;
