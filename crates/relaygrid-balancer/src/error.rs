//! Balancer error types.

use relaygrid_bus::BusError;
use relaygrid_core::{NodeId, RoomId};
use thiserror::Error;

/// Errors raised by the coordinator and the node agent.
#[derive(Debug, Error)]
pub enum BalancerError {
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("room not assigned: {0}")]
    RoomNotAssigned(RoomId),

    #[error("{method} on {target} timed out")]
    Timeout { target: String, method: String },

    #[error("remote error: {0}")]
    Remote(String),

    #[error("unexpected reply to {method}: {reason}")]
    Reply { method: String, reason: String },

    #[error("node not registered: call join() first")]
    NotJoined,

    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

pub type BalancerResult<T> = Result<T, BalancerError>;
