//! Domain types shared by the RelayGrid control plane.
//!
//! These travel over the message bus as JSON, so field names follow the
//! camelCase convention of the wire protocol.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier assigned to a front-line node by the coordinator.
pub type NodeId = String;

/// Identifier of a logical room.
pub type RoomId = String;

/// Identifier of a worker process owned by a pool agent.
pub type WorkerId = String;

/// Identifier of a pool agent (one per capacity-providing host).
pub type AgentId = String;

// ── Node state ─────────────────────────────────────────────────────

/// Load level reported by a front-line node.
///
/// Encoded on the wire as its numeric value (`0`, `1`, `2`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum NodeState {
    NotAvailable = 0,
    Warning = 1,
    Available = 2,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid node state: {0}")]
pub struct InvalidNodeState(pub u8);

impl TryFrom<u8> for NodeState {
    type Error = InvalidNodeState;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(NodeState::NotAvailable),
            1 => Ok(NodeState::Warning),
            2 => Ok(NodeState::Available),
            other => Err(InvalidNodeState(other)),
        }
    }
}

impl From<NodeState> for u8 {
    fn from(state: NodeState) -> Self {
        state as u8
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeState::NotAvailable => "not-available",
            NodeState::Warning => "warning",
            NodeState::Available => "available",
        };
        f.write_str(s)
    }
}

// ── Node addressing ────────────────────────────────────────────────

/// Where clients reach a front-line node. Sent by the node on registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAddress {
    pub ip: String,
    #[serde(default)]
    pub hostname: String,
    pub port: u16,
    #[serde(default)]
    pub ssl: bool,
}

/// A registered node as returned by `registerNode` and `assignNodeForRoom`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDescriptor {
    pub id: NodeId,
    /// Queue the node binds its RPC endpoint to.
    pub rpc_id: String,
    #[serde(flatten)]
    pub address: NodeAddress,
}

/// Fleet view of a node, as returned by `listNodes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummary {
    #[serde(flatten)]
    pub descriptor: NodeDescriptor,
    pub state: NodeState,
    pub missed_heartbeats: u32,
    pub rooms: usize,
}

// ── Worker assignment ──────────────────────────────────────────────

/// Reply payload of the pool's `createWorker` method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerGrant {
    pub worker_id: WorkerId,
    pub agent_id: AgentId,
    /// Id the agent tracks the process under, when it differs from `worker_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id_for_agent: Option<WorkerId>,
}

/// Counters exposed by a pool agent through `getPoolInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolInfo {
    pub agent_id: AgentId,
    pub idle: usize,
    pub busy: usize,
    pub max_processes: usize,
    pub prerun_processes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_state_is_numeric_on_the_wire() {
        assert_eq!(serde_json::to_string(&NodeState::Available).unwrap(), "2");
        assert_eq!(serde_json::to_string(&NodeState::NotAvailable).unwrap(), "0");

        let state: NodeState = serde_json::from_str("1").unwrap();
        assert_eq!(state, NodeState::Warning);
    }

    #[test]
    fn node_state_rejects_unknown_values() {
        assert!(serde_json::from_str::<NodeState>("7").is_err());
        assert_eq!(NodeState::try_from(3), Err(InvalidNodeState(3)));
    }

    #[test]
    fn descriptor_flattens_address() {
        let desc = NodeDescriptor {
            id: "1".to_string(),
            rpc_id: "relay.node.1".to_string(),
            address: NodeAddress {
                ip: "10.0.0.1".to_string(),
                hostname: "edge-1".to_string(),
                port: 8080,
                ssl: true,
            },
        };

        let value = serde_json::to_value(&desc).unwrap();
        assert_eq!(value["rpcId"], "relay.node.1");
        assert_eq!(value["ip"], "10.0.0.1");
        assert_eq!(value["ssl"], true);

        let back: NodeDescriptor = serde_json::from_value(value).unwrap();
        assert_eq!(back, desc);
    }

    #[test]
    fn worker_grant_omits_missing_agent_alias() {
        let grant = WorkerGrant {
            worker_id: "w-1".to_string(),
            agent_id: "a-1".to_string(),
            worker_id_for_agent: None,
        };
        let value = serde_json::to_value(&grant).unwrap();
        assert!(value.get("workerIdForAgent").is_none());
        assert_eq!(value["workerId"], "w-1");
    }
}
