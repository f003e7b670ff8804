//! Node agent — front-line node side of fleet membership.
//!
//! Registers the node with the coordinator, reports its state, and keeps
//! it alive with periodic heartbeats. A coordinator that no longer knows
//! the node answers `"whoareyou"`, and the agent registers again.

use std::time::Duration;

use relaygrid_bus::{CallOutcome, RpcEndpoint, COORDINATOR_QUEUE};
use relaygrid_core::{NodeAddress, NodeDescriptor, NodeState};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::{BalancerError, BalancerResult};
use crate::fleet::KeepAlive;

/// Configuration for the node agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Address advertised to clients.
    pub address: NodeAddress,
    /// Time between heartbeats.
    pub heartbeat_interval: Duration,
}

/// The node agent that maintains fleet membership.
pub struct NodeAgent {
    endpoint: RpcEndpoint,
    config: AgentConfig,
    /// Set after join, replaced on re-registration.
    descriptor: Mutex<Option<NodeDescriptor>>,
}

impl NodeAgent {
    /// `endpoint` must be connected.
    pub fn new(endpoint: RpcEndpoint, config: AgentConfig) -> Self {
        Self {
            endpoint,
            config,
            descriptor: Mutex::new(None),
        }
    }

    /// Register with the coordinator. Returns the assigned descriptor.
    pub async fn join(&self) -> BalancerResult<NodeDescriptor> {
        let args = serde_json::to_value(&self.config.address).map_err(|e| BalancerError::Reply {
            method: "registerNode".to_string(),
            reason: e.to_string(),
        })?;
        let descriptor: NodeDescriptor = self.coordinator_call("registerNode", args).await?;

        info!(
            node_id = %descriptor.id,
            rpc_id = %descriptor.rpc_id,
            heartbeat_interval = ?self.config.heartbeat_interval,
            "joined fleet"
        );
        *self.descriptor.lock().await = Some(descriptor.clone());
        Ok(descriptor)
    }

    /// Report this node's load state.
    pub async fn set_state(&self, state: NodeState) -> BalancerResult<()> {
        let id = self.require_id().await?;
        let _: Value = self
            .coordinator_call("setInfo", json!({ "nodeId": id, "state": state }))
            .await?;
        debug!(node_id = %id, %state, "state reported");
        Ok(())
    }

    /// Send one keepalive, registering again if the coordinator forgot us.
    pub async fn heartbeat(&self) -> BalancerResult<KeepAlive> {
        let id = self.require_id().await?;
        let answer: KeepAlive = self
            .coordinator_call("keepAlive", json!({ "nodeId": id }))
            .await?;

        if answer == KeepAlive::WhoAreYou {
            warn!(node_id = %id, "coordinator does not know this node, registering again");
            self.join().await?;
        }
        Ok(answer)
    }

    /// Run the heartbeat loop until `shutdown` flips.
    pub async fn run_heartbeat(&self, mut shutdown: watch::Receiver<bool>) -> BalancerResult<()> {
        let id = self.require_id().await?;
        info!(node_id = %id, interval = ?self.config.heartbeat_interval, "heartbeat loop started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.heartbeat_interval) => {
                    match self.heartbeat().await {
                        Ok(answer) => debug!(?answer, "heartbeat sent"),
                        Err(e) => warn!(error = %e, "heartbeat failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("heartbeat loop shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Leave the fleet gracefully.
    pub async fn leave(&self) -> BalancerResult<()> {
        let id = self.require_id().await?;
        let _: Value = self
            .coordinator_call("removeNode", json!({ "nodeId": id }))
            .await?;
        *self.descriptor.lock().await = None;
        info!(node_id = %id, "left fleet");
        Ok(())
    }

    /// The current descriptor (None if not yet joined).
    pub async fn descriptor(&self) -> Option<NodeDescriptor> {
        self.descriptor.lock().await.clone()
    }

    async fn require_id(&self) -> BalancerResult<String> {
        self.descriptor
            .lock()
            .await
            .as_ref()
            .map(|d| d.id.clone())
            .ok_or(BalancerError::NotJoined)
    }

    async fn coordinator_call<T: DeserializeOwned>(&self, method: &str, args: Value) -> BalancerResult<T> {
        let data = match self.endpoint.call(COORDINATOR_QUEUE, method, args).await? {
            CallOutcome::Data(data) => data,
            CallOutcome::Timeout => {
                return Err(BalancerError::Timeout {
                    target: COORDINATOR_QUEUE.to_string(),
                    method: method.to_string(),
                });
            }
        };

        if let Some(message) = data.get("error").and_then(Value::as_str) {
            return Err(BalancerError::Remote(message.to_string()));
        }
        serde_json::from_value(data).map_err(|e| BalancerError::Reply {
            method: method.to_string(),
            reason: e.to_string(),
        })
    }
}
