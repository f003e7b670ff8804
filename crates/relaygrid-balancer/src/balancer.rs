//! Load balancer — coordinator-side owner of the fleet.
//!
//! Wraps the [`Fleet`] in a mutex, wakes room-assignment waiters whenever
//! the fleet changes, runs the heartbeat tick, and forwards room operations
//! to the owning node over the bus.

use std::sync::Arc;

use relaygrid_bus::{CallOutcome, RpcEndpoint};
use relaygrid_core::config::BalancerConfig;
use relaygrid_core::{NodeAddress, NodeDescriptor, NodeId, NodeState, NodeSummary};
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{BalancerError, BalancerResult};
use crate::fleet::{Fleet, KeepAlive};

/// Coordinator state shared by the RPC service and the heartbeat loop.
///
/// Cloning yields another handle onto the same fleet.
#[derive(Clone)]
pub struct LoadBalancer {
    fleet: Arc<Mutex<Fleet>>,
    /// Fired after every fleet change that can make a node eligible.
    changed: Arc<Notify>,
    endpoint: RpcEndpoint,
    config: BalancerConfig,
}

impl LoadBalancer {
    /// `endpoint` is used to reach nodes; it must be connected.
    pub fn new(endpoint: RpcEndpoint, config: BalancerConfig) -> Self {
        Self {
            fleet: Arc::new(Mutex::new(Fleet::new(config.missed_heartbeat_threshold))),
            changed: Arc::new(Notify::new()),
            endpoint,
            config,
        }
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    // ── Fleet membership ───────────────────────────────────────────

    pub async fn add_node(&self, address: NodeAddress) -> NodeDescriptor {
        let descriptor = self.fleet.lock().await.add_node(address);
        self.changed.notify_waiters();
        descriptor
    }

    pub async fn remove_node(&self, id: &str) -> bool {
        let removed = self.fleet.lock().await.remove_node(id).is_some();
        if removed {
            self.changed.notify_waiters();
        }
        removed
    }

    pub async fn keep_alive(&self, id: &str) -> KeepAlive {
        self.fleet.lock().await.keep_alive(id)
    }

    pub async fn set_info(&self, id: &str, state: NodeState) -> BalancerResult<()> {
        if !self.fleet.lock().await.set_info(id, state) {
            return Err(BalancerError::UnknownNode(id.to_string()));
        }
        self.changed.notify_waiters();
        Ok(())
    }

    pub async fn priority(&self) -> Vec<NodeId> {
        self.fleet.lock().await.priority().to_vec()
    }

    pub async fn nodes(&self) -> Vec<NodeSummary> {
        self.fleet.lock().await.summaries()
    }

    // ── Health ─────────────────────────────────────────────────────

    /// Run one heartbeat tick. Returns the evicted node ids.
    pub async fn check_heartbeats(&self) -> Vec<NodeId> {
        let evicted = self.fleet.lock().await.tick();
        if !evicted.is_empty() {
            info!(evicted = ?evicted, "nodes evicted");
            self.changed.notify_waiters();
        }
        evicted
    }

    /// Tick every heartbeat interval until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.heartbeat_interval();
        let mut ticker = time::interval_at(time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval = ?period,
            threshold = self.config.missed_heartbeat_threshold,
            "heartbeat monitor started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_heartbeats().await;
                }
                _ = shutdown.changed() => {
                    info!("heartbeat monitor shutting down");
                    break;
                }
            }
        }
    }

    // ── Rooms ──────────────────────────────────────────────────────

    /// Node serving `room_id`, assigning one if needed.
    ///
    /// Waits while no node is eligible. A fleet change wakes the wait
    /// immediately; the poll interval bounds it otherwise. Concurrent calls
    /// for the same room resolve to the same node.
    pub async fn assign(&self, room_id: &str) -> NodeDescriptor {
        let poll = self.config.assign_poll_interval();
        let mut warned = false;

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register before checking so a change in between is not missed.
            notified.as_mut().enable();

            if let Some(descriptor) = self.fleet.lock().await.try_assign(room_id) {
                return descriptor;
            }

            if !warned {
                warn!(%room_id, "no eligible node for room, waiting");
                warned = true;
            }
            tokio::select! {
                _ = notified => {}
                _ = time::sleep(poll) => {}
            }
        }
    }

    /// Descriptor of the node serving `room_id`, if any.
    pub async fn room_owner(&self, room_id: &str) -> Option<NodeDescriptor> {
        self.fleet
            .lock()
            .await
            .room_owner(room_id)
            .map(|node| node.descriptor())
    }

    /// Users in a room, as reported by its node. Unassigned rooms are empty.
    pub async fn users_in_room(&self, room_id: &str) -> BalancerResult<Value> {
        let Some(owner) = self.room_owner(room_id).await else {
            return Ok(json!([]));
        };
        self.forward(&owner, "getUsersInRoom", json!({ "roomId": room_id }))
            .await
    }

    /// Delete a room on its node and drop the assignment.
    pub async fn delete_room(&self, room_id: &str) -> BalancerResult<Value> {
        let Some(owner) = self.room_owner(room_id).await else {
            debug!(%room_id, "delete for unassigned room");
            return Ok(json!("Success"));
        };

        let result = self
            .forward(&owner, "deleteRoom", json!({ "roomId": room_id }))
            .await;
        let mut fleet = self.fleet.lock().await;
        // The room may have moved to another node while the call was out.
        if fleet.room_owner(room_id).is_some_and(|node| node.id == owner.id) {
            fleet.unassign_room(room_id);
            info!(%room_id, node_id = %owner.id, "room deleted");
        } else {
            debug!(%room_id, node_id = %owner.id, "room reassigned during delete, keeping new owner");
        }
        result
    }

    /// Remove a user from a room on its node.
    pub async fn delete_user(&self, room_id: &str, user: &str) -> BalancerResult<Value> {
        let owner = self
            .room_owner(room_id)
            .await
            .ok_or_else(|| BalancerError::RoomNotAssigned(room_id.to_string()))?;
        self.forward(&owner, "deleteUser", json!({ "roomId": room_id, "user": user }))
            .await
    }

    async fn forward(&self, node: &NodeDescriptor, method: &str, args: Value) -> BalancerResult<Value> {
        match self.endpoint.call(&node.rpc_id, method, args).await? {
            CallOutcome::Data(data) => Ok(data),
            CallOutcome::Timeout => {
                warn!(node_id = %node.id, %method, "node did not answer");
                Err(BalancerError::Timeout {
                    target: node.rpc_id.clone(),
                    method: method.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaygrid_bus::{MemoryBroker, MethodTable};
    use std::time::Duration;

    fn address(port: u16) -> NodeAddress {
        NodeAddress {
            ip: "10.0.0.1".to_string(),
            hostname: "node.local".to_string(),
            port,
            ssl: true,
        }
    }

    async fn balancer(broker: &MemoryBroker) -> LoadBalancer {
        let endpoint = RpcEndpoint::new(Arc::new(broker.clone()));
        endpoint.connect().await.unwrap();
        LoadBalancer::new(endpoint, BalancerConfig::default())
    }

    /// A node endpoint answering room operations.
    async fn fake_node(broker: &MemoryBroker, rpc_id: &str) -> RpcEndpoint {
        let endpoint = RpcEndpoint::new(Arc::new(broker.clone()));
        let mut methods = MethodTable::new();
        methods.register("getUsersInRoom", |args| async move {
            json!([{ "name": "alice", "room": args["roomId"] }])
        });
        methods.register("deleteRoom", |_| async { json!("Success") });
        methods.register("deleteUser", |args| async move { json!({ "removed": args["user"] }) });
        endpoint.add_methods(methods).await;
        endpoint.bind(rpc_id).await.unwrap();
        endpoint
    }

    #[tokio::test]
    async fn assign_picks_priority_head() {
        let broker = MemoryBroker::new();
        let lb = balancer(&broker).await;
        let a = lb.add_node(address(1)).await;
        let b = lb.add_node(address(2)).await;

        lb.set_info(&a.id, NodeState::Warning).await.unwrap();
        assert_eq!(lb.assign("room").await, b);
        assert_eq!(lb.room_owner("room").await, Some(b));
    }

    #[tokio::test]
    async fn set_info_for_unknown_node_fails() {
        let broker = MemoryBroker::new();
        let lb = balancer(&broker).await;
        assert!(matches!(
            lb.set_info("9", NodeState::Available).await,
            Err(BalancerError::UnknownNode(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn assign_waits_for_registration() {
        let broker = MemoryBroker::new();
        let lb = balancer(&broker).await;

        let waiter = {
            let lb = lb.clone();
            tokio::spawn(async move { lb.assign("room").await })
        };
        let second = {
            let lb = lb.clone();
            tokio::spawn(async move { lb.assign("room").await })
        };
        time::sleep(Duration::from_millis(250)).await;
        assert!(!waiter.is_finished());

        let node = lb.add_node(address(1)).await;
        lb.add_node(address(2)).await;
        assert_eq!(waiter.await.unwrap(), node);
        assert_eq!(second.await.unwrap(), node);
    }

    #[tokio::test(start_paused = true)]
    async fn assign_wakes_on_state_change() {
        let broker = MemoryBroker::new();
        let lb = balancer(&broker).await;
        let node = lb.add_node(address(1)).await;
        lb.set_info(&node.id, NodeState::NotAvailable).await.unwrap();

        let waiter = {
            let lb = lb.clone();
            tokio::spawn(async move { lb.assign("room").await })
        };
        time::sleep(Duration::from_millis(50)).await;
        lb.set_info(&node.id, NodeState::Available).await.unwrap();

        assert_eq!(waiter.await.unwrap(), node);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_loop_evicts_silent_nodes() {
        let broker = MemoryBroker::new();
        let lb = balancer(&broker).await;
        let node = lb.add_node(address(1)).await;
        lb.assign("room").await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = {
            let lb = lb.clone();
            tokio::spawn(async move { lb.run(shutdown_rx).await })
        };

        // Five ticks are tolerated.
        time::sleep(Duration::from_millis(5_500)).await;
        assert_eq!(lb.priority().await, vec![node.id.clone()]);

        time::sleep(Duration::from_millis(1_000)).await;
        assert!(lb.priority().await.is_empty());
        assert!(lb.room_owner("room").await.is_none());

        shutdown_tx.send(true).unwrap();
        monitor.await.unwrap();
    }

    #[tokio::test]
    async fn room_operations_reach_the_owner() {
        let broker = MemoryBroker::new();
        let lb = balancer(&broker).await;
        let node = lb.add_node(address(1)).await;
        let _fake = fake_node(&broker, &node.rpc_id).await;
        lb.assign("room").await;

        let users = lb.users_in_room("room").await.unwrap();
        assert_eq!(users[0]["room"], "room");

        let removed = lb.delete_user("room", "alice").await.unwrap();
        assert_eq!(removed, json!({ "removed": "alice" }));

        assert_eq!(lb.delete_room("room").await.unwrap(), json!("Success"));
        assert!(lb.room_owner("room").await.is_none());
    }

    #[tokio::test]
    async fn unassigned_room_operations() {
        let broker = MemoryBroker::new();
        let lb = balancer(&broker).await;

        assert_eq!(lb.users_in_room("none").await.unwrap(), json!([]));
        assert_eq!(lb.delete_room("none").await.unwrap(), json!("Success"));
        assert!(matches!(
            lb.delete_user("none", "bob").await,
            Err(BalancerError::RoomNotAssigned(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_owner_times_out_but_room_is_released() {
        let broker = MemoryBroker::new();
        let lb = balancer(&broker).await;
        lb.add_node(address(1)).await;
        lb.assign("room").await;

        assert!(matches!(
            lb.delete_room("room").await,
            Err(BalancerError::Timeout { .. })
        ));
        assert!(lb.room_owner("room").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn delete_keeps_assignment_made_during_forward() {
        let broker = MemoryBroker::new();
        let lb = balancer(&broker).await;
        let old = lb.add_node(address(1)).await;
        lb.assign("room").await;

        let delete = {
            let lb = lb.clone();
            tokio::spawn(async move { lb.delete_room("room").await })
        };
        time::sleep(Duration::from_millis(100)).await;

        // The owner leaves and the room moves before the delete settles.
        lb.remove_node(&old.id).await;
        let new = lb.add_node(address(2)).await;
        assert_eq!(lb.assign("room").await, new);

        assert!(matches!(
            delete.await.unwrap(),
            Err(BalancerError::Timeout { .. })
        ));
        assert_eq!(lb.room_owner("room").await, Some(new));
    }
}
