//! Fleet — registered nodes, their health, and room assignments.
//!
//! Plain data with no locking or I/O; the [`LoadBalancer`](crate::LoadBalancer)
//! owns it behind a mutex. Every mutation that can change which nodes are
//! eligible ends by recomputing the priority list.

use std::collections::HashMap;

use indexmap::IndexMap;
use relaygrid_core::{NodeAddress, NodeDescriptor, NodeId, NodeState, NodeSummary, RoomId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// A registered front-line node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub rpc_id: String,
    pub address: NodeAddress,
    pub state: NodeState,
    pub missed_heartbeats: u32,
}

impl Node {
    pub fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            id: self.id.clone(),
            rpc_id: self.rpc_id.clone(),
            address: self.address.clone(),
        }
    }
}

/// Answer to a node's keepalive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeepAlive {
    /// Known node; its missed-heartbeat counter was reset.
    Ok,
    /// Unknown node; it must register again.
    WhoAreYou,
}

/// Queue a node with id `id` binds its endpoint to.
pub fn node_queue(id: &str) -> String {
    format!("relay.node.{id}")
}

pub struct Fleet {
    /// Registered nodes in registration order.
    nodes: IndexMap<NodeId, Node>,
    rooms: HashMap<RoomId, NodeId>,
    /// Available nodes, then Warning nodes, each in registration order.
    priority: Vec<NodeId>,
    next_id: u64,
    /// Missed ticks tolerated before a node is evicted.
    threshold: u32,
}

impl Fleet {
    pub fn new(threshold: u32) -> Self {
        Self {
            nodes: IndexMap::new(),
            rooms: HashMap::new(),
            priority: Vec::new(),
            next_id: 1,
            threshold,
        }
    }

    /// Register a node. It starts out `Available`.
    pub fn add_node(&mut self, address: NodeAddress) -> NodeDescriptor {
        let id = self.next_id.to_string();
        self.next_id += 1;

        let node = Node {
            rpc_id: node_queue(&id),
            id: id.clone(),
            address,
            state: NodeState::Available,
            missed_heartbeats: 0,
        };
        let descriptor = node.descriptor();
        info!(node_id = %id, ip = %node.address.ip, port = node.address.port, "node registered");

        self.nodes.insert(id, node);
        self.recalculate_priority();
        descriptor
    }

    /// Reset a node's missed-heartbeat counter.
    pub fn keep_alive(&mut self, id: &str) -> KeepAlive {
        match self.nodes.get_mut(id) {
            Some(node) => {
                node.missed_heartbeats = 0;
                KeepAlive::Ok
            }
            None => {
                debug!(node_id = %id, "keepalive from unknown node");
                KeepAlive::WhoAreYou
            }
        }
    }

    /// Record a node's reported state. Returns `false` for unknown nodes.
    pub fn set_info(&mut self, id: &str, state: NodeState) -> bool {
        let Some(node) = self.nodes.get_mut(id) else {
            debug!(node_id = %id, %state, "state report from unknown node");
            return false;
        };
        if node.state != state {
            info!(node_id = %id, from = %node.state, to = %state, "node state changed");
            node.state = state;
        }
        self.recalculate_priority();
        true
    }

    /// Remove a node together with its room assignments.
    pub fn remove_node(&mut self, id: &str) -> Option<Node> {
        let node = self.nodes.shift_remove(id)?;
        let before = self.rooms.len();
        self.rooms.retain(|_, owner| owner != id);
        info!(node_id = %id, rooms = before - self.rooms.len(), "node removed");

        self.recalculate_priority();
        Some(node)
    }

    /// Count one missed heartbeat for every node and evict those above the
    /// threshold. Returns the evicted ids.
    pub fn tick(&mut self) -> Vec<NodeId> {
        let mut expired = Vec::new();
        for node in self.nodes.values_mut() {
            node.missed_heartbeats += 1;
            if node.missed_heartbeats > self.threshold {
                expired.push(node.id.clone());
            }
        }

        for id in &expired {
            warn!(node_id = %id, threshold = self.threshold, "node missed too many heartbeats, evicting");
            self.remove_node(id);
        }
        expired
    }

    /// Rebuild the priority list from node states.
    pub fn recalculate_priority(&mut self) {
        let available = self.ids_in_state(NodeState::Available);
        let warning = self.ids_in_state(NodeState::Warning);

        if available.is_empty() && warning.len() < 2 {
            warn!(
                nodes = self.nodes.len(),
                warning = warning.len(),
                "fleet capacity low: no available nodes"
            );
        }

        self.priority = available;
        self.priority.extend(warning);
        debug!(priority = ?self.priority, "priority recalculated");
    }

    fn ids_in_state(&self, state: NodeState) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|node| node.state == state)
            .map(|node| node.id.clone())
            .collect()
    }

    pub fn priority(&self) -> &[NodeId] {
        &self.priority
    }

    /// Node currently serving `room_id`, assigning the priority head if the
    /// room has none. `None` when no node is eligible.
    pub fn try_assign(&mut self, room_id: &str) -> Option<NodeDescriptor> {
        if let Some(node) = self.room_owner(room_id) {
            return Some(node.descriptor());
        }

        let id = self.priority.first()?.clone();
        let descriptor = self.nodes.get(&id)?.descriptor();
        self.rooms.insert(room_id.to_string(), id.clone());
        info!(%room_id, node_id = %id, "room assigned");

        self.recalculate_priority();
        Some(descriptor)
    }

    /// Drop a room's assignment, returning its former owner.
    pub fn unassign_room(&mut self, room_id: &str) -> Option<NodeId> {
        let owner = self.rooms.remove(room_id)?;
        debug!(%room_id, node_id = %owner, "room unassigned");
        Some(owner)
    }

    pub fn room_owner(&self, room_id: &str) -> Option<&Node> {
        self.rooms.get(room_id).and_then(|id| self.nodes.get(id))
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every node with its room count, in registration order.
    pub fn summaries(&self) -> Vec<NodeSummary> {
        self.nodes
            .values()
            .map(|node| NodeSummary {
                descriptor: node.descriptor(),
                state: node.state,
                missed_heartbeats: node.missed_heartbeats,
                rooms: self.rooms.values().filter(|owner| **owner == node.id).count(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(port: u16) -> NodeAddress {
        NodeAddress {
            ip: "10.0.0.1".to_string(),
            hostname: String::new(),
            port,
            ssl: false,
        }
    }

    /// Fleet with `n` registered nodes; returns their ids in order.
    fn fleet_with(n: u16) -> (Fleet, Vec<NodeId>) {
        let mut fleet = Fleet::new(5);
        let ids = (0..n).map(|i| fleet.add_node(address(8080 + i)).id).collect();
        (fleet, ids)
    }

    #[test]
    fn registration_assigns_ids_and_queues() {
        let (fleet, ids) = fleet_with(2);
        assert_eq!(ids, vec!["1", "2"]);
        let node = fleet.node("2").unwrap();
        assert_eq!(node.rpc_id, "relay.node.2");
        assert_eq!(node.state, NodeState::Available);
        assert_eq!(fleet.priority(), ["1", "2"]);
    }

    #[test]
    fn priority_orders_available_then_warning() {
        let (mut fleet, ids) = fleet_with(4);
        let (a, b, c, d) = (&ids[0], &ids[1], &ids[2], &ids[3]);

        fleet.set_info(b, NodeState::Warning);
        fleet.set_info(d, NodeState::NotAvailable);

        assert_eq!(fleet.priority(), [a.clone(), c.clone(), b.clone()]);
    }

    #[test]
    fn priority_empty_when_nothing_eligible() {
        let (mut fleet, ids) = fleet_with(2);
        for id in &ids {
            fleet.set_info(id, NodeState::NotAvailable);
        }
        assert!(fleet.priority().is_empty());
        assert!(fleet.try_assign("room").is_none());
    }

    #[test]
    fn keepalive_resets_and_rejects_strangers() {
        let (mut fleet, ids) = fleet_with(1);
        fleet.tick();
        fleet.tick();
        assert_eq!(fleet.node(&ids[0]).unwrap().missed_heartbeats, 2);

        assert_eq!(fleet.keep_alive(&ids[0]), KeepAlive::Ok);
        assert_eq!(fleet.keep_alive(&ids[0]), KeepAlive::Ok);
        assert_eq!(fleet.node(&ids[0]).unwrap().missed_heartbeats, 0);

        assert_eq!(fleet.keep_alive("99"), KeepAlive::WhoAreYou);
    }

    #[test]
    fn keepalive_serializes_as_wire_strings() {
        assert_eq!(serde_json::to_value(KeepAlive::Ok).unwrap(), "ok");
        assert_eq!(serde_json::to_value(KeepAlive::WhoAreYou).unwrap(), "whoareyou");
    }

    #[test]
    fn set_info_for_unknown_node_is_ignored() {
        let (mut fleet, _) = fleet_with(1);
        assert!(!fleet.set_info("42", NodeState::Warning));
        assert_eq!(fleet.priority(), ["1"]);
    }

    #[test]
    fn eviction_after_threshold_cascades_rooms() {
        let (mut fleet, ids) = fleet_with(2);
        let owner = fleet.try_assign("room-1").unwrap();
        assert_eq!(owner.id, ids[0]);

        for _ in 0..5 {
            fleet.keep_alive(&ids[1]);
            assert!(fleet.tick().is_empty());
        }
        fleet.keep_alive(&ids[1]);
        assert_eq!(fleet.tick(), vec![ids[0].clone()]);

        assert!(fleet.node(&ids[0]).is_none());
        assert!(fleet.room_owner("room-1").is_none());
        assert_eq!(fleet.priority(), [ids[1].clone()]);

        let reassigned = fleet.try_assign("room-1").unwrap();
        assert_eq!(reassigned.id, ids[1]);
    }

    #[test]
    fn assignment_is_sticky() {
        let (mut fleet, ids) = fleet_with(2);
        let first = fleet.try_assign("room").unwrap();
        fleet.set_info(&ids[0], NodeState::NotAvailable);

        let second = fleet.try_assign("room").unwrap();
        assert_eq!(first, second);
        assert_eq!(fleet.try_assign("other").unwrap().id, ids[1]);
    }

    #[test]
    fn remove_node_keeps_registration_order() {
        let (mut fleet, ids) = fleet_with(3);
        fleet.try_assign("r").unwrap();

        let removed = fleet.remove_node(&ids[0]).unwrap();
        assert_eq!(removed.id, ids[0]);
        assert_eq!(fleet.priority(), [ids[1].clone(), ids[2].clone()]);
        assert!(fleet.room_owner("r").is_none());
        assert!(fleet.remove_node(&ids[0]).is_none());
    }

    #[test]
    fn unassign_returns_owner() {
        let (mut fleet, ids) = fleet_with(1);
        fleet.try_assign("r").unwrap();
        assert_eq!(fleet.unassign_room("r"), Some(ids[0].clone()));
        assert_eq!(fleet.unassign_room("r"), None);
    }

    #[test]
    fn summaries_count_rooms() {
        let (mut fleet, ids) = fleet_with(2);
        fleet.try_assign("a").unwrap();
        fleet.try_assign("b").unwrap();

        let summaries = fleet.summaries();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].descriptor.id, ids[0]);
        assert_eq!(summaries[0].rooms, 2);
        assert_eq!(summaries[1].rooms, 0);
    }
}
