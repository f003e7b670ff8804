//! relaygrid-balancer — fleet health monitor and room load balancer.
//!
//! # Architecture
//!
//! ```text
//! Coordinator
//!   ├── service (relay.coordinator)
//!   │   ├── registerNode / removeNode / listNodes
//!   │   ├── keepAlive → resets missed heartbeats, "whoareyou" if unknown
//!   │   ├── setInfo → node state, priority recomputed
//!   │   └── assignNodeForRoom / getUsersInRoom / deleteRoom / deleteUser
//!   └── LoadBalancer
//!       ├── Fleet (nodes in registration order, rooms, priority list)
//!       ├── heartbeat tick → evicts nodes past the threshold
//!       └── Notify → wakes assignment waiters on fleet changes
//!
//! Front-line node
//!   └── NodeAgent
//!       ├── join() → registerNode
//!       ├── run_heartbeat() → keepAlive, re-join on "whoareyou"
//!       └── set_state() / leave()
//! ```

pub mod agent;
pub mod balancer;
pub mod error;
pub mod fleet;
pub mod service;

pub use agent::{AgentConfig, NodeAgent};
pub use balancer::LoadBalancer;
pub use error::{BalancerError, BalancerResult};
pub use fleet::{node_queue, Fleet, KeepAlive, Node};
pub use service::{coordinator_methods, serve};
