//! relaygrid-bus — request/response RPC over fire-and-forget queues.
//!
//! Every control-plane component talks through this crate: the coordinator
//! binds `relay.coordinator`, pool agents bind `relay.pool` and
//! `relay.pool.<agentId>`, and every endpoint owns a private reply queue.
//!
//! # Architecture
//!
//! ```text
//! RpcEndpoint
//!   ├── connect() → consumes relay.reply.<uuid>, settles pending calls
//!   ├── bind(id)  → consumes id, dispatches into the MethodTable
//!   ├── call_rpc() / call() → publish CallMessage, arm deadline
//!   └── Broker (trait)
//!       ├── MemoryBroker — in-process queues, round-robin consumers
//!       └── TcpBroker ──frames──▶ BrokerServer (hub around a MemoryBroker)
//! ```

pub mod broker;
pub mod codec;
pub mod error;
pub mod memory;
pub mod message;
pub mod methods;
pub mod rpc;
pub mod tcp;

pub use broker::{Broker, Subscription};
pub use error::{BusError, BusResult};
pub use memory::MemoryBroker;
pub use message::{CallMessage, ReplyMessage};
pub use methods::{error_reply, Handler, MethodTable};
pub use rpc::{CallOutcome, RpcEndpoint, DEFAULT_RPC_TIMEOUT};
pub use tcp::{BrokerServer, TcpBroker};

/// Queue the coordinator serves.
pub const COORDINATOR_QUEUE: &str = "relay.coordinator";

/// Queue shared by every pool agent; deliveries spread round-robin.
pub const POOL_QUEUE: &str = "relay.pool";

/// Private queue of one pool agent.
pub fn agent_queue(agent_id: &str) -> String {
    format!("{POOL_QUEUE}.{agent_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_queue_extends_pool_queue() {
        assert_eq!(agent_queue("a1"), "relay.pool.a1");
    }
}
