//! relay.toml configuration parser.
//!
//! Every section and field is optional in the file; missing values fall
//! back to the defaults below.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bus: BusConfig,
    pub balancer: BalancerConfig,
    pub pool: PoolConfig,
    pub slots: SlotsConfig,
}

/// Message bus and RPC settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Address of the TCP broker hub.
    pub broker: String,
    /// Deadline for every RPC call.
    pub rpc_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            broker: "127.0.0.1:5680".to_string(),
            rpc_timeout_ms: 2000,
        }
    }
}

impl BusConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// Coordinator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub heartbeat_interval_ms: u64,
    /// A node is evicted once its missed-heartbeat counter exceeds this.
    pub missed_heartbeat_threshold: u32,
    pub assign_poll_interval_ms: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1000,
            missed_heartbeat_threshold: 5,
            assign_poll_interval_ms: 100,
        }
    }
}

impl BalancerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn assign_poll_interval(&self) -> Duration {
        Duration::from_millis(self.assign_poll_interval_ms)
    }
}

/// Worker pool settings for a capacity-providing host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Hard cap on live worker processes.
    pub max_processes: usize,
    /// Number of idle workers kept warm.
    pub prerun_processes: usize,
    /// Worker executable.
    pub program: String,
    /// Arguments placed before the identity flags.
    pub args: Vec<String>,
    /// Address handed to workers for host-internal traffic. Detected when unset.
    pub private_ip: Option<String>,
    /// Address advertised to clients. Defaults to the private address.
    pub public_ip: Option<String>,
    /// Fixed agent id. A random one is generated when unset.
    pub agent_id: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_processes: 1,
            prerun_processes: 1,
            program: "relay-worker".to_string(),
            args: Vec::new(),
            private_ip: None,
            public_ip: None,
            agent_id: None,
        }
    }
}

/// Per-room worker slot settings for front-line nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotsConfig {
    /// Ring size of the slot registry.
    pub capacity: usize,
    /// `createWorker` attempts before an allocation is given up.
    pub create_attempts: u32,
    pub keepalive_interval_ms: u64,
    /// A worker is dropped once its keepalive miss counter exceeds this.
    pub max_keepalive_misses: u32,
}

impl Default for SlotsConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            create_attempts: 3,
            keepalive_interval_ms: 1000,
            max_keepalive_misses: 5,
        }
    }
}

impl SlotsConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
}

impl RelayConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RelayConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
