//! Agent mode — runs the worker pool of one host.
//!
//! In this mode, the daemon:
//! 1. Connects to the broker hub
//! 2. Resolves the host address and pre-launches workers
//! 3. Serves `relay.pool` and `relay.pool.<agentId>`
//! 4. On shutdown, kills every worker

use std::sync::Arc;

use relaygrid_bus::{Broker, RpcEndpoint, TcpBroker};
use relaygrid_core::RelayConfig;
use relaygrid_pool::{Launcher, ProcessLauncher, WorkerPool};
use tokio::sync::watch;
use tracing::info;

use crate::wait_for_shutdown;

/// A running pool agent.
pub struct PoolAgent {
    pub endpoint: RpcEndpoint,
    pub pool: WorkerPool,
}

impl PoolAgent {
    pub fn agent_id(&self) -> &str {
        self.pool.agent_id()
    }

    /// Kill every worker and stop serving.
    pub async fn shutdown(self) {
        self.endpoint.close().await;
        self.pool.cleanup().await;
    }
}

/// Start a pool agent on `broker`, launching workers with `launcher`.
///
/// The agent id comes from `[pool] agent_id`, or is generated.
pub async fn start_pool_agent(
    broker: Arc<dyn Broker>,
    config: &RelayConfig,
    launcher: Arc<dyn Launcher>,
) -> anyhow::Result<PoolAgent> {
    let agent_id = config
        .pool
        .agent_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let endpoint = RpcEndpoint::with_timeout(broker, config.bus.rpc_timeout());
    let pool = WorkerPool::new(agent_id.clone(), config.pool.clone(), launcher);
    pool.start().await?;
    relaygrid_pool::serve(&endpoint, pool.clone()).await?;

    info!(%agent_id, "pool agent started");
    Ok(PoolAgent { endpoint, pool })
}

/// Run a pool agent against the configured broker hub.
pub async fn run_agent(config: RelayConfig) -> anyhow::Result<()> {
    info!(broker = %config.bus.broker, program = %config.pool.program, "relayd starting in agent mode");

    let broker = TcpBroker::connect(&config.bus.broker).await?;
    let launcher = Arc::new(ProcessLauncher::from_config(&config.pool));
    let agent = start_pool_agent(Arc::new(broker), &config, launcher).await?;

    let (shutdown_tx, _shutdown_rx) = watch::channel(false);
    wait_for_shutdown(&shutdown_tx).await?;
    agent.shutdown().await;

    info!("agent stopped");
    Ok(())
}
