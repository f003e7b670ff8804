//! Standalone mode — hub, coordinator and pool agent in one process.
//!
//! The in-process components talk to the hub's queues directly; the hub
//! still accepts TCP clients, so front-line nodes and extra agents can join.

use std::sync::Arc;

use relaygrid_bus::BrokerServer;
use relaygrid_core::RelayConfig;
use relaygrid_pool::ProcessLauncher;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::agent_mode::start_pool_agent;
use crate::coordinator::start_coordinator;
use crate::wait_for_shutdown;

pub async fn run_standalone(config: RelayConfig) -> anyhow::Result<()> {
    info!(listen = %config.bus.broker, "relayd starting in standalone mode");

    let server = BrokerServer::bind(&config.bus.broker).await?;
    let hub = Arc::new(server.hub());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let hub_task = {
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run(shutdown_rx).await {
                warn!(error = %e, "broker hub stopped");
            }
        })
    };

    let coordinator = start_coordinator(hub.clone(), &config, shutdown_rx).await?;
    let launcher = Arc::new(ProcessLauncher::from_config(&config.pool));
    let agent = start_pool_agent(hub, &config, launcher).await?;
    info!(agent_id = %agent.agent_id(), "standalone control plane ready");

    wait_for_shutdown(&shutdown_tx).await?;
    agent.shutdown().await;
    coordinator.join().await;
    let _ = hub_task.await;

    info!("standalone stopped");
    Ok(())
}
