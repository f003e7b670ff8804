//! Coordinator mode — runs the load balancer and its heartbeat monitor.
//!
//! In this mode, the daemon:
//! 1. Connects to the broker hub
//! 2. Serves the coordinator methods on `relay.coordinator`
//! 3. Ticks the fleet heartbeat monitor until shutdown

use std::sync::Arc;

use relaygrid_balancer::LoadBalancer;
use relaygrid_bus::{Broker, RpcEndpoint, TcpBroker};
use relaygrid_core::RelayConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::wait_for_shutdown;

/// A running coordinator.
pub struct Coordinator {
    pub endpoint: RpcEndpoint,
    pub balancer: LoadBalancer,
    monitor: JoinHandle<()>,
}

impl Coordinator {
    /// Wait for the monitor to stop, then close the endpoint.
    pub async fn join(self) {
        let _ = self.monitor.await;
        self.endpoint.close().await;
    }
}

/// Start a coordinator on `broker`. It stops when `shutdown` flips.
pub async fn start_coordinator(
    broker: Arc<dyn Broker>,
    config: &RelayConfig,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<Coordinator> {
    let endpoint = RpcEndpoint::with_timeout(broker, config.bus.rpc_timeout());
    endpoint.connect().await?;

    let balancer = LoadBalancer::new(endpoint.clone(), config.balancer.clone());
    relaygrid_balancer::serve(&endpoint, balancer.clone()).await?;

    let monitor = {
        let balancer = balancer.clone();
        tokio::spawn(async move { balancer.run(shutdown).await })
    };

    info!("coordinator started");
    Ok(Coordinator {
        endpoint,
        balancer,
        monitor,
    })
}

/// Run the coordinator against the configured broker hub.
pub async fn run_coordinator(config: RelayConfig) -> anyhow::Result<()> {
    info!(broker = %config.bus.broker, "relayd starting in coordinator mode");

    let broker = TcpBroker::connect(&config.bus.broker).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let coordinator = start_coordinator(Arc::new(broker), &config, shutdown_rx).await?;

    wait_for_shutdown(&shutdown_tx).await?;
    coordinator.join().await;

    info!("coordinator stopped");
    Ok(())
}
