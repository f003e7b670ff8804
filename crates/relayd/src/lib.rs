//! relayd — the RelayGrid control plane daemon.
//!
//! The process modes are exposed here so tests can assemble a fleet
//! in-process; `main.rs` only parses arguments and picks a mode.

pub mod agent_mode;
pub mod coordinator;
pub mod standalone;

use anyhow::Context;
use tokio::sync::watch;
use tracing::info;

/// Block until Ctrl-C, then flip `shutdown`.
pub async fn wait_for_shutdown(shutdown: &watch::Sender<bool>) -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to install CTRL+C handler")?;
    info!("shutdown signal received");
    let _ = shutdown.send(true);
    Ok(())
}
