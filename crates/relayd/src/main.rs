//! relayd — the RelayGrid daemon.
//!
//! One binary, four roles:
//! - `broker`: the message hub every other process connects to
//! - `coordinator`: fleet health monitor and room load balancer
//! - `agent`: worker process pool of one host
//! - `standalone`: all of the above in one process
//!
//! # Usage
//!
//! ```text
//! relayd broker --listen 0.0.0.0:5680
//! relayd coordinator --broker 10.0.0.2:5680
//! relayd agent --config /etc/relaygrid/relay.toml --agent-id host-7
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use relaygrid_bus::BrokerServer;
use relaygrid_core::RelayConfig;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use relayd::agent_mode::run_agent;
use relayd::coordinator::run_coordinator;
use relayd::standalone::run_standalone;
use relayd::wait_for_shutdown;

const DEFAULT_LOG_FILTER: &str = "info,relayd=debug,relaygrid=debug";

#[derive(Parser)]
#[command(name = "relayd", about = "RelayGrid control plane daemon", version)]
struct Cli {
    /// Configuration file (TOML). Built-in defaults when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Broker hub address, overriding `[bus] broker`.
    #[arg(long, global = true)]
    broker: Option<String>,

    /// Log as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the broker hub.
    Broker {
        /// Address to listen on (defaults to the broker address).
        #[arg(long)]
        listen: Option<String>,
    },

    /// Run the coordinator.
    Coordinator,

    /// Run a pool agent.
    Agent {
        /// Agent id, overriding `[pool] agent_id`.
        #[arg(long)]
        agent_id: Option<String>,
    },

    /// Run hub, coordinator and one pool agent in a single process.
    Standalone {
        /// Agent id, overriding `[pool] agent_id`.
        #[arg(long)]
        agent_id: Option<String>,
    },

    /// Print the effective configuration.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let mut config = match &cli.config {
        Some(path) => RelayConfig::from_file(path)?,
        None => RelayConfig::default(),
    };
    if let Some(broker) = cli.broker {
        config.bus.broker = broker;
    }

    match cli.command {
        Command::Broker { listen } => {
            let listen = listen.unwrap_or_else(|| config.bus.broker.clone());
            run_broker(&listen).await
        }
        Command::Coordinator => run_coordinator(config).await,
        Command::Agent { agent_id } => {
            if agent_id.is_some() {
                config.pool.agent_id = agent_id;
            }
            run_agent(config).await
        }
        Command::Standalone { agent_id } => {
            if agent_id.is_some() {
                config.pool.agent_id = agent_id;
            }
            run_standalone(config).await
        }
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run_broker(listen: &str) -> anyhow::Result<()> {
    info!(%listen, "relayd starting in broker mode");

    let server = BrokerServer::bind(listen).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let hub = tokio::spawn(server.run(shutdown_rx));

    wait_for_shutdown(&shutdown_tx).await?;
    hub.await??;

    info!("broker stopped");
    Ok(())
}
