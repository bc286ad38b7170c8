//! nwpd-agent - network problem detector node agent
//!
//! The agent runs on each node (host network) or as a pod (pod network) and:
//! - Probes the configured endpoints periodically
//! - Stores observations in hourly files
//! - Serves the observation history via gRPC and metrics via Prometheus

use anyhow::{Context, Result};
use clap::Parser;
use nwpd_agent::grpc_server::start_server;
use nwpd_agent::server::{node_name, DEFAULT_TICK_PERIOD};
use nwpd_agent::{Agent, AgentOptions};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nwpd-agent")]
#[command(about = "Network problem detector agent", long_about = None)]
#[command(version)]
struct Args {
    /// Agent configuration file
    #[arg(long, default_value = "/etc/nwpd/agent-config.yaml")]
    config: PathBuf,

    /// Cluster configuration file
    #[arg(long, default_value = "/etc/nwpd/cluster-config.yaml")]
    cluster_config: PathBuf,

    /// Run the host network jobs instead of the pod network jobs
    #[arg(long)]
    host_network: bool,

    /// Port of the gRPC query API
    #[arg(long, default_value_t = nwpd_common::DEFAULT_GRPC_PORT)]
    grpc_port: u16,

    /// Directory for aggregation reports
    #[arg(long, default_value = nwpd_common::PATH_LOG_DIR)]
    log_dir: PathBuf,

    /// Scheduler tick in milliseconds
    #[arg(long, default_value_t = DEFAULT_TICK_PERIOD.as_millis() as u64)]
    tick_period_ms: u64,

    #[arg(short, long, help = "Enable verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!("nwpd-agent v{} starting...", env!("CARGO_PKG_VERSION"));

    let options = AgentOptions {
        config_file: args.config,
        cluster_config_file: args.cluster_config,
        host_network: args.host_network,
        node_name: node_name(),
        tick_period: Duration::from_millis(args.tick_period_ms.max(1)),
        log_dir: args.log_dir,
    };
    let agent = Agent::setup(options)
        .await
        .context("failed to start agent")?;

    let addr = SocketAddr::from(([0, 0, 0, 0], args.grpc_port));
    start_server(agent.service(), addr);

    agent.run().await?;
    Ok(())
}
