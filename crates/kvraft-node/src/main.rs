//! kvraft-node: entry point for one member of a kvraft cluster.
//!
//! Builds the node config from a YAML file or flags, starts the node on real
//! sockets and runs until Ctrl+C or a fatal error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use kvraft_core::NodeId;
use kvraft_node::config::{
    listen_addr, load_from_file, parse_initial_cluster, DEFAULT_INITIAL_CLUSTER,
};
use kvraft_node::demo::run_demo;
use kvraft_node::{ConfigError, Network, Node, NodeConfig, NodeError};
use tracing_subscriber::EnvFilter;

/// First client port; node N listens on CLIENT_PORT_BASE + N unless told otherwise
const CLIENT_PORT_BASE: u64 = 3011;

#[derive(Debug, Parser)]
#[command(name = "kvraft-node", version, about = "Raft-replicated key-value node")]
struct Cli {
    /// YAML config file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// This node's id within the cluster
    #[arg(long, default_value_t = 0)]
    id: NodeId,

    /// Client listen address or bare port (default 127.0.0.1:3011+id)
    #[arg(long)]
    client: Option<String>,

    /// Peer listen address or bare port (default: this node's entry in the cluster)
    #[arg(long)]
    peer: Option<String>,

    /// Cluster members as name=url pairs
    #[arg(long, default_value = DEFAULT_INITIAL_CLUSTER)]
    initial_cluster: String,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long)]
    cluster_token: Option<String>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Periodically write and read the demo keys
    #[arg(long)]
    demo: bool,

    #[arg(long, default_value_t = 2000)]
    demo_interval_ms: u64,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_config(cli: &Cli) -> Result<NodeConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => load_from_file(path)?,
        None => {
            let members = parse_initial_cluster(&cli.initial_cluster)?;
            let mut config = NodeConfig::new(cli.id, members);
            config.client_listen = Some(format!("127.0.0.1:{}", CLIENT_PORT_BASE + cli.id));
            config
        }
    };
    if let Some(addr) = &cli.client {
        config.client_listen = Some(listen_addr(addr));
    }
    if let Some(addr) = &cli.peer {
        config.peer_listen = Some(listen_addr(addr));
    }
    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.clone());
    }
    if let Some(token) = &cli.cluster_token {
        config.cluster_token = token.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = build_config(&cli).context("invalid configuration")?;
    tracing::info!(
        node = config.id,
        members = config.members.len(),
        "configuration loaded"
    );

    let node = Node::start(config, Network::Tcp)
        .await
        .context("failed to start node")?;

    let demo = cli.demo.then(|| {
        tokio::spawn(run_demo(
            node.service(),
            Duration::from_millis(cli.demo_interval_ms),
            node.subscribe_shutdown(),
        ))
    });

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        tracing::info!("received Ctrl+C, shutting down");
    };
    let result = node.run_until_shutdown(ctrl_c).await;

    if let Some(demo) = demo {
        let _ = demo.await;
    }
    result.context("node stopped")
}

fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(e) = err.downcast_ref::<NodeError>() {
        e.exit_code()
    } else if err.downcast_ref::<ConfigError>().is_some() {
        2
    } else {
        1
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}
