//! Node launcher: binds one quartzdb node and serves until interrupted.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use quartzdb::config::{EngineOptions, NodeConfig};
use quartzdb::Node;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "quartzdb-node")]
#[command(about = "Replicated LSM key-value store node", long_about = None)]
struct Args {
    /// Listen address (host:port).
    #[arg(long, default_value = "127.0.0.1:8000")]
    listen: SocketAddr,

    /// Data directory for this node's segments.
    #[arg(long)]
    data: PathBuf,

    /// This node's public URL as it appears in --cluster-urls.
    #[arg(long)]
    node_url: String,

    /// Comma-separated URLs of every cluster node, this one included.
    /// Omit for a single-node deployment.
    #[arg(long, value_delimiter = ',')]
    cluster_urls: Vec<String>,

    /// Memtable size in bytes that triggers a flush.
    #[arg(long, default_value_t = 4 * 1024 * 1024)]
    memtable_bytes: u64,

    /// Replica fan-out deadline in milliseconds (capped at one minute).
    #[arg(long, default_value_t = 30_000)]
    deadline_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,quartzdb=debug"));
    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();
    let config = NodeConfig::new(args.listen, args.data, args.node_url)
        .with_cluster_urls(args.cluster_urls)
        .with_request_deadline(Duration::from_millis(args.deadline_ms))
        .with_engine(EngineOptions {
            memtable_bytes: args.memtable_bytes,
        });

    let node = Node::start(config).await?;
    tracing::info!(addr = %node.addr(), "serving; press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    node.stop().await?;
    Ok(())
}
