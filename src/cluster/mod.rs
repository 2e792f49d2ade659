//! Replicated service: shared node state and quorum parameters.

pub mod coordinator;
pub mod http;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::clock::WallClock;
use crate::config::NodeConfig;
use crate::engine::Dao;
use crate::topology::Topology;

/// Marks a request as a replica hop: the receiver acts on its local engine
/// and must not re-coordinate.
pub const X_INTERNAL: &str = "x-internal";
/// Coordinator-assigned write timestamp, decimal milliseconds.
pub const X_TIMESTAMP: &str = "x-timestamp";
/// Marks a replica GET response as a tombstone.
pub const X_TOMBSTONE: &str = "x-tombstone";

const HTTP_POOL_MAX_IDLE_PER_HOST: usize = 256;
const HTTP_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Per-node shared state handed to every request handler.
pub struct NodeState {
    pub config: NodeConfig,
    pub engine: Arc<Dao>,
    pub topology: Topology,
    pub http: reqwest::Client,
    pub clock: WallClock,
}

impl NodeState {
    pub fn new(config: NodeConfig) -> anyhow::Result<Arc<Self>> {
        let engine = Arc::new(
            Dao::open(&config.data_dir, config.engine.clone()).context("open storage engine")?,
        );
        let topology = Topology::new(&config.node_url, &config.cluster_urls)
            .context("build cluster topology")?;
        let http = build_http_client()?;
        Ok(Arc::new(Self {
            config,
            engine,
            topology,
            http,
            clock: WallClock::new(),
        }))
    }
}

fn build_http_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(HTTP_POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(HTTP_POOL_IDLE_TIMEOUT)
        .tcp_nodelay(true)
        .build()
        .context("build HTTP client")
}

/// `ack/from` pair gating a replicated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumParams {
    pub ack: usize,
    pub from: usize,
}

impl QuorumParams {
    /// Defaults when the client omits the `replicas` parameter: all replicas
    /// asked, majority required.
    pub fn defaults(cluster_size: usize) -> Self {
        Self {
            ack: cluster_size / 2 + 1,
            from: cluster_size,
        }
    }

    /// Parses `"<ack>/<from>"` and validates it against the cluster size.
    pub fn parse(raw: &str, cluster_size: usize) -> Result<Self, String> {
        let (ack_s, from_s) = raw
            .split_once('/')
            .ok_or_else(|| format!("replicas {raw:?} does not follow ack/from syntax"))?;
        let ack: usize = ack_s
            .parse()
            .map_err(|_| format!("replicas {raw:?} has a non-numeric ack"))?;
        let from: usize = from_s
            .parse()
            .map_err(|_| format!("replicas {raw:?} has a non-numeric from"))?;
        let params = Self { ack, from };
        params.validate(cluster_size)?;
        Ok(params)
    }

    pub fn validate(&self, cluster_size: usize) -> Result<(), String> {
        if self.ack == 0 {
            return Err("ack must be positive".to_string());
        }
        if self.ack > self.from {
            return Err(format!(
                "ack {} must not exceed from {}",
                self.ack, self.from
            ));
        }
        if self.from > cluster_size {
            return Err(format!(
                "from {} exceeds cluster size {}",
                self.from, cluster_size
            ));
        }
        Ok(())
    }
}
