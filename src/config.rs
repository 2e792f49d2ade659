//! Engine and node configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Storage engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Approximate memtable size that triggers a flush.
    pub memtable_bytes: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            memtable_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Hard upper bound on how long a coordinator waits for replicas.
pub const MAX_REQUEST_DEADLINE: Duration = Duration::from_secs(60);

/// Everything one node needs to serve: where to listen, where its data
/// lives, its own public URL, and the fixed cluster membership.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen: SocketAddr,
    pub data_dir: PathBuf,
    /// This node's URL as it appears in `cluster_urls`.
    pub node_url: String,
    /// Full cluster membership including this node; empty means single-node.
    pub cluster_urls: Vec<String>,
    pub request_deadline: Duration,
    pub engine: EngineOptions,
}

impl NodeConfig {
    pub fn new(listen: SocketAddr, data_dir: impl Into<PathBuf>, node_url: impl Into<String>) -> Self {
        Self {
            listen,
            data_dir: data_dir.into(),
            node_url: normalize_url(&node_url.into()),
            cluster_urls: Vec::new(),
            request_deadline: Duration::from_secs(30),
            engine: EngineOptions::default(),
        }
    }

    pub fn with_cluster_urls(mut self, urls: impl IntoIterator<Item = String>) -> Self {
        self.cluster_urls = urls.into_iter().map(|url| normalize_url(&url)).collect();
        self
    }

    pub fn with_request_deadline(mut self, deadline: Duration) -> Self {
        self.request_deadline = deadline;
        self
    }

    pub fn with_engine(mut self, engine: EngineOptions) -> Self {
        self.engine = engine;
        self
    }

    /// Configured deadline clamped to the one-minute ceiling.
    pub fn effective_deadline(&self) -> Duration {
        self.request_deadline.min(MAX_REQUEST_DEADLINE)
    }
}

pub fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}
