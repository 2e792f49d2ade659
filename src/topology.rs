//! Fixed-membership sharding via rendezvous hashing.
//!
//! Every node builds the same topology from the same URL list, so the
//! replica ordering for a key is identical cluster-wide without any
//! coordination. The score is a 64-bit value assembled from two seeded
//! crc32 passes over `(key, endpoint)`.

use std::collections::HashSet;

use crc32fast::Hasher;

use crate::config::normalize_url;

#[derive(Debug, Clone)]
pub struct Topology {
    nodes: Vec<String>,
    self_url: String,
}

impl Topology {
    /// Builds the topology from the full cluster membership. An empty list
    /// collapses to a single-node cluster of `self_url`.
    pub fn new(self_url: &str, cluster_urls: &[String]) -> anyhow::Result<Self> {
        let self_url = normalize_url(self_url);
        let mut nodes = Vec::with_capacity(cluster_urls.len());
        let mut seen = HashSet::new();
        for url in cluster_urls {
            let url = normalize_url(url);
            if url.is_empty() {
                continue;
            }
            if seen.insert(url.clone()) {
                nodes.push(url);
            }
        }
        if nodes.is_empty() {
            nodes.push(self_url.clone());
        }
        if !nodes.iter().any(|node| *node == self_url) {
            anyhow::bail!("node URL {self_url} is not part of the cluster {nodes:?}");
        }
        Ok(Self { nodes, self_url })
    }

    pub fn cluster_size(&self) -> usize {
        self.nodes.len()
    }

    pub fn self_url(&self) -> &str {
        &self.self_url
    }

    pub fn is_self(&self, url: &str) -> bool {
        url == self.self_url
    }

    /// The first `from` node URLs in descending rendezvous score order for
    /// `key`. Deterministic across nodes for identical topologies.
    pub fn replicas_for(&self, key: &[u8], from: usize) -> Vec<String> {
        let mut scored: Vec<(u64, &str)> = self
            .nodes
            .iter()
            .map(|node| (rendezvous_score(key, node), node.as_str()))
            .collect();
        scored.sort_unstable_by(|(lhs_score, lhs_node), (rhs_score, rhs_node)| {
            rhs_score.cmp(lhs_score).then_with(|| lhs_node.cmp(rhs_node))
        });
        scored
            .into_iter()
            .take(from)
            .map(|(_, node)| node.to_string())
            .collect()
    }
}

fn rendezvous_score(key: &[u8], endpoint: &str) -> u64 {
    let mut high = Hasher::new();
    high.update(key);
    high.update(&[0x5a, 0x9d, 0x37, 0x11]);
    high.update(endpoint.as_bytes());
    let high = high.finalize() as u64;

    let mut low = Hasher::new();
    low.update(endpoint.as_bytes());
    low.update(&[0xd3, 0x27, 0x8c, 0x44]);
    low.update(key);
    let low = low.finalize() as u64;
    (high << 32) | low
}
