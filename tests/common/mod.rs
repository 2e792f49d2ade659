#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener};
use std::time::{Duration, Instant};

use anyhow::Context;
use quartzdb::config::{EngineOptions, NodeConfig};
use quartzdb::{Node, RunningNode};
use tempfile::TempDir;

/// An in-process cluster of real HTTP nodes, each with its own data
/// directory that survives stop/restart cycles.
pub struct TestCluster {
    configs: Vec<NodeConfig>,
    nodes: Vec<Option<RunningNode>>,
    _dirs: Vec<TempDir>,
    pub client: reqwest::Client,
}

impl TestCluster {
    pub async fn start(size: usize) -> anyhow::Result<Self> {
        let ports = reserve_ports(size)?;
        let urls: Vec<String> = ports
            .iter()
            .map(|port| format!("http://127.0.0.1:{port}"))
            .collect();

        let mut dirs = Vec::with_capacity(size);
        let mut configs = Vec::with_capacity(size);
        let mut nodes = Vec::with_capacity(size);
        for i in 0..size {
            let dir = TempDir::new()?;
            let listen: SocketAddr = format!("127.0.0.1:{}", ports[i]).parse()?;
            let config = NodeConfig::new(listen, dir.path(), urls[i].clone())
                .with_cluster_urls(urls.clone())
                .with_request_deadline(Duration::from_secs(5))
                .with_engine(EngineOptions::default());
            nodes.push(Some(Node::start(config.clone()).await?));
            configs.push(config);
            dirs.push(dir);
        }

        let cluster = Self {
            configs,
            nodes,
            _dirs: dirs,
            client: reqwest::Client::new(),
        };
        for i in 0..size {
            cluster.wait_ready(i).await?;
        }
        Ok(cluster)
    }

    pub fn size(&self) -> usize {
        self.configs.len()
    }

    pub fn url(&self, node: usize) -> &str {
        &self.configs[node].node_url
    }

    pub async fn stop(&mut self, node: usize) -> anyhow::Result<()> {
        if let Some(running) = self.nodes[node].take() {
            running.stop().await?;
        }
        Ok(())
    }

    pub async fn restart(&mut self, node: usize) -> anyhow::Result<()> {
        self.stop(node).await?;
        self.nodes[node] = Some(Node::start(self.configs[node].clone()).await?);
        self.wait_ready(node).await
    }

    pub async fn restart_all(&mut self) -> anyhow::Result<()> {
        for node in 0..self.size() {
            self.restart(node).await?;
        }
        Ok(())
    }

    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        for node in 0..self.size() {
            self.stop(node).await?;
        }
        Ok(())
    }

    pub async fn wait_ready(&self, node: usize) -> anyhow::Result<()> {
        let url = format!("{}/v0/status", self.url(node));
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Ok(response) = self.client.get(&url).send().await {
                if response.status().is_success() {
                    return Ok(());
                }
            }
            if Instant::now() > deadline {
                anyhow::bail!("node {node} did not become ready");
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub fn entity_url(&self, node: usize, id: &str, replicas: Option<(usize, usize)>) -> String {
        match replicas {
            Some((ack, from)) => format!(
                "{}/v0/entity?id={id}&replicas={ack}/{from}",
                self.url(node)
            ),
            None => format!("{}/v0/entity?id={id}", self.url(node)),
        }
    }

    pub async fn get(
        &self,
        node: usize,
        id: &str,
        replicas: Option<(usize, usize)>,
    ) -> anyhow::Result<reqwest::Response> {
        self.client
            .get(self.entity_url(node, id, replicas))
            .send()
            .await
            .context("GET entity")
    }

    pub async fn put(
        &self,
        node: usize,
        id: &str,
        body: impl Into<Vec<u8>>,
        replicas: Option<(usize, usize)>,
    ) -> anyhow::Result<reqwest::Response> {
        self.client
            .put(self.entity_url(node, id, replicas))
            .body(body.into())
            .send()
            .await
            .context("PUT entity")
    }

    pub async fn delete(
        &self,
        node: usize,
        id: &str,
        replicas: Option<(usize, usize)>,
    ) -> anyhow::Result<reqwest::Response> {
        self.client
            .delete(self.entity_url(node, id, replicas))
            .send()
            .await
            .context("DELETE entity")
    }
}

/// Binds ephemeral listeners to pick distinct free ports, then releases them
/// so the nodes can bind.
fn reserve_ports(count: usize) -> anyhow::Result<Vec<u16>> {
    let mut listeners = Vec::with_capacity(count);
    let mut ports = Vec::with_capacity(count);
    for _ in 0..count {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        ports.push(listener.local_addr()?.port());
        listeners.push(listener);
    }
    drop(listeners);
    Ok(ports)
}

pub fn random_id() -> String {
    format!("{:016x}{:016x}", rand::random::<u64>(), rand::random::<u64>())
}

pub fn random_value() -> Vec<u8> {
    (0..64).map(|_| rand::random::<u8>()).collect()
}

/// Writes that must conflict-resolve across different coordinators need the
/// wall clock to advance at least one millisecond between them.
pub async fn clock_tick() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

pub async fn assert_body(response: reqwest::Response, expected: &[u8]) -> anyhow::Result<()> {
    let body = response.bytes().await.context("read body")?;
    assert_eq!(body.as_ref(), expected);
    Ok(())
}
