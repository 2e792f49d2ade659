//! Quorum coordination: replica fan-out, collection, and read resolution.
//!
//! The coordinator issues one independent attempt per replica (the local
//! engine through `spawn_blocking`, peers through the pooled HTTP client
//! with the internal-hop marker) and drains them as they complete. The
//! drain stops as soon as `ack` successes are in, or as soon as enough
//! failures accumulate that `ack` can no longer be reached; stragglers are
//! abandoned and their late results ignored. The whole drain is bounded by
//! the request deadline.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use reqwest::StatusCode;

use super::{NodeState, QuorumParams, X_INTERNAL, X_TIMESTAMP, X_TOMBSTONE};
use crate::record::Record;

/// What one replica answered to a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaRead {
    Value { timestamp_ms: u64, body: Bytes },
    Tombstone { timestamp_ms: u64 },
    Absent,
}

impl ReplicaRead {
    fn timestamp_ms(&self) -> u64 {
        match self {
            Self::Value { timestamp_ms, .. } | Self::Tombstone { timestamp_ms } => *timestamp_ms,
            Self::Absent => 0,
        }
    }

    fn is_value(&self) -> bool {
        matches!(self, Self::Value { .. })
    }

    /// Last-write-wins across replica answers: highest timestamp, and at
    /// equal timestamps a deletion beats a value.
    fn wins_over(&self, other: &ReplicaRead) -> bool {
        match self.timestamp_ms().cmp(&other.timestamp_ms()) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => !self.is_value() && other.is_value(),
        }
    }
}

/// Result of a coordinated read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetOutcome {
    Found { timestamp_ms: u64, body: Bytes },
    NotFound,
    QuorumUnmet,
}

/// Drains replica attempts until `ack` successes, until `ack` becomes
/// unreachable, or until the deadline passes. Returns the successes seen.
pub async fn collect_until_quorum<T, Fut>(
    futures: impl IntoIterator<Item = Fut>,
    ack: usize,
    deadline: Duration,
) -> Vec<T>
where
    Fut: Future<Output = Result<T, String>>,
{
    let mut pending: FuturesUnordered<Fut> = futures.into_iter().collect();
    let attempted = pending.len();
    let mut successes = Vec::with_capacity(ack);
    let mut failures = 0usize;

    let drain = async {
        while let Some(result) = pending.next().await {
            match result {
                Ok(value) => {
                    successes.push(value);
                    if successes.len() >= ack {
                        break;
                    }
                }
                Err(err) => {
                    failures += 1;
                    tracing::warn!(error = %err, "replica attempt failed");
                    if attempted - failures < ack {
                        break;
                    }
                }
            }
        }
    };
    if tokio::time::timeout(deadline, drain).await.is_err() {
        tracing::warn!(ack, attempted, "replica fan-out hit the request deadline");
    }
    successes
}

/// Fans a write (value or deletion) out to the key's replica set. Returns
/// whether the quorum was met. The timestamp is assigned here, exactly once.
pub async fn coordinate_write(
    state: Arc<NodeState>,
    id: String,
    value: Option<Bytes>,
    params: QuorumParams,
) -> bool {
    let timestamp_ms = state.clock.now_ms();
    let replicas = state.topology.replicas_for(id.as_bytes(), params.from);
    let futures = replicas.into_iter().map(|url| {
        write_one_replica(
            state.clone(),
            url,
            id.clone(),
            value.clone(),
            timestamp_ms,
        )
    });
    let successes =
        collect_until_quorum(futures, params.ack, state.config.effective_deadline()).await;
    successes.len() >= params.ack
}

/// Fans a read out to the key's replica set and resolves the answers by
/// last-write-wins.
pub async fn coordinate_read(
    state: Arc<NodeState>,
    id: String,
    params: QuorumParams,
) -> GetOutcome {
    let replicas = state.topology.replicas_for(id.as_bytes(), params.from);
    let futures = replicas
        .into_iter()
        .map(|url| read_one_replica(state.clone(), url, id.clone()));
    let responses =
        collect_until_quorum(futures, params.ack, state.config.effective_deadline()).await;
    if responses.len() < params.ack {
        return GetOutcome::QuorumUnmet;
    }

    let mut best = ReplicaRead::Absent;
    for response in responses {
        if response.wins_over(&best) {
            best = response;
        }
    }
    match best {
        ReplicaRead::Value { timestamp_ms, body } => GetOutcome::Found { timestamp_ms, body },
        ReplicaRead::Tombstone { .. } | ReplicaRead::Absent => GetOutcome::NotFound,
    }
}

async fn write_one_replica(
    state: Arc<NodeState>,
    url: String,
    id: String,
    value: Option<Bytes>,
    timestamp_ms: u64,
) -> Result<(), String> {
    if state.topology.is_self(&url) {
        let engine = state.engine.clone();
        let record = match value {
            Some(body) => Record::put(Bytes::from(id), body, timestamp_ms),
            None => Record::tombstone(Bytes::from(id), timestamp_ms),
        };
        return tokio::task::spawn_blocking(move || engine.upsert(record))
            .await
            .map_err(|err| format!("join local write: {err}"))?
            .map_err(|err| format!("local write: {err:#}"));
    }

    let target = entity_url(&url, &id)?;
    let request = match &value {
        Some(body) => state.http.put(target).body(body.clone()),
        None => state.http.delete(target),
    };
    let response = request
        .header(X_INTERNAL, "true")
        .header(X_TIMESTAMP, timestamp_ms.to_string())
        .timeout(state.config.effective_deadline())
        .send()
        .await
        .map_err(|err| format!("{url}: {err}"))?;
    match response.status() {
        StatusCode::CREATED | StatusCode::ACCEPTED => Ok(()),
        status => Err(format!("{url}: unexpected write status {status}")),
    }
}

async fn read_one_replica(
    state: Arc<NodeState>,
    url: String,
    id: String,
) -> Result<ReplicaRead, String> {
    if state.topology.is_self(&url) {
        let engine = state.engine.clone();
        let key = Bytes::from(id);
        let record = tokio::task::spawn_blocking(move || engine.newest(&key))
            .await
            .map_err(|err| format!("join local read: {err}"))?
            .map_err(|err| format!("local read: {err:#}"))?;
        return Ok(replica_read_from_record(record));
    }

    let target = entity_url(&url, &id)?;
    let response = state
        .http
        .get(target)
        .header(X_INTERNAL, "true")
        .timeout(state.config.effective_deadline())
        .send()
        .await
        .map_err(|err| format!("{url}: {err}"))?;

    match response.status() {
        StatusCode::OK => {
            let timestamp_ms = header_timestamp(&response)
                .ok_or_else(|| format!("{url}: replica value without timestamp"))?;
            let body = response
                .bytes()
                .await
                .map_err(|err| format!("{url}: read body: {err}"))?;
            Ok(ReplicaRead::Value { timestamp_ms, body })
        }
        StatusCode::NOT_FOUND => {
            if response.headers().contains_key(X_TOMBSTONE) {
                let timestamp_ms = header_timestamp(&response)
                    .ok_or_else(|| format!("{url}: replica tombstone without timestamp"))?;
                Ok(ReplicaRead::Tombstone { timestamp_ms })
            } else {
                Ok(ReplicaRead::Absent)
            }
        }
        status => Err(format!("{url}: unexpected read status {status}")),
    }
}

pub(crate) fn replica_read_from_record(record: Option<Record>) -> ReplicaRead {
    match record {
        Some(record) => {
            let timestamp_ms = record.timestamp_ms();
            match record.into_value() {
                Some(body) => ReplicaRead::Value { timestamp_ms, body },
                None => ReplicaRead::Tombstone { timestamp_ms },
            }
        }
        None => ReplicaRead::Absent,
    }
}

fn entity_url(base: &str, id: &str) -> Result<reqwest::Url, String> {
    let mut url = reqwest::Url::parse(&format!("{base}/v0/entity"))
        .map_err(|err| format!("bad replica URL {base}: {err}"))?;
    url.query_pairs_mut().append_pair("id", id);
    Ok(url)
}

fn header_timestamp(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(X_TIMESTAMP)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}
