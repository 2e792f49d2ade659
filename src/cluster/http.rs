//! HTTP surface and node lifecycle.
//!
//! Routes:
//! - `GET /v0/status`: liveness, always 200.
//! - `GET|PUT|DELETE /v0/entity?id=<key>[&replicas=<ack>/<from>]`: the
//!   replicated entity API. Requests carrying the internal-hop marker bypass
//!   the coordinator and act on the local engine only.
//! - anything else: 400.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::coordinator::{self, GetOutcome, ReplicaRead};
use super::{NodeState, QuorumParams, X_INTERNAL, X_TIMESTAMP, X_TOMBSTONE};
use crate::config::NodeConfig;
use crate::record::Record;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

#[derive(Debug, Deserialize)]
struct EntityQuery {
    id: Option<String>,
    replicas: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    node_url: String,
    cluster_size: usize,
    sstables: usize,
    sstable_bytes: u64,
    memtable_bytes: u64,
}

fn router(state: Arc<NodeState>) -> Router {
    Router::new()
        .route("/v0/status", get(status))
        .route(
            "/v0/entity",
            get(entity_get).put(entity_put).delete(entity_delete),
        )
        .fallback(unknown_path)
        .with_state(state)
}

async fn status(State(state): State<Arc<NodeState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        node_url: state.config.node_url.clone(),
        cluster_size: state.topology.cluster_size(),
        sstables: state.engine.sstable_count(),
        sstable_bytes: state.engine.sstable_bytes(),
        memtable_bytes: state.engine.memtable_bytes(),
    })
}

async fn unknown_path() -> ApiError {
    api_error(StatusCode::BAD_REQUEST, "unknown path")
}

async fn entity_get(
    State(state): State<Arc<NodeState>>,
    Query(query): Query<EntityQuery>,
    headers: HeaderMap,
) -> Response {
    let id = match require_id(&query) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };
    if is_internal(&headers) {
        return local_read(state, id).await;
    }
    let params = match quorum_params(&query, &state) {
        Ok(params) => params,
        Err(err) => return err.into_response(),
    };

    match coordinator::coordinate_read(state, id, params).await {
        GetOutcome::Found { timestamp_ms, body } => (
            StatusCode::OK,
            [(X_TIMESTAMP, timestamp_ms.to_string())],
            body,
        )
            .into_response(),
        GetOutcome::NotFound => StatusCode::NOT_FOUND.into_response(),
        GetOutcome::QuorumUnmet => not_enough_replicas(params).into_response(),
    }
}

async fn entity_put(
    State(state): State<Arc<NodeState>>,
    Query(query): Query<EntityQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let id = match require_id(&query) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };
    if is_internal(&headers) {
        return local_write(state, id, Some(body), &headers).await;
    }
    let params = match quorum_params(&query, &state) {
        Ok(params) => params,
        Err(err) => return err.into_response(),
    };

    if coordinator::coordinate_write(state, id, Some(body), params).await {
        StatusCode::CREATED.into_response()
    } else {
        not_enough_replicas(params).into_response()
    }
}

async fn entity_delete(
    State(state): State<Arc<NodeState>>,
    Query(query): Query<EntityQuery>,
    headers: HeaderMap,
) -> Response {
    let id = match require_id(&query) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };
    if is_internal(&headers) {
        return local_write(state, id, None, &headers).await;
    }
    let params = match quorum_params(&query, &state) {
        Ok(params) => params,
        Err(err) => return err.into_response(),
    };

    if coordinator::coordinate_write(state, id, None, params).await {
        StatusCode::ACCEPTED.into_response()
    } else {
        not_enough_replicas(params).into_response()
    }
}

/// Replica-side read: answer from the local engine with enough metadata for
/// the coordinator to merge (timestamp, and the tombstone marker).
async fn local_read(state: Arc<NodeState>, id: String) -> Response {
    let engine = state.engine.clone();
    let key = Bytes::from(id);
    let record = match tokio::task::spawn_blocking(move || engine.newest(&key)).await {
        Ok(Ok(record)) => record,
        Ok(Err(err)) => {
            tracing::error!(error = %format!("{err:#}"), "local read failed");
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, "local read failed")
                .into_response();
        }
        Err(err) => {
            return api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("join local read: {err}"),
            )
            .into_response();
        }
    };

    match coordinator::replica_read_from_record(record) {
        ReplicaRead::Value { timestamp_ms, body } => (
            StatusCode::OK,
            [(X_TIMESTAMP, timestamp_ms.to_string())],
            body,
        )
            .into_response(),
        ReplicaRead::Tombstone { timestamp_ms } => (
            StatusCode::NOT_FOUND,
            [
                (X_TIMESTAMP, timestamp_ms.to_string()),
                (X_TOMBSTONE, "true".to_string()),
            ],
        )
            .into_response(),
        ReplicaRead::Absent => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Replica-side write: persist at the coordinator-assigned timestamp.
async fn local_write(
    state: Arc<NodeState>,
    id: String,
    value: Option<Bytes>,
    headers: &HeaderMap,
) -> Response {
    let timestamp_ms = match headers
        .get(X_TIMESTAMP)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
    {
        Some(timestamp_ms) => timestamp_ms,
        None => {
            return api_error(
                StatusCode::BAD_REQUEST,
                "internal hop requires a valid x-timestamp header",
            )
            .into_response();
        }
    };

    let success_status = if value.is_some() {
        StatusCode::CREATED
    } else {
        StatusCode::ACCEPTED
    };
    let record = match value {
        Some(body) => Record::put(Bytes::from(id), body, timestamp_ms),
        None => Record::tombstone(Bytes::from(id), timestamp_ms),
    };
    let engine = state.engine.clone();
    match tokio::task::spawn_blocking(move || engine.upsert(record)).await {
        Ok(Ok(())) => success_status.into_response(),
        Ok(Err(err)) => {
            tracing::error!(error = %format!("{err:#}"), "local write failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "local write failed").into_response()
        }
        Err(err) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("join local write: {err}"),
        )
        .into_response(),
    }
}

fn require_id(query: &EntityQuery) -> Result<String, ApiError> {
    match &query.id {
        Some(id) if !id.is_empty() => Ok(id.clone()),
        Some(_) => Err(api_error(StatusCode::BAD_REQUEST, "id must not be empty")),
        None => Err(api_error(StatusCode::BAD_REQUEST, "id is required")),
    }
}

fn quorum_params(query: &EntityQuery, state: &NodeState) -> Result<QuorumParams, ApiError> {
    let cluster_size = state.topology.cluster_size();
    match &query.replicas {
        Some(raw) => QuorumParams::parse(raw, cluster_size)
            .map_err(|err| api_error(StatusCode::BAD_REQUEST, err)),
        None => Ok(QuorumParams::defaults(cluster_size)),
    }
}

fn is_internal(headers: &HeaderMap) -> bool {
    headers
        .get(X_INTERNAL)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn not_enough_replicas(params: QuorumParams) -> ApiError {
    api_error(
        StatusCode::GATEWAY_TIMEOUT,
        format!("not enough replicas: needed {} of {}", params.ack, params.from),
    )
}

/// Builds and serves one node.
pub struct Node;

impl Node {
    pub async fn start(config: NodeConfig) -> anyhow::Result<RunningNode> {
        let state = NodeState::new(config)?;
        let listener = tokio::net::TcpListener::bind(state.config.listen)
            .await
            .with_context(|| format!("bind {}", state.config.listen))?;
        let addr = listener.local_addr().context("listener address")?;

        let app = router(state.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(err) = served {
                tracing::error!(error = %err, "server error");
            }
        });

        tracing::info!(
            %addr,
            node_url = %state.config.node_url,
            cluster_size = state.topology.cluster_size(),
            "node started"
        );
        Ok(RunningNode {
            addr,
            state,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }
}

/// A live node; stopping it shuts the server down and closes the engine.
pub struct RunningNode {
    addr: SocketAddr,
    state: Arc<NodeState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RunningNode {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn node_url(&self) -> &str {
        &self.state.config.node_url
    }

    pub async fn stop(mut self) -> anyhow::Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            task.await.context("join server task")?;
        }
        let engine = self.state.engine.clone();
        tokio::task::spawn_blocking(move || engine.close())
            .await
            .context("join engine close")?
            .context("close engine")?;
        tracing::info!(addr = %self.addr, "node stopped");
        Ok(())
    }
}
