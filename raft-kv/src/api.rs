//! HTTP client API.
//!
//! | Route | Success |
//! |---|---|
//! | `PUT /kv/:key` (body is the value) | 204, `x-raft-index` header |
//! | `DELETE /kv/:key` | 204, `x-raft-index` header |
//! | `GET /kv/:key[?consistency=strong]` | 200 with the value, or 404 |
//! | `GET /status` | 200 JSON |
//!
//! A write or strong read sent to a follower is answered with
//! `307 Temporary Redirect` to the same path on the leader, or `503` while no
//! leader is known. A write whose commit was not observed in time gets `504`
//! with `"outcome": "unknown"`: it may still be applied.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::consensus::Consensus;
use crate::error::{ReadError, WriteError};
use crate::leadership::{Leadership, LeadershipMonitor};
use crate::read::{Consistency, ReadServer};
use crate::router::{WriteAck, WriteRouter};
use crate::state_machine::StateMachine;

/// Response header carrying the log index a write was committed at.
pub const RAFT_INDEX_HEADER: &str = "x-raft-index";

#[derive(Clone)]
pub struct AppState {
    node_id: u64,
    writes: Arc<WriteRouter>,
    reads: Arc<ReadServer>,
    monitor: LeadershipMonitor,
    state_machine: Arc<StateMachine>,
}

impl AppState {
    pub fn new(
        node_id: u64,
        monitor: LeadershipMonitor,
        state_machine: Arc<StateMachine>,
        engine: Arc<dyn Consensus>,
        commit_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        let writes = WriteRouter::new(monitor.clone(), engine.clone(), commit_timeout);
        let reads = ReadServer::new(state_machine.clone(), monitor.clone(), engine, read_timeout);
        Self {
            node_id,
            writes: Arc::new(writes),
            reads: Arc::new(reads),
            monitor,
            state_machine,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/kv/:key", get(get_key).put(put_key).delete(delete_key))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ReadParams {
    #[serde(default)]
    consistency: Consistency,
}

#[derive(Debug, Serialize)]
struct StatusBody {
    node_id: u64,
    role: &'static str,
    leader_id: Option<u64>,
    leader_address: Option<String>,
    applied_index: u64,
}

async fn put_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
    uri: Uri,
    value: Bytes,
) -> Response {
    match state.writes.put(key.into_bytes(), value.to_vec()).await {
        Ok(ack) => written(ack),
        Err(err) => write_error(err, &uri),
    }
}

async fn delete_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
    uri: Uri,
) -> Response {
    match state.writes.delete(key.into_bytes()).await {
        Ok(ack) => written(ack),
        Err(err) => write_error(err, &uri),
    }
}

async fn get_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<ReadParams>,
    uri: Uri,
) -> Response {
    match state.reads.handle_read(key.as_bytes(), params.consistency).await {
        Ok(Some(value)) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            value,
        )
            .into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => read_error(err, &uri),
    }
}

async fn status(State(state): State<AppState>) -> Json<StatusBody> {
    let (role, leader_id, leader_address) = match state.monitor.current() {
        Leadership::Leader => ("leader", Some(state.node_id), None),
        Leadership::Follower { leader } => (
            "follower",
            leader.as_ref().map(|info| info.id),
            leader.map(|info| info.address),
        ),
    };
    Json(StatusBody {
        node_id: state.node_id,
        role,
        leader_id,
        leader_address,
        applied_index: state.state_machine.applied_index(),
    })
}

fn written(ack: WriteAck) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    response
        .headers_mut()
        .insert(RAFT_INDEX_HEADER, HeaderValue::from(ack.index));
    response
}

/// Points the client at the leader, keeping the original path and query.
fn not_leader(leader: Option<String>, uri: &Uri) -> Response {
    let Some(leader) = leader else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "no_leader" })),
        )
            .into_response();
    };

    let path = uri.path_and_query().map_or("/", |pq| pq.as_str());
    let location = format!("http://{leader}{path}");
    debug!(%location, "redirecting to leader");
    match HeaderValue::from_str(&location) {
        Ok(location) => (
            StatusCode::TEMPORARY_REDIRECT,
            [(header::LOCATION, location)],
            Json(json!({ "error": "not_leader", "leader": leader })),
        )
            .into_response(),
        Err(err) => {
            error!(%leader, error = %err, "leader address is not a valid header value");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn write_error(err: WriteError, uri: &Uri) -> Response {
    let detail = err.to_string();
    match err {
        WriteError::NotLeader { leader } => not_leader(leader, uri),
        WriteError::Invalid(_) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid_command", "detail": detail })),
        )
            .into_response(),
        WriteError::CommitTimeout { .. } => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(json!({ "error": "commit_timeout", "outcome": "unknown", "detail": detail })),
        )
            .into_response(),
        WriteError::Rejected { .. } => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "rejected", "outcome": "not_applied", "detail": detail })),
        )
            .into_response(),
        WriteError::Engine(_) => {
            let outcome = if err.outcome_unknown() { "unknown" } else { "not_applied" };
            warn!(error = %detail, outcome, "write failed in the consensus engine");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "engine", "outcome": outcome, "detail": detail })),
            )
                .into_response()
        }
    }
}

fn read_error(err: ReadError, uri: &Uri) -> Response {
    let detail = err.to_string();
    match err {
        ReadError::NotLeader { leader } => not_leader(leader, uri),
        ReadError::Timeout { .. } => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(json!({ "error": "read_timeout", "detail": detail })),
        )
            .into_response(),
        ReadError::Storage(_) | ReadError::Engine(_) => {
            error!(error = %detail, "read failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "read_failed", "detail": detail })),
            )
                .into_response()
        }
    }
}
