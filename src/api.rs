use crate::consensus::{RaftConsensus, SharedRegistry};
use crate::types::WorkerInfo;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;

/// Shared state for the observation endpoints. Read-only: every handler
/// goes through the consensus metrics snapshot or the registry's deep-copy
/// accessors.
#[derive(Clone)]
pub struct ApiState {
    pub node_id: String,
    pub consensus: Arc<RaftConsensus>,
    pub registry: SharedRegistry,
}

/// Operator-facing debug surface. No stability guarantee beyond the
/// documented fields.
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/raft-state", get(raft_state))
        .route("/cluster-state", get(cluster_state))
        .route("/metrics", get(metrics_exposition))
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok", "node_id": state.node_id }))
}

#[derive(Serialize)]
struct RaftStateResponse {
    node_id: String,
    state: String,
    leader: String,
    term: u64,
}

async fn raft_state(State(state): State<ApiState>) -> impl IntoResponse {
    use crate::consensus::Consensus;
    let stats = state.consensus.stats();
    let term = stats
        .get("term")
        .and_then(|t| t.parse().ok())
        .unwrap_or(0);
    Json(RaftStateResponse {
        node_id: state.node_id.clone(),
        state: state.consensus.state().to_string(),
        leader: state.consensus.leader(),
        term,
    })
}

#[derive(Serialize)]
struct ClusterStateResponse {
    node_id: String,
    state: String,
    workers: Vec<WorkerInfo>,
}

async fn cluster_state(State(state): State<ApiState>) -> impl IntoResponse {
    use crate::consensus::Consensus;
    let workers = state.registry.workers().into_values().collect();
    Json(ClusterStateResponse {
        node_id: state.node_id.clone(),
        state: state.consensus.state().to_string(),
        workers,
    })
}

async fn metrics_exposition() -> impl IntoResponse {
    let encoder = prometheus::TextEncoder::new();
    match encoder.encode_to_string(&prometheus::gather()) {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("encode metrics: {e}"),
        )
            .into_response(),
    }
}
