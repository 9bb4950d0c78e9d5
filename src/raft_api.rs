use crate::consensus::{RaftConsensus, TypeConfig};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use openraft::raft::{
    AppendEntriesRequest, InstallSnapshotRequest, InstallSnapshotResponse, VoteRequest,
};
use std::sync::Arc;

/// Peer-facing Raft RPC endpoints. Served on the raft transport listener,
/// never on the public observation port.
pub fn create_raft_router(consensus: Arc<RaftConsensus>) -> Router {
    Router::new()
        .route("/raft/vote", post(handle_vote))
        .route("/raft/append_entries", post(handle_append_entries))
        .route("/raft/install_snapshot", post(handle_install_snapshot))
        .with_state(consensus)
}

async fn handle_vote(
    State(consensus): State<Arc<RaftConsensus>>,
    Json(req): Json<VoteRequest<u64>>,
) -> impl IntoResponse {
    match consensus.raft().vote(req).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn handle_append_entries(
    State(consensus): State<Arc<RaftConsensus>>,
    Json(req): Json<AppendEntriesRequest<TypeConfig>>,
) -> impl IntoResponse {
    match consensus.raft().append_entries(req).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn handle_install_snapshot(
    State(consensus): State<Arc<RaftConsensus>>,
    Json(req): Json<InstallSnapshotRequest<TypeConfig>>,
) -> impl IntoResponse {
    let resp: Result<InstallSnapshotResponse<u64>, _> =
        consensus.raft().install_snapshot(req).await;
    match resp {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}
