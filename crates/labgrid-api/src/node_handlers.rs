//! Node handlers: agent heartbeats and node administration.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use labgrid_pool::{HeartbeatReport, NodeRegistration};
use labgrid_state::NodeStatus;

use crate::AppState;
use crate::error::ApiError;
use crate::response::ApiResponse;

/// POST /nodes/heartbeat
pub async fn heartbeat(
    State(state): State<AppState>,
    Json(report): Json<HeartbeatReport>,
) -> Result<Response, ApiError> {
    let node = state.pool.heartbeat(&report).await?;
    Ok(ApiResponse::ok(node).into_response())
}

/// GET /admin/nodes
pub async fn list_nodes(State(state): State<AppState>) -> impl IntoResponse {
    ApiResponse::ok(state.pool.list_nodes().await)
}

/// POST /admin/nodes
pub async fn register_node(
    State(state): State<AppState>,
    Json(reg): Json<NodeRegistration>,
) -> Result<Response, ApiError> {
    let node = state.pool.register_node(reg).await?;
    Ok((StatusCode::CREATED, ApiResponse::ok(node)).into_response())
}

/// GET /admin/nodes/stale
pub async fn stale_nodes(State(state): State<AppState>) -> impl IntoResponse {
    ApiResponse::ok(state.pool.stale_nodes().await)
}

#[derive(Debug, Deserialize)]
pub struct SetNodeStatus {
    pub status: NodeStatus,
}

/// POST /admin/nodes/{id}/status
pub async fn set_node_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SetNodeStatus>,
) -> Result<Response, ApiError> {
    let node = state.pool.set_status(&id, req.status).await?;
    Ok(ApiResponse::ok(node).into_response())
}

/// DELETE /admin/nodes/{id}
pub async fn remove_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    state.pool.remove_node(&id).await?;
    Ok(ApiResponse::ok("removed").into_response())
}
