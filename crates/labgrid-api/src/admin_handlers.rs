//! Operator handlers: challenge catalogue, instance oversight, templates.

use axum::Json;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use labgrid_state::Challenge;

use crate::AppState;
use crate::error::ApiError;
use crate::response::ApiResponse;

// ── Challenges ─────────────────────────────────────────────────

/// GET /admin/challenges
pub async fn list_challenges(State(state): State<AppState>) -> Result<Response, ApiError> {
    Ok(ApiResponse::ok(state.manager.list_challenges()?).into_response())
}

/// GET /admin/challenges/{id}
pub async fn get_challenge(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    Ok(ApiResponse::ok(state.manager.get_challenge(&id)?).into_response())
}

/// PUT /admin/challenges
pub async fn put_challenge(
    State(state): State<AppState>,
    Json(challenge): Json<Challenge>,
) -> Result<Response, ApiError> {
    Ok(ApiResponse::ok(state.manager.put_challenge(challenge)?).into_response())
}

// ── Instances ──────────────────────────────────────────────────

/// GET /admin/instances
pub async fn list_all_instances(State(state): State<AppState>) -> Result<Response, ApiError> {
    Ok(ApiResponse::ok(state.manager.list_all()?).into_response())
}

/// DELETE /admin/instances/{id}
pub async fn delete_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    state.manager.delete(&id).await?;
    Ok(ApiResponse::ok("deleted").into_response())
}

// ── Templates ──────────────────────────────────────────────────

/// GET /admin/templates
pub async fn list_templates(State(state): State<AppState>) -> Result<Response, ApiError> {
    Ok(ApiResponse::ok(state.ingest.registry().list()?).into_response())
}

/// GET /admin/templates/{id}
pub async fn get_template(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    Ok(ApiResponse::ok(state.ingest.registry().get(&id)?).into_response())
}

#[derive(Debug, Deserialize)]
pub struct SetTemplateActive {
    pub active: bool,
}

/// POST /admin/templates/{id}/active
pub async fn set_template_active(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SetTemplateActive>,
) -> Result<Response, ApiError> {
    let template = state.ingest.registry().set_active(&id, req.active)?;
    Ok(ApiResponse::ok(template).into_response())
}
