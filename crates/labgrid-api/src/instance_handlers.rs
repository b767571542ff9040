//! Instance lifecycle handlers, scoped to the calling owner.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiError;
use crate::response::{ApiResponse, caller};

/// Create request body.
#[derive(Debug, Deserialize)]
pub struct CreateInstance {
    #[serde(alias = "challenge_id")]
    pub challenge_slug: String,
}

/// POST /instances
pub async fn create_instance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateInstance>,
) -> Result<Response, ApiError> {
    let owner = caller(&headers)?;
    let instance = state.manager.create(&owner, &req.challenge_slug).await?;
    Ok((StatusCode::CREATED, ApiResponse::ok(instance)).into_response())
}

/// GET /instances
pub async fn list_instances(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let owner = caller(&headers)?;
    Ok(ApiResponse::ok(state.manager.list_active(&owner)?).into_response())
}

/// GET /instances/{id}
pub async fn get_instance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let owner = caller(&headers)?;
    Ok(ApiResponse::ok(state.manager.get(&owner, &id)?).into_response())
}

/// POST /instances/{id}/extend
pub async fn extend_instance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let owner = caller(&headers)?;
    Ok(ApiResponse::ok(state.manager.extend(&owner, &id)?).into_response())
}

/// POST /instances/{id}/stop
pub async fn stop_instance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let owner = caller(&headers)?;
    let outcome = state.manager.stop(&owner, &id).await?;
    Ok(ApiResponse::ok(outcome).into_response())
}
