//! Image upload handlers.
//!
//! Sessions belong to the caller that opened them; other callers see them
//! as missing.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use labgrid_ingest::{IngestError, InitUpload};
use labgrid_state::UploadSession;

use crate::AppState;
use crate::error::ApiError;
use crate::response::{ApiResponse, caller};

fn owned_session(state: &AppState, owner: &str, id: &str) -> Result<UploadSession, ApiError> {
    let session = state.ingest.status(id)?;
    if session.owner != owner {
        return Err(IngestError::SessionNotFound(id.to_string()).into());
    }
    Ok(session)
}

/// POST /uploads
pub async fn init_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<InitUpload>,
) -> Result<Response, ApiError> {
    let owner = caller(&headers)?;
    let session = state.ingest.init_upload(&owner, req).await?;
    Ok((StatusCode::CREATED, ApiResponse::ok(session)).into_response())
}

/// GET /uploads/{id}
pub async fn upload_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let owner = caller(&headers)?;
    Ok(ApiResponse::ok(owned_session(&state, &owner, &id)?).into_response())
}

/// PUT /uploads/{id}/chunks/{index}
pub async fn upload_chunk(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, index)): Path<(String, u32)>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let owner = caller(&headers)?;
    owned_session(&state, &owner, &id)?;
    let session = state.ingest.upload_chunk(&id, index, &body).await?;
    Ok(ApiResponse::ok(serde_json::json!({
        "upload_id": session.id,
        "index": index,
        "received": session.received.len(),
        "total_chunks": session.total_chunks,
    }))
    .into_response())
}

/// POST /uploads/{id}/complete
pub async fn complete_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let owner = caller(&headers)?;
    owned_session(&state, &owner, &id)?;
    // The conversion task keeps running after its handle is dropped.
    let completion = state.ingest.complete_upload(&id).await?;
    Ok((StatusCode::ACCEPTED, ApiResponse::ok(completion.session)).into_response())
}

/// GET /uploads/{id}/missing
pub async fn missing_chunks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let owner = caller(&headers)?;
    owned_session(&state, &owner, &id)?;
    Ok(ApiResponse::ok(state.ingest.missing_chunks(&id)?).into_response())
}
