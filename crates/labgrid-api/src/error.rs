//! Mapping of component errors onto HTTP responses.

use std::fmt;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use tracing::error;

use labgrid_engine::{AdmissionError, EngineError};
use labgrid_ingest::IngestError;
use labgrid_pool::PoolError;

use crate::response::ApiResponse;

#[derive(Debug)]
pub enum ApiError {
    /// No caller identity on the request.
    Unauthorized,
    Engine(EngineError),
    Pool(PoolError),
    Ingest(IngestError),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl From<PoolError> for ApiError {
    fn from(e: PoolError) -> Self {
        ApiError::Pool(e)
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        ApiError::Ingest(e)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Unauthorized => f.write_str("missing caller identity"),
            ApiError::Engine(e) => write!(f, "{e}"),
            ApiError::Pool(e) => write!(f, "{e}"),
            ApiError::Ingest(e) => write!(f, "{e}"),
        }
    }
}

fn ingest_status(e: &IngestError) -> StatusCode {
    match e {
        IngestError::UnsupportedFormat(_)
        | IngestError::InvalidRequest(_)
        | IngestError::InvalidChunkIndex { .. }
        | IngestError::ChunkSizeMismatch { .. }
        | IngestError::IncompleteUpload { .. } => StatusCode::BAD_REQUEST,
        IngestError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        IngestError::SessionNotFound(_) | IngestError::TemplateNotFound(_) => StatusCode::NOT_FOUND,
        IngestError::SessionExpired(_) => StatusCode::GONE,
        IngestError::InvalidStatus { .. } => StatusCode::CONFLICT,
        IngestError::ChecksumMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        IngestError::Conversion(_) | IngestError::Io(_) | IngestError::State(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Engine(e) => match e {
                EngineError::Admission(AdmissionError::ResourceLimitExceeded { .. }) => {
                    StatusCode::BAD_REQUEST
                }
                EngineError::Admission(AdmissionError::AlreadyRunning { .. }) => StatusCode::CONFLICT,
                EngineError::Admission(AdmissionError::CooldownActive { .. }) => {
                    StatusCode::TOO_MANY_REQUESTS
                }
                EngineError::NotFound(_) => StatusCode::NOT_FOUND,
                EngineError::InvalidState(_)
                | EngineError::LimitExceeded { .. }
                | EngineError::InvalidChallenge(_) => StatusCode::BAD_REQUEST,
                EngineError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                EngineError::ProvisionFailed(_) => StatusCode::BAD_GATEWAY,
                EngineError::Ingest(e) => ingest_status(e),
                EngineError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Pool(e) => match e {
                PoolError::NodeNotFound(_) => StatusCode::NOT_FOUND,
                PoolError::NodeBusy { .. } => StatusCode::CONFLICT,
                PoolError::InvalidNode(_) => StatusCode::BAD_REQUEST,
                PoolError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Ingest(e) => ingest_status(e),
        }
    }

    /// Machine-readable detail attached to the error envelope.
    fn details(&self) -> Option<Value> {
        match self {
            ApiError::Engine(EngineError::Admission(AdmissionError::CooldownActive {
                remaining_secs,
            })) => Some(json!({ "remaining_seconds": remaining_secs })),
            ApiError::Engine(EngineError::Admission(AdmissionError::AlreadyRunning {
                instance_id,
            })) => Some(json!({ "instance_id": instance_id })),
            ApiError::Engine(EngineError::Admission(AdmissionError::ResourceLimitExceeded {
                limit,
            })) => Some(json!({ "limit": limit })),
            ApiError::Engine(EngineError::LimitExceeded { max }) => {
                Some(json!({ "max_extensions": max }))
            }
            ApiError::Ingest(IngestError::IncompleteUpload { missing }) => {
                Some(json!({ "missing_chunks": missing }))
            }
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "request failed");
        }
        let body = ApiResponse {
            success: false,
            data: self.details(),
            error: Some(self.to_string()),
        };
        (status, Json(body)).into_response()
    }
}
