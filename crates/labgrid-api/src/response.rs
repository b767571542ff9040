//! Response envelope and caller identity.

use axum::Json;
use axum::http::HeaderMap;
use serde::Serialize;

use crate::error::ApiError;

/// Header carrying the authenticated caller, set by the upstream auth layer.
pub const CALLER_HEADER: &str = "x-user-id";

/// Response wrapper for consistent API format.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

/// The caller identity from `x-user-id`.
pub fn caller(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ApiError::Unauthorized)
}
