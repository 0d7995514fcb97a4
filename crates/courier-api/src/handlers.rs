//! API request handlers

pub mod email;
pub mod health;
pub mod preferences;
pub mod providers;

use axum::{http::StatusCode, Json};
use courier_common::Error;
use serde::{Deserialize, Serialize};
use tracing::error;
use utoipa::ToSchema;

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Map a domain error onto its HTTP status and code
pub fn api_error(e: Error) -> ApiError {
    let status =
        StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!("Request failed: {}", e);
    }
    (
        status,
        Json(ErrorResponse {
            error: e.code().to_string(),
            message: e.to_string(),
        }),
    )
}

/// `{success, data|error}` envelope for delivery endpoints
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>, data: Option<T>) -> Self {
        Self {
            success: false,
            data,
            error: Some(error.into()),
        }
    }
}
