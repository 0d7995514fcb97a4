//! Health check and metrics handlers

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use utoipa::ToSchema;

use crate::auth::AppState;
use crate::handlers::{api_error, ApiResult};

/// Basic health response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Overall health status
    pub status: String,
}

/// Readiness response with component checks
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ReadinessResponse {
    pub status: String,
    pub database: ComponentHealth,
    pub providers: ComponentHealth,
}

/// Individual component health status
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ComponentHealth {
    /// healthy, unhealthy or skipped
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            error: None,
        }
    }

    fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            status: "unhealthy".to_string(),
            error: Some(error.into()),
        }
    }
}

/// Liveness check
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Service is alive", body = HealthResponse)
    )
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}

/// Readiness check: database reachable and at least one provider usable
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "health",
    responses(
        (status = 200, description = "Service is ready", body = ReadinessResponse),
        (status = 503, description = "Service is not ready", body = ReadinessResponse)
    )
)]
pub async fn readiness(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let database = match &state.db_pool {
        Some(pool) => match pool.health_check().await {
            Ok(()) => ComponentHealth::healthy(),
            Err(e) => ComponentHealth::unhealthy(e.to_string()),
        },
        None => ComponentHealth {
            status: "skipped".to_string(),
            error: None,
        },
    };

    let providers = match state.email.factory().has_available_provider().await {
        Ok(true) => ComponentHealth::healthy(),
        Ok(false) => ComponentHealth::unhealthy("No email provider available"),
        Err(e) => ComponentHealth::unhealthy(e.to_string()),
    };

    let ready = database.status != "unhealthy" && providers.status == "healthy";
    if !ready {
        warn!("Readiness check failed");
    }

    let (status, label) = if ready {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not_ready")
    };

    (
        status,
        Json(ReadinessResponse {
            status: label.to_string(),
            database,
            providers,
        }),
    )
}

/// Prometheus text exposition
pub async fn metrics(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let body = state.email.metrics().render().map_err(api_error)?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}
