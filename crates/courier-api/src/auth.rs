//! Authentication module

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use axum::{
    extract::{OriginalUri, Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
    Json,
};
use courier_common::config::{BootstrapKey, RetryConfig};
use courier_common::types::{Role, UserId};
use courier_common::{Error, Result};
use courier_core::{EmailService, RetryScheduler};
use courier_storage::{ApiKey, ApiKeyId, ApiKeyRepository, DatabasePool, NewApiKey};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::handlers::{api_error, ApiError, ErrorResponse};

/// Application state shared across handlers
pub struct AppState {
    pub email: Arc<EmailService>,
    pub retry: Arc<RetryScheduler>,
    pub api_keys: Arc<dyn ApiKeyRepository>,
    /// Absent when running on in-memory storage
    pub db_pool: Option<DatabasePool>,
    pub retry_config: RetryConfig,
}

/// Authenticated context extracted from API key
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub role: Role,
    /// Recipient identity for `user` keys
    pub user_id: Option<UserId>,
    /// API key ID for audit logging
    pub api_key_id: ApiKeyId,
}

impl AuthContext {
    /// Admins pass every role check
    pub fn has_role(&self, roles: &[Role]) -> bool {
        self.role == Role::Admin || roles.contains(&self.role)
    }
}

/// Paths served without an API key
fn is_public(path: &str) -> bool {
    path.starts_with("/health")
        || path == "/metrics"
        || path == "/openapi.json"
        || path == "/docs"
        || path.starts_with("/email/unsubscribe")
}

/// Extract API key from request
pub fn extract_api_key(req: &Request) -> Option<&str> {
    if let Some(auth) = req.headers().get("authorization") {
        if let Ok(auth_str) = auth.to_str() {
            if let Some(key) = auth_str.strip_prefix("Bearer ") {
                return Some(key.trim());
            }
        }
    }

    if let Some(key) = req.headers().get("x-api-key") {
        if let Ok(key_str) = key.to_str() {
            return Some(key_str);
        }
    }

    None
}

/// The prefix of an API key (first 8 characters)
pub fn key_prefix(api_key: &str) -> Option<&str> {
    api_key.get(..8)
}

/// SHA-256 hex digest of an API key
pub fn hash_api_key(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Verify an API key against a stored hash.
///
/// Accepts Argon2 PHC strings (`$argon2...`) and SHA-256 hex digests.
fn verify_api_key(api_key: &str, stored_hash: &str) -> bool {
    if stored_hash.starts_with("$argon2") {
        return PasswordHash::new(stored_hash)
            .ok()
            .and_then(|parsed_hash| {
                Argon2::default()
                    .verify_password(api_key.as_bytes(), &parsed_hash)
                    .ok()
            })
            .is_some();
    }

    hash_api_key(api_key) == stored_hash
}

fn unauthorized(message: &str) -> ApiError {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: "UNAUTHORIZED".to_string(),
            message: message.to_string(),
        }),
    )
}

async fn validate_api_key(
    repo: &Arc<dyn ApiKeyRepository>,
    api_key: &str,
) -> std::result::Result<ApiKey, ApiError> {
    let prefix = key_prefix(api_key).ok_or_else(|| {
        warn!("API key too short");
        unauthorized("Invalid API key")
    })?;

    let candidates = repo.find_by_prefix(prefix).await.map_err(|e| {
        error!("Failed to look up API key: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "INTERNAL_ERROR".to_string(),
                message: "Failed to validate API key".to_string(),
            }),
        )
    })?;

    let Some(key) = candidates
        .into_iter()
        .find(|candidate| verify_api_key(api_key, &candidate.key_hash))
    else {
        warn!("No API key matched prefix {}", prefix);
        return Err(unauthorized("Invalid API key"));
    };

    if key.is_expired() {
        warn!("API key {} has expired", key.id);
        return Err(unauthorized("API key expired"));
    }

    let repo = repo.clone();
    let key_id = key.id;
    tokio::spawn(async move {
        if let Err(e) = repo.update_last_used(key_id).await {
            error!("Failed to update API key last_used_at: {}", e);
        }
    });

    debug!(key_id = %key.id, role = %key.role, "API key authenticated");
    Ok(key)
}

/// Authentication middleware
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> std::result::Result<Response, ApiError> {
    // Nested routers see a stripped path
    let path = request
        .extensions()
        .get::<OriginalUri>()
        .map(|uri| uri.path().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    if is_public(&path) {
        return Ok(next.run(request).await);
    }

    let api_key = extract_api_key(&request).ok_or_else(|| {
        warn!("Missing API key in request to {}", path);
        unauthorized("Missing API key")
    })?;

    let key = validate_api_key(&state.api_keys, api_key).await?;

    request.extensions_mut().insert(AuthContext {
        role: key.role,
        user_id: key.user_id,
        api_key_id: key.id,
    });

    Ok(next.run(request).await)
}

/// Reject callers whose role is not in `roles`
pub fn require_role(auth: &AuthContext, roles: &[Role]) -> std::result::Result<(), ApiError> {
    if !auth.has_role(roles) {
        warn!(
            "Role access denied: API key {} with role {} needs one of {:?}",
            auth.api_key_id, auth.role, roles
        );
        return Err(api_error(Error::PermissionDenied(
            "Insufficient permissions".to_string(),
        )));
    }
    Ok(())
}

/// Insert configured keys that are not stored yet
pub async fn seed_bootstrap_keys(
    repo: &dyn ApiKeyRepository,
    keys: &[BootstrapKey],
) -> Result<usize> {
    let mut created = 0;
    for key in keys {
        let Some(prefix) = key_prefix(&key.key) else {
            warn!(name = %key.name, "Bootstrap key shorter than 8 characters, skipped");
            continue;
        };

        let existing = repo.find_by_prefix(prefix).await?;
        if existing
            .iter()
            .any(|candidate| verify_api_key(&key.key, &candidate.key_hash))
        {
            continue;
        }

        repo.create(NewApiKey {
            name: key.name.clone(),
            user_id: key.user_id.clone(),
            role: key.role,
            key_hash: hash_api_key(&key.key),
            key_prefix: prefix.to_string(),
            expires_at: None,
        })
        .await?;
        info!(name = %key.name, role = %key.role, "Seeded bootstrap API key");
        created += 1;
    }
    Ok(created)
}
