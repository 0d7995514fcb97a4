//! Preference and unsubscribe handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Html,
    Extension, Json,
};
use courier_common::types::{EmailCategory, Role, UserId};
use courier_common::Error;
use courier_storage::{EmailPreference, PreferenceUpdate};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::auth::{require_role, AppState, AuthContext};
use crate::handlers::{api_error, ApiResult, Envelope};

fn caller_user(auth: &AuthContext) -> ApiResult<&str> {
    auth.user_id.as_deref().ok_or_else(|| {
        api_error(Error::Validation(
            "API key is not bound to a user".to_string(),
        ))
    })
}

/// Address used when a record has to be created
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PreferenceQuery {
    #[serde(default)]
    pub email: String,
}

/// Caller's own preferences, created with defaults when absent
///
/// GET /email/preferences
pub async fn get_preferences(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<PreferenceQuery>,
) -> ApiResult<Json<EmailPreference>> {
    require_role(&auth, &[Role::User])?;
    let user_id = caller_user(&auth)?;

    let pref = state
        .email
        .preferences()
        .get_or_create(user_id, &query.email)
        .await
        .map_err(api_error)?;
    Ok(Json(pref))
}

/// Partial preference update body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdatePreferencesRequest {
    #[serde(default)]
    pub email: String,
    #[serde(flatten)]
    pub update: PreferenceUpdate,
}

/// Update the caller's own preferences
///
/// PUT /email/preferences
pub async fn update_preferences(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(input): Json<UpdatePreferencesRequest>,
) -> ApiResult<Json<EmailPreference>> {
    require_role(&auth, &[Role::User])?;
    let user_id = caller_user(&auth)?;

    let pref = state
        .email
        .preferences()
        .update(user_id, &input.email, &input.update)
        .await
        .map_err(api_error)?;
    Ok(Json(pref))
}

/// Administrative creation body
#[derive(Debug, Clone, Deserialize)]
pub struct CreatePreferencesRequest {
    pub user_id: UserId,
    pub email: String,
    #[serde(flatten)]
    pub update: PreferenceUpdate,
}

/// Create preferences for any user
///
/// POST /email/preferences
pub async fn create_preferences(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(input): Json<CreatePreferencesRequest>,
) -> ApiResult<(StatusCode, Json<EmailPreference>)> {
    require_role(&auth, &[Role::Admin])?;

    if input.user_id.trim().is_empty() {
        return Err(api_error(Error::Validation("user_id is required".to_string())));
    }

    let pref = state
        .email
        .preferences()
        .create_for(&input.user_id, &input.email, &input.update)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(pref)))
}

/// Token-based unsubscribe body
#[derive(Debug, Clone, Deserialize)]
pub struct UnsubscribeRequest {
    pub token: String,
    /// Omit for a global unsubscribe
    pub categories: Option<Vec<EmailCategory>>,
}

/// What an unsubscribe changed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeResult {
    pub global_unsubscribe: bool,
    pub unsubscribed_categories: Vec<EmailCategory>,
}

impl From<EmailPreference> for UnsubscribeResult {
    fn from(pref: EmailPreference) -> Self {
        Self {
            global_unsubscribe: pref.global_unsubscribe,
            unsubscribed_categories: pref.unsubscribed_categories,
        }
    }
}

/// Unsubscribe with a token from an email
///
/// POST /email/unsubscribe
pub async fn unsubscribe(
    State(state): State<Arc<AppState>>,
    Json(input): Json<UnsubscribeRequest>,
) -> ApiResult<Json<Envelope<UnsubscribeResult>>> {
    let pref = state
        .email
        .preferences()
        .unsubscribe_by_token(&input.token, input.categories.as_deref())
        .await
        .map_err(api_error)?;
    Ok(Json(Envelope::ok(pref.into())))
}

/// One-click global unsubscribe from an email link
///
/// GET /email/unsubscribe/:token
pub async fn unsubscribe_link(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Html<&'static str>, (StatusCode, Html<&'static str>)> {
    match state
        .email
        .preferences()
        .unsubscribe_by_token(&token, None)
        .await
    {
        Ok(pref) => {
            info!(user_id = %pref.user_id, "One-click unsubscribe");
            Ok(Html(UNSUBSCRIBED_HTML))
        }
        Err(Error::NotFound(_)) => Err((StatusCode::NOT_FOUND, Html(INVALID_LINK_HTML))),
        Err(e) => {
            let (status, _) = api_error(e);
            Err((status, Html(ERROR_HTML)))
        }
    }
}

const UNSUBSCRIBED_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="UTF-8"><title>Unsubscribed</title></head>
<body>
    <h1>You have been unsubscribed</h1>
    <p>You will no longer receive emails from us.</p>
</body>
</html>"#;

const INVALID_LINK_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="UTF-8"><title>Invalid link</title></head>
<body>
    <h1>Invalid unsubscribe link</h1>
    <p>This link is not valid or has already been replaced.</p>
</body>
</html>"#;

const ERROR_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="UTF-8"><title>Error</title></head>
<body>
    <h1>Something went wrong</h1>
    <p>Please try again later.</p>
</body>
</html>"#;
