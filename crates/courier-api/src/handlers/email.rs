//! Email delivery, template and log handlers

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::{Duration, Utc};
use courier_common::types::{EmailCategory, Paginated, Role, UserId};
use courier_common::Error;
use courier_core::{EmailMessage, EmailResult, RenderedEmail, RetrySummary, TemplateId};
use courier_storage::{EmailLog, EmailLogFilter, EmailStats, EmailStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::auth::{require_role, AppState, AuthContext};
use crate::handlers::{api_error, ApiResult, Envelope};

/// Send one templated email
///
/// POST /email/send
///
/// Delivery failures are domain data: the response is 201 either way and
/// `success` tells the outcome.
pub async fn send_email(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(message): Json<EmailMessage>,
) -> ApiResult<(StatusCode, Json<Envelope<EmailResult>>)> {
    require_role(&auth, &[Role::Admin])?;

    let result = state.email.send_email(message).await.map_err(api_error)?;
    let body = if result.success {
        Envelope::ok(result)
    } else {
        let error = result.error.clone().unwrap_or_else(|| "Send failed".to_string());
        Envelope::failed(error, Some(result))
    };

    Ok((StatusCode::CREATED, Json(body)))
}

/// One recipient of a bulk send
#[derive(Debug, Clone, Deserialize)]
pub struct BulkRecipient {
    pub email: String,
    /// Merged over the shared data
    #[serde(default)]
    pub data: Value,
    pub user_id: Option<UserId>,
}

/// Bulk send request: one template to many recipients
#[derive(Debug, Clone, Deserialize)]
pub struct BulkEmailRequest {
    pub recipients: Vec<BulkRecipient>,
    pub subject: String,
    pub template: String,
    #[serde(default)]
    pub data: Value,
    pub from: Option<String>,
    pub reply_to: Option<String>,
}

impl BulkEmailRequest {
    fn into_messages(self) -> Vec<EmailMessage> {
        let shared = self.data;
        self.recipients
            .into_iter()
            .map(|recipient| EmailMessage {
                to: vec![recipient.email],
                subject: self.subject.clone(),
                template: self.template.clone(),
                data: merge_data(&shared, recipient.data),
                from: self.from.clone(),
                reply_to: self.reply_to.clone(),
                user_id: recipient.user_id,
                ..Default::default()
            })
            .collect()
    }
}

fn merge_data(shared: &Value, own: Value) -> Value {
    match (shared, own) {
        (Value::Object(base), Value::Object(extra)) => {
            let mut merged = base.clone();
            merged.extend(extra);
            Value::Object(merged)
        }
        (base, Value::Null) => base.clone(),
        (_, own) => own,
    }
}

/// Bulk send outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkSummary {
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
    pub blocked: usize,
    pub results: Vec<EmailResult>,
}

/// Send a template to many recipients
///
/// POST /email/bulk
pub async fn send_bulk(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(input): Json<BulkEmailRequest>,
) -> ApiResult<(StatusCode, Json<Envelope<BulkSummary>>)> {
    require_role(&auth, &[Role::Admin])?;

    if input.recipients.is_empty() {
        return Err(api_error(Error::Validation(
            "At least one recipient is required".to_string(),
        )));
    }
    input.template.parse::<TemplateId>().map_err(api_error)?;

    let results = state.email.send_bulk_emails(input.into_messages()).await;
    let sent = results.iter().filter(|r| r.success).count();
    let blocked = results.iter().filter(|r| r.blocked).count();
    let summary = BulkSummary {
        total: results.len(),
        sent,
        failed: results.len() - sent - blocked,
        blocked,
        results,
    };

    let body = if summary.failed == 0 {
        Envelope::ok(summary)
    } else {
        let error = format!("{} of {} emails failed", summary.failed, summary.total);
        Envelope::failed(error, Some(summary))
    };
    Ok((StatusCode::CREATED, Json(body)))
}

/// Preview request
#[derive(Debug, Clone, Deserialize)]
pub struct PreviewRequest {
    pub template: String,
    #[serde(default)]
    pub data: Value,
}

/// Rendered preview
#[derive(Debug, Clone, Serialize)]
pub struct PreviewResponse {
    pub template: TemplateId,
    pub subject: String,
    #[serde(flatten)]
    pub content: RenderedEmail,
}

/// Render a template without sending
///
/// POST /email/preview
pub async fn preview(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(input): Json<PreviewRequest>,
) -> ApiResult<Json<PreviewResponse>> {
    require_role(&auth, &[Role::Partner])?;

    let template: TemplateId = input.template.parse().map_err(api_error)?;
    let content = state
        .email
        .preview(&input.template, &input.data)
        .map_err(api_error)?;

    Ok(Json(PreviewResponse {
        template,
        subject: template.default_subject().to_string(),
        content,
    }))
}

/// Retry sweep parameters
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetryParams {
    pub limit: Option<i64>,
    #[serde(alias = "maxRetries")]
    pub max_retries: Option<i32>,
}

/// Run one retry sweep now
///
/// POST /email/retry-failed
pub async fn retry_failed(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Query(params): Query<RetryParams>,
) -> ApiResult<Json<RetrySummary>> {
    require_role(&auth, &[Role::Admin])?;

    let limit = params
        .limit
        .unwrap_or(state.retry_config.batch_limit)
        .clamp(1, 500);
    let max_retries = params
        .max_retries
        .unwrap_or(state.retry_config.max_retries)
        .max(1);

    let summary = state
        .retry
        .run_once(limit, max_retries)
        .await
        .map_err(api_error)?;
    info!(
        processed = summary.processed,
        skipped_run = summary.skipped_run,
        "Manual retry sweep finished"
    );
    Ok(Json(summary))
}

/// Template registry entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateInfo {
    pub name: TemplateId,
    pub category: Option<EmailCategory>,
    pub default_subject: String,
}

/// List known templates
///
/// GET /email/templates
pub async fn list_templates(
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<Vec<TemplateInfo>>> {
    require_role(&auth, &[Role::Partner])?;

    Ok(Json(
        TemplateId::ALL
            .iter()
            .map(|t| TemplateInfo {
                name: *t,
                category: t.category(),
                default_subject: t.default_subject().to_string(),
            })
            .collect(),
    ))
}

/// Stats window
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatsQuery {
    /// Only entries created in the last `days` days
    pub days: Option<i64>,
}

/// Aggregate log statistics
///
/// GET /email/stats
pub async fn stats(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Json<EmailStats>> {
    require_role(&auth, &[Role::Admin])?;

    let since = query
        .days
        .filter(|d| *d > 0)
        .map(|d| Utc::now() - Duration::days(d));
    let stats = state
        .email
        .logs()
        .stats(since, state.retry_config.max_retries)
        .await
        .map_err(api_error)?;
    Ok(Json(stats))
}

/// Log query parameters
#[derive(Debug, Clone, Deserialize)]
pub struct LogQuery {
    pub status: Option<EmailStatus>,
    pub template: Option<String>,
    #[serde(alias = "userId")]
    pub user_id: Option<UserId>,
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_page() -> i64 {
    1
}

fn default_limit() -> i64 {
    20
}

/// Paginated log query
///
/// GET /email/logs
pub async fn list_logs(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Json<Paginated<EmailLog>>> {
    require_role(&auth, &[Role::Admin])?;

    let filter = EmailLogFilter {
        status: query.status,
        template: query.template,
        user_id: query.user_id,
    };
    let page = state
        .email
        .logs()
        .list(&filter, query.page, query.limit)
        .await
        .map_err(api_error)?;
    Ok(Json(page))
}
