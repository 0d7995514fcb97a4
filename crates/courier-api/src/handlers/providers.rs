//! Provider quota and health dashboards

use axum::{extract::State, Extension, Json};
use chrono::NaiveDate;
use courier_common::types::{ProviderId, Role};
use courier_core::{HealthSnapshot, ProviderStats};
use courier_storage::DailyCounter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::auth::{require_role, AppState, AuthContext};
use crate::handlers::{api_error, ApiResult};

/// Per-provider stats
///
/// GET /email/stats/providers
pub async fn provider_stats(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<Vec<ProviderStats>>> {
    require_role(&auth, &[Role::Admin])?;

    let stats = state
        .email
        .factory()
        .provider_stats()
        .await
        .map_err(api_error)?;
    Ok(Json(stats))
}

/// One provider's share of today's quota
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub provider: ProviderId,
    pub sent: u64,
    pub daily_limit: u32,
    pub remaining: u64,
    pub percentage_used: f64,
}

/// Today's usage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageResponse {
    pub date: NaiveDate,
    pub total_count: u64,
    pub counter: DailyCounter,
    pub providers: Vec<ProviderUsage>,
}

fn percentage(sent: u64, limit: u32) -> f64 {
    if limit == 0 {
        return 100.0;
    }
    let pct = sent as f64 / limit as f64 * 100.0;
    (pct * 100.0).round() / 100.0
}

/// Today's counter with remaining capacity
///
/// GET /email/stats/usage
pub async fn usage(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<UsageResponse>> {
    require_role(&auth, &[Role::Admin])?;

    let factory = state.email.factory();
    let counter = factory
        .counters()
        .get_daily_counter()
        .await
        .map_err(api_error)?;

    let providers = factory
        .providers()
        .iter()
        .map(|p| {
            let limit = p.metadata().daily_limit;
            let sent = counter.count(p.id());
            ProviderUsage {
                provider: p.id(),
                sent,
                daily_limit: limit,
                remaining: (limit as u64).saturating_sub(sent),
                percentage_used: percentage(sent, limit),
            }
        })
        .collect();

    Ok(Json(UsageResponse {
        date: counter.date,
        total_count: counter.total_count,
        counter,
        providers,
    }))
}

/// Provider health snapshot
///
/// GET /email/stats/health
pub async fn provider_health(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<HealthSnapshot>> {
    require_role(&auth, &[Role::Admin])?;

    let snapshot = state.email.factory().health().await.map_err(api_error)?;
    Ok(Json(snapshot))
}

/// Zero today's counters
///
/// POST /email/stats/reset-counters
pub async fn reset_counters(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<DailyCounter>> {
    require_role(&auth, &[Role::Admin])?;

    let counter = state
        .email
        .factory()
        .counters()
        .reset_counters()
        .await
        .map_err(api_error)?;
    for provider in ProviderId::ALL {
        state.email.metrics().set_sent_today(provider, 0);
    }
    info!(key_id = %auth.api_key_id, "Daily counters reset by API");
    Ok(Json(counter))
}

/// Re-initialize providers and report health
///
/// POST /email/stats/refresh-health
pub async fn refresh_health(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<HealthSnapshot>> {
    require_role(&auth, &[Role::Admin])?;

    let snapshot = state
        .email
        .factory()
        .refresh_health()
        .await
        .map_err(api_error)?;
    Ok(Json(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_is_rounded() {
        assert_eq!(percentage(0, 100), 0.0);
        assert_eq!(percentage(1, 3), 33.33);
        assert_eq!(percentage(200, 200), 100.0);
        assert_eq!(percentage(5, 0), 100.0);
    }
}
