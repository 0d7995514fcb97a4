//! API routes

use axum::{
    http::{HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use courier_common::config::ApiConfig;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{auth_middleware, AppState};
use crate::handlers::{email, health, preferences, providers};
use crate::openapi::create_openapi_routes;

/// Create the API router
pub fn create_router(state: Arc<AppState>, api: &ApiConfig) -> Router {
    // Health and metrics routes (no auth required)
    let health_routes = Router::new()
        .route("/", get(health::health))
        .route("/ready", get(health::readiness))
        .with_state(state.clone());

    let metrics_routes = Router::new()
        .route("/metrics", get(health::metrics))
        .with_state(state.clone());

    // Provider dashboards
    let provider_stats_routes = Router::new()
        .route("/providers", get(providers::provider_stats))
        .route("/usage", get(providers::usage))
        .route("/health", get(providers::provider_health))
        .route("/reset-counters", post(providers::reset_counters))
        .route("/refresh-health", post(providers::refresh_health));

    // Email routes; unsubscribe paths are let through by the middleware
    let email_routes = Router::new()
        .route("/send", post(email::send_email))
        .route("/bulk", post(email::send_bulk))
        .route("/preview", post(email::preview))
        .route("/retry-failed", post(email::retry_failed))
        .route("/templates", get(email::list_templates))
        .route("/stats", get(email::stats))
        .route("/logs", get(email::list_logs))
        .route(
            "/preferences",
            get(preferences::get_preferences)
                .put(preferences::update_preferences)
                .post(preferences::create_preferences),
        )
        .route("/unsubscribe", post(preferences::unsubscribe))
        .route("/unsubscribe/:token", get(preferences::unsubscribe_link))
        .nest("/stats", provider_stats_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .with_state(state);

    let mut router = Router::new()
        .nest("/health", health_routes)
        .merge(metrics_routes)
        .nest("/email", email_routes);

    if api.enable_docs {
        router = router.merge(create_openapi_routes());
    }

    if let Some(cors) = cors_layer(&api.cors_origins) {
        router = router.layer(cors);
    }

    router.layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }

    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
        ]);

    if origins.iter().any(|o| o == "*") {
        return Some(layer.allow_origin(AllowOrigin::any()));
    }

    let origins: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    Some(layer.allow_origin(AllowOrigin::list(origins)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::seed_bootstrap_keys;
    use axum::http::{HeaderName, StatusCode};
    use axum_test::TestServer;
    use courier_common::config::{BootstrapKey, EmailConfig, RetryConfig};
    use courier_common::types::{ProviderId, Role};
    use courier_core::{
        DailyCounterStore, EmailMetrics, EmailProvider, EmailService, MiniJinjaRenderer,
        MockProvider, PreferenceService, ProviderFactory, RetryScheduler,
    };
    use courier_storage::{
        InMemoryApiKeyRepository, InMemoryCache, InMemoryEmailLogRepository,
        InMemoryPreferenceRepository,
    };
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::time::Duration;

    const ADMIN_KEY: &str = "cr_admin_test_key";
    const PARTNER_KEY: &str = "cr_partner_test_key";
    const USER_KEY: &str = "cr_user_test_key";

    struct Harness {
        server: TestServer,
        resend: Arc<MockProvider>,
        mailjet: Arc<MockProvider>,
    }

    async fn harness() -> Harness {
        let resend = Arc::new(MockProvider::new(ProviderId::Resend, 100, 0.9));
        let mailjet = Arc::new(MockProvider::new(ProviderId::Mailjet, 200, 0.9));
        let counters = Arc::new(DailyCounterStore::new(
            Arc::new(InMemoryCache::new()),
            Duration::from_secs(86_400),
        ));
        let factory = Arc::new(ProviderFactory::new(
            vec![
                resend.clone() as Arc<dyn EmailProvider>,
                mailjet.clone() as Arc<dyn EmailProvider>,
            ],
            counters,
            ProviderId::Resend,
        ));
        let config = EmailConfig {
            bulk_delay_ms: 0,
            ..EmailConfig::default()
        };
        let email = Arc::new(EmailService::new(
            factory,
            Arc::new(MiniJinjaRenderer::new().unwrap()),
            Arc::new(InMemoryEmailLogRepository::new()),
            Arc::new(PreferenceService::new(
                Arc::new(InMemoryPreferenceRepository::new()),
                "secret",
                "http://localhost/email/unsubscribe",
            )),
            Arc::new(EmailMetrics::new().unwrap()),
            &config,
        ));

        let api_keys = Arc::new(InMemoryApiKeyRepository::new());
        let keys = [
            (ADMIN_KEY, Role::Admin, None),
            (PARTNER_KEY, Role::Partner, None),
            (USER_KEY, Role::User, Some("u1".to_string())),
        ]
        .into_iter()
        .map(|(key, role, user_id)| BootstrapKey {
            name: format!("{} key", role),
            key: key.to_string(),
            role,
            user_id,
        })
        .collect::<Vec<_>>();
        seed_bootstrap_keys(api_keys.as_ref(), &keys).await.unwrap();

        let state = Arc::new(AppState {
            retry: Arc::new(RetryScheduler::new(email.clone())),
            email,
            api_keys,
            db_pool: None,
            retry_config: RetryConfig::default(),
        });

        let router = create_router(state, &ApiConfig::default());
        Harness {
            server: TestServer::new(router).unwrap(),
            resend,
            mailjet,
        }
    }

    fn api_key(key: &'static str) -> (HeaderName, HeaderValue) {
        (
            HeaderName::from_static("x-api-key"),
            HeaderValue::from_static(key),
        )
    }

    fn welcome() -> Value {
        json!({
            "to": "user@example.com",
            "subject": "Welcome!",
            "template": "welcome",
            "data": { "name": "Ada" }
        })
    }

    #[tokio::test]
    async fn health_is_public() {
        let h = harness().await;
        let response = h.server.get("/health").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.json::<Value>()["status"], "healthy");

        let response = h.server.get("/health/ready").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.json::<Value>()["database"]["status"], "skipped");
    }

    #[tokio::test]
    async fn send_requires_api_key() {
        let h = harness().await;
        let response = h.server.post("/email/send").json(&welcome()).await;
        assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);

        let (name, _) = api_key(ADMIN_KEY);
        let response = h
            .server
            .post("/email/send")
            .add_header(name, HeaderValue::from_static("cr_admin_wrong"))
            .json(&welcome())
            .await;
        assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn send_is_admin_only() {
        let h = harness().await;
        let (name, value) = api_key(USER_KEY);
        let response = h
            .server
            .post("/email/send")
            .add_header(name, value)
            .json(&welcome())
            .await;
        assert_eq!(response.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(response.json::<Value>()["error"], "FORBIDDEN");
    }

    #[tokio::test]
    async fn send_returns_created_envelope() {
        let h = harness().await;
        let (name, value) = api_key(ADMIN_KEY);
        let response = h
            .server
            .post("/email/send")
            .add_header(name, value)
            .json(&welcome())
            .await;

        assert_eq!(response.status_code(), StatusCode::CREATED);
        let body = response.json::<Value>();
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["provider"], "resend");
        assert_eq!(h.resend.sent_count().await, 1);
    }

    #[tokio::test]
    async fn delivery_failure_is_still_created() {
        let h = harness().await;
        h.resend.fail_with(Some("down")).await;
        h.mailjet.fail_with(Some("down")).await;

        let (name, value) = api_key(ADMIN_KEY);
        let response = h
            .server
            .post("/email/send")
            .add_header(name, value)
            .json(&welcome())
            .await;

        assert_eq!(response.status_code(), StatusCode::CREATED);
        let body = response.json::<Value>();
        assert_eq!(body["success"], false);
        assert_eq!(
            body["error"],
            "All providers failed: resend: down; mailjet: down"
        );
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected() {
        let h = harness().await;

        let (name, value) = api_key(ADMIN_KEY);
        let mut message = welcome();
        message["to"] = json!("not-an-address");
        let response = h
            .server
            .post("/email/send")
            .add_header(name, value)
            .json(&message)
            .await;
        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(response.json::<Value>()["error"], "VALIDATION_ERROR");

        let (name, value) = api_key(ADMIN_KEY);
        let mut message = welcome();
        message["template"] = json!("does-not-exist");
        let response = h
            .server
            .post("/email/send")
            .add_header(name, value)
            .json(&message)
            .await;
        assert_eq!(response.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn bulk_reports_per_recipient() {
        let h = harness().await;
        let (name, value) = api_key(ADMIN_KEY);
        let response = h
            .server
            .post("/email/bulk")
            .add_header(name, value)
            .json(&json!({
                "recipients": [
                    { "email": "a@example.com" },
                    { "email": "broken" },
                    { "email": "c@example.com", "data": { "name": "Cy" } }
                ],
                "subject": "Hello",
                "template": "welcome"
            }))
            .await;

        assert_eq!(response.status_code(), StatusCode::CREATED);
        let body = response.json::<Value>();
        assert_eq!(body["success"], false);
        assert_eq!(body["data"]["total"], 3);
        assert_eq!(body["data"]["sent"], 2);
        assert_eq!(body["data"]["failed"], 1);
    }

    #[tokio::test]
    async fn partner_can_list_and_preview_templates() {
        let h = harness().await;
        let (name, value) = api_key(PARTNER_KEY);
        let response = h.server.get("/email/templates").add_header(name, value).await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let templates = response.json::<Vec<Value>>();
        assert_eq!(templates.len(), 19);
        assert!(templates
            .iter()
            .any(|t| t["name"] == "newsletter" && t["category"] == "marketingEmails"));

        let (name, value) = api_key(PARTNER_KEY);
        let response = h
            .server
            .post("/email/preview")
            .add_header(name, value)
            .json(&json!({ "template": "welcome", "data": { "name": "Ada" } }))
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body = response.json::<Value>();
        assert!(body["html"].as_str().unwrap().contains("Ada"));
        assert_eq!(h.resend.sent_count().await, 0);
    }

    #[tokio::test]
    async fn preferences_and_unsubscribe_flow() {
        let h = harness().await;

        let (name, value) = api_key(USER_KEY);
        let response = h
            .server
            .get("/email/preferences")
            .add_query_param("email", "u1@example.com")
            .add_header(name, value)
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let pref = response.json::<Value>();
        assert_eq!(pref["user_id"], "u1");
        assert_eq!(pref["marketing_emails"], true);
        let token = pref["unsubscribe_token"].as_str().unwrap().to_string();

        let response = h
            .server
            .post("/email/unsubscribe")
            .json(&json!({ "token": token, "categories": ["marketingEmails"] }))
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body = response.json::<Value>();
        assert_eq!(body["data"]["unsubscribed_categories"], json!(["marketingEmails"]));
        assert_eq!(body["data"]["global_unsubscribe"], false);

        let (name, value) = api_key(ADMIN_KEY);
        let response = h
            .server
            .post("/email/send")
            .add_header(name, value)
            .json(&json!({
                "to": "u1@example.com",
                "subject": "News",
                "template": "newsletter",
                "user_id": "u1"
            }))
            .await;
        let body = response.json::<Value>();
        assert_eq!(body["success"], false);
        assert_eq!(body["data"]["blocked"], true);

        let response = h.server.get(&format!("/email/unsubscribe/{}", token)).await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert!(response.text().contains("unsubscribed"));

        let response = h.server.get("/email/unsubscribe/not-a-token").await;
        assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn admin_creates_preferences_once() {
        let h = harness().await;
        let body = json!({ "user_id": "u2", "email": "u2@example.com", "marketing_emails": false });

        let (name, value) = api_key(ADMIN_KEY);
        let response = h
            .server
            .post("/email/preferences")
            .add_header(name, value)
            .json(&body)
            .await;
        assert_eq!(response.status_code(), StatusCode::CREATED);
        assert_eq!(response.json::<Value>()["marketing_emails"], false);

        let (name, value) = api_key(ADMIN_KEY);
        let response = h
            .server
            .post("/email/preferences")
            .add_header(name, value)
            .json(&body)
            .await;
        assert_eq!(response.status_code(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn preferences_need_a_bound_user() {
        let h = harness().await;
        let (name, value) = api_key(ADMIN_KEY);
        let response = h.server.get("/email/preferences").add_header(name, value).await;
        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn dashboards_reflect_sends() {
        let h = harness().await;
        let (name, value) = api_key(ADMIN_KEY);
        h.server
            .post("/email/send")
            .add_header(name, value)
            .json(&welcome())
            .await;

        let (name, value) = api_key(ADMIN_KEY);
        let usage = h
            .server
            .get("/email/stats/usage")
            .add_header(name, value)
            .await
            .json::<Value>();
        assert_eq!(usage["total_count"], 1);
        assert_eq!(usage["providers"][0]["provider"], "resend");
        assert_eq!(usage["providers"][0]["remaining"], 99);

        let (name, value) = api_key(ADMIN_KEY);
        let logs = h
            .server
            .get("/email/logs")
            .add_query_param("status", "sent")
            .add_header(name, value)
            .await
            .json::<Value>();
        assert_eq!(logs["total"], 1);

        let (name, value) = api_key(ADMIN_KEY);
        let counter = h
            .server
            .post("/email/stats/reset-counters")
            .add_header(name, value)
            .await
            .json::<Value>();
        assert_eq!(counter["total_count"], 0);

        let (name, value) = api_key(ADMIN_KEY);
        let health = h
            .server
            .get("/email/stats/health")
            .add_header(name, value)
            .await
            .json::<Value>();
        assert_eq!(health["has_available_provider"], true);

        let metrics = h.server.get("/metrics").await.text();
        assert!(metrics.contains("courier_emails_sent_total{provider=\"resend\"} 1"));
    }

    #[tokio::test]
    async fn retry_sweep_endpoint() {
        let h = harness().await;
        h.resend.fail_with(Some("down")).await;
        h.mailjet.fail_with(Some("down")).await;
        let (name, value) = api_key(ADMIN_KEY);
        h.server
            .post("/email/send")
            .add_header(name, value)
            .json(&welcome())
            .await;

        h.resend.fail_with(None).await;
        let (name, value) = api_key(ADMIN_KEY);
        let response = h
            .server
            .post("/email/retry-failed")
            .add_query_param("limit", 10)
            .add_query_param("maxRetries", 3)
            .add_header(name, value)
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let summary = response.json::<Value>();
        assert_eq!(summary["processed"], 1);
        assert_eq!(summary["succeeded"], 1);
    }

    #[tokio::test]
    async fn openapi_is_served() {
        let h = harness().await;
        let response = h.server.get("/openapi.json").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.json::<Value>()["info"]["title"], "Courier API");
    }
}
