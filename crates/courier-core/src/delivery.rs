//! Delivery Orchestrator - gate, render, log, route and count every send

use crate::metrics::EmailMetrics;
use crate::preferences::{GateDecision, PreferenceService};
use crate::providers::{Attachment, EmailProvider, EmailResult, OutboundEmail};
use crate::selector::ProviderFactory;
use crate::templates::{RenderedEmail, TemplateId, TemplateRenderer};
use base64::Engine;
use courier_common::config::EmailConfig;
use courier_common::types::{Mailbox, UserId};
use courier_common::{Error, Result};
use courier_storage::{EmailLog, EmailLogRepository, NewEmailLog};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// A send request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmailMessage {
    /// One address or a list
    #[serde(deserialize_with = "one_or_many")]
    pub to: Vec<String>,
    pub subject: String,
    pub template: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(address) => vec![address],
        OneOrMany::Many(addresses) => addresses,
    })
}

fn check_address(field: &str, address: &str) -> Result<()> {
    if Mailbox::parse(address).is_none() {
        return Err(Error::Validation(format!(
            "Invalid email address in {}: {}",
            field, address
        )));
    }
    Ok(())
}

impl EmailMessage {
    /// Check required fields and addresses; resolves the template
    pub fn validate(&self) -> Result<TemplateId> {
        if self.to.is_empty() {
            return Err(Error::Validation("At least one recipient is required".to_string()));
        }
        if self.subject.trim().is_empty() {
            return Err(Error::Validation("Subject is required".to_string()));
        }
        if self.template.trim().is_empty() {
            return Err(Error::Validation("Template is required".to_string()));
        }

        for address in &self.to {
            check_address("to", address)?;
        }
        for address in &self.cc {
            check_address("cc", address)?;
        }
        for address in &self.bcc {
            check_address("bcc", address)?;
        }
        if let Some(from) = &self.from {
            check_address("from", from)?;
        }
        if let Some(reply_to) = &self.reply_to {
            check_address("reply_to", reply_to)?;
        }

        for attachment in &self.attachments {
            if attachment.filename.trim().is_empty() {
                return Err(Error::Validation("Attachment filename is required".to_string()));
            }
            base64::engine::general_purpose::STANDARD
                .decode(&attachment.content)
                .map_err(|e| {
                    Error::Validation(format!(
                        "Attachment {} is not valid base64: {}",
                        attachment.filename, e
                    ))
                })?;
        }

        self.template.parse()
    }

    fn outbound(&self, default_from: &str) -> OutboundEmail {
        OutboundEmail {
            to: self.to.clone(),
            subject: self.subject.clone(),
            from: self.from.clone().unwrap_or_else(|| default_from.to_string()),
            reply_to: self.reply_to.clone(),
            cc: self.cc.clone(),
            bcc: self.bcc.clone(),
            attachments: self.attachments.clone(),
        }
    }
}

/// Template data with the recipient's unsubscribe link filled in
fn with_unsubscribe_url(data: &Value, url: Option<String>) -> Value {
    let mut data = match data {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    if let (Some(url), Value::Object(map)) = (url, &mut data) {
        map.entry("unsubscribe_url").or_insert(Value::String(url));
    }
    data
}

/// Delivery orchestrator
pub struct EmailService {
    factory: Arc<ProviderFactory>,
    renderer: Arc<dyn TemplateRenderer>,
    logs: Arc<dyn EmailLogRepository>,
    preferences: Arc<PreferenceService>,
    metrics: Arc<EmailMetrics>,
    default_from: String,
    auto_fallback: bool,
    bulk_delay: Duration,
}

impl EmailService {
    pub fn new(
        factory: Arc<ProviderFactory>,
        renderer: Arc<dyn TemplateRenderer>,
        logs: Arc<dyn EmailLogRepository>,
        preferences: Arc<PreferenceService>,
        metrics: Arc<EmailMetrics>,
        config: &EmailConfig,
    ) -> Self {
        Self {
            factory,
            renderer,
            logs,
            preferences,
            metrics,
            default_from: config.default_from.clone(),
            auto_fallback: config.auto_fallback,
            bulk_delay: Duration::from_millis(config.bulk_delay_ms),
        }
    }

    pub fn factory(&self) -> &Arc<ProviderFactory> {
        &self.factory
    }

    pub fn logs(&self) -> &Arc<dyn EmailLogRepository> {
        &self.logs
    }

    pub fn preferences(&self) -> &Arc<PreferenceService> {
        &self.preferences
    }

    pub fn metrics(&self) -> &Arc<EmailMetrics> {
        &self.metrics
    }

    /// Send one message
    ///
    /// Returns `Err` only for invalid requests. Delivery problems, including
    /// preference blocks and render failures, come back as an unsuccessful
    /// `EmailResult`.
    pub async fn send_email(&self, message: EmailMessage) -> Result<EmailResult> {
        self.deliver(message, 1).await
    }

    /// Send messages one after another with the configured pause between
    /// them; a failing message never stops the batch
    pub async fn send_bulk_emails(&self, messages: Vec<EmailMessage>) -> Vec<EmailResult> {
        let total = messages.len();
        let mut results = Vec::with_capacity(total);

        for (index, message) in messages.into_iter().enumerate() {
            if index > 0 && !self.bulk_delay.is_zero() {
                tokio::time::sleep(self.bulk_delay).await;
            }

            let recipients = message.to.len() as u64;
            let result = match self.deliver(message, recipients).await {
                Ok(result) => result,
                Err(e) => {
                    debug!(index, "Rejected bulk message: {}", e);
                    EmailResult::failed(None, e.to_string())
                }
            };
            results.push(result);
        }

        let sent = results.iter().filter(|r| r.success).count();
        info!(total, sent, failed = total - sent, "Bulk send finished");
        results
    }

    /// Render a template without sending
    pub fn preview(&self, template: &str, data: &Value) -> Result<RenderedEmail> {
        let template: TemplateId = template.parse()?;
        self.renderer.render(template, data)
    }

    async fn gate(&self, user_id: Option<&str>, template: TemplateId) -> GateDecision {
        match self.preferences.evaluate(user_id, template).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(?user_id, "Preference lookup failed, allowing send: {}", e);
                GateDecision::allow()
            }
        }
    }

    async fn deliver(&self, message: EmailMessage, count: u64) -> Result<EmailResult> {
        let template = message.validate()?;

        let decision = self.gate(message.user_id.as_deref(), template).await;
        if !decision.allowed {
            self.metrics.record_blocked();
            info!(
                user_id = ?message.user_id,
                template = %template,
                "Email blocked by recipient preferences"
            );
            return Ok(EmailResult::blocked());
        }

        let data = with_unsubscribe_url(&message.data, decision.unsubscribe_url);
        let rendered = match self.renderer.render(template, &data) {
            Ok(rendered) => rendered,
            Err(e) => {
                error!(template = %template, "Failed to render email: {}", e);
                self.metrics.record_failed("render");
                return Ok(EmailResult::failed(None, e.to_string()));
            }
        };

        // Logged before any network call so a crash mid-send leaves a trace
        let log = match self
            .logs
            .create(NewEmailLog {
                to: message.to.clone(),
                subject: message.subject.clone(),
                template: template.to_string(),
                template_data: message.data.clone(),
                from: message.from.clone(),
                reply_to: message.reply_to.clone(),
                cc: message.cc.clone(),
                bcc: message.bcc.clone(),
                user_id: message.user_id.clone(),
            })
            .await
        {
            Ok(log) => log,
            Err(e) => {
                error!("Failed to create email log: {}", e);
                self.metrics.record_failed("log_write");
                return Ok(EmailResult::failed(
                    None,
                    format!("Failed to record email: {}", e),
                ));
            }
        };

        let outbound = message.outbound(&self.default_from);
        let result = self.dispatch(&outbound, &rendered, count).await;
        self.finalize(&log, &result).await;

        Ok(result.with_log(log.id))
    }

    /// Send a logged entry again without creating a new log entry
    ///
    /// Used by the retry sweep. The caller owns the log bookkeeping.
    pub async fn redeliver(&self, log: &EmailLog) -> EmailResult {
        let template: TemplateId = match log.template.parse() {
            Ok(template) => template,
            Err(e) => return EmailResult::failed(None, e.to_string()),
        };

        let decision = self.gate(log.user_id.as_deref(), template).await;
        if !decision.allowed {
            self.metrics.record_blocked();
            return EmailResult::blocked();
        }

        let data = with_unsubscribe_url(&log.template_data, decision.unsubscribe_url);
        let rendered = match self.renderer.render(template, &data) {
            Ok(rendered) => rendered,
            Err(e) => {
                self.metrics.record_failed("render");
                return EmailResult::failed(None, e.to_string());
            }
        };

        let outbound = OutboundEmail {
            to: log.to.clone(),
            subject: log.subject.clone(),
            from: log.from.clone().unwrap_or_else(|| self.default_from.clone()),
            reply_to: log.reply_to.clone(),
            cc: log.cc.clone(),
            bcc: log.bcc.clone(),
            attachments: Vec::new(),
        };

        self.dispatch(&outbound, &rendered, 1).await.with_log(log.id)
    }

    /// Select a provider, send, and fall back once on failure
    async fn dispatch(
        &self,
        outbound: &OutboundEmail,
        rendered: &RenderedEmail,
        count: u64,
    ) -> EmailResult {
        let selection = match self.factory.select().await {
            Ok(selection) => selection,
            Err(Error::NoProviderAvailable) => {
                error!("No email provider available");
                self.metrics.record_failed("no_provider");
                return EmailResult::failed(None, Error::NoProviderAvailable.to_string());
            }
            Err(e) => {
                error!("Provider selection failed: {}", e);
                self.metrics.record_failed("selection");
                return EmailResult::failed(None, format!("Provider selection failed: {}", e));
            }
        };

        let primary = selection.provider;
        debug!(
            provider = %primary.id(),
            reason = selection.reason.as_str(),
            "Selected email provider"
        );

        let first = primary.send_email(outbound, rendered).await;
        if first.success {
            self.record_success(primary.as_ref(), count).await;
            return first;
        }

        warn!(
            provider = %primary.id(),
            "Send failed: {}",
            first.error.as_deref().unwrap_or("unknown error")
        );

        if self.auto_fallback {
            if let Some(alternate) = self.factory.fallback_for(primary.id()).await {
                self.metrics.record_fallback();
                info!(from = %primary.id(), to = %alternate.id(), "Falling back to alternate provider");

                let second = alternate.send_email(outbound, rendered).await;
                if second.success {
                    self.record_success(alternate.as_ref(), count).await;
                    return second;
                }

                let combined = Error::AllProvidersFailed(format!(
                    "{}: {}; {}: {}",
                    primary.id(),
                    first.error.as_deref().unwrap_or("unknown error"),
                    alternate.id(),
                    second.error.as_deref().unwrap_or("unknown error"),
                ));
                error!("{}", combined);
                self.metrics.record_failed("all_providers_failed");
                return EmailResult::failed(Some(alternate.id()), combined.to_string());
            }
        }

        self.metrics.record_failed("provider_error");
        first
    }

    async fn record_success(&self, provider: &dyn EmailProvider, count: u64) {
        let id = provider.id();
        self.metrics.record_sent(id);

        // The message is already out; a counter failure only skews selection
        match self.factory.counters().increment_counter(id, count).await {
            Ok(counter) => self.metrics.set_sent_today(id, counter.count(id)),
            Err(e) => warn!(provider = %id, "Failed to increment daily counter: {}", e),
        }
    }

    async fn finalize(&self, log: &EmailLog, result: &EmailResult) {
        let outcome = match (result.success, result.provider) {
            (true, Some(provider)) => {
                self.logs
                    .mark_sent(log.id, provider, result.message_id.clone())
                    .await
            }
            _ => {
                self.logs
                    .mark_failed(
                        log.id,
                        result.provider,
                        result.error.as_deref().unwrap_or("unknown error"),
                    )
                    .await
            }
        };

        if let Err(e) = outcome {
            warn!(log_id = %log.id, "Failed to update email log: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::DailyCounterStore;
    use crate::providers::MockProvider;
    use crate::templates::MiniJinjaRenderer;
    use courier_common::types::ProviderId;
    use courier_storage::{
        EmailStatus, InMemoryCache, InMemoryEmailLogRepository, InMemoryPreferenceRepository,
        PreferenceUpdate,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Harness {
        service: EmailService,
        resend: Arc<MockProvider>,
        mailjet: Arc<MockProvider>,
        logs: Arc<InMemoryEmailLogRepository>,
        counters: Arc<DailyCounterStore>,
    }

    fn harness(auto_fallback: bool) -> Harness {
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
            counters.clone(),
            ProviderId::Resend,
        ));
        let logs = Arc::new(InMemoryEmailLogRepository::new());
        let preferences = Arc::new(PreferenceService::new(
            Arc::new(InMemoryPreferenceRepository::new()),
            "secret",
            "https://courier.example.com/email/unsubscribe",
        ));
        let config = EmailConfig {
            auto_fallback,
            bulk_delay_ms: 100,
            ..EmailConfig::default()
        };

        let service = EmailService::new(
            factory,
            Arc::new(MiniJinjaRenderer::new().unwrap()),
            logs.clone(),
            preferences,
            Arc::new(EmailMetrics::new().unwrap()),
            &config,
        );

        Harness {
            service,
            resend,
            mailjet,
            logs,
            counters,
        }
    }

    fn welcome(to: &str) -> EmailMessage {
        EmailMessage {
            to: vec![to.to_string()],
            subject: "Welcome!".to_string(),
            template: "welcome".to_string(),
            data: json!({ "name": "Ada" }),
            ..Default::default()
        }
    }

    #[test]
    fn test_to_accepts_single_address() {
        let message: EmailMessage = serde_json::from_value(json!({
            "to": "user@example.com",
            "subject": "Hi",
            "template": "welcome"
        }))
        .unwrap();
        assert_eq!(message.to, vec!["user@example.com".to_string()]);
        assert_eq!(message.data, Value::Null);

        let message: EmailMessage = serde_json::from_value(json!({
            "to": ["a@example.com", "b@example.com"],
            "subject": "Hi",
            "template": "welcome"
        }))
        .unwrap();
        assert_eq!(message.to.len(), 2);
    }

    #[test]
    fn test_validation_rules() {
        assert!(welcome("user@example.com").validate().is_ok());

        let mut message = welcome("user@example.com");
        message.to.clear();
        assert!(matches!(message.validate(), Err(Error::Validation(_))));

        let mut message = welcome("user@example.com");
        message.subject = "  ".to_string();
        assert!(matches!(message.validate(), Err(Error::Validation(_))));

        let mut message = welcome("not-an-address");
        message.subject = "Hi".to_string();
        assert!(matches!(message.validate(), Err(Error::Validation(_))));

        let mut message = welcome("user@example.com");
        message.template = "no-such-template".to_string();
        assert!(matches!(message.validate(), Err(Error::Template(_))));

        let mut message = welcome("user@example.com");
        message.attachments.push(Attachment {
            filename: "a.txt".to_string(),
            content: "%%%".to_string(),
            content_type: None,
        });
        assert!(matches!(message.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_unsubscribe_url_injection() {
        let data = with_unsubscribe_url(&Value::Null, Some("https://u/t".to_string()));
        assert_eq!(data, json!({ "unsubscribe_url": "https://u/t" }));

        let data = with_unsubscribe_url(
            &json!({ "unsubscribe_url": "custom" }),
            Some("https://u/t".to_string()),
        );
        assert_eq!(data, json!({ "unsubscribe_url": "custom" }));
    }

    #[tokio::test]
    async fn test_send_through_preferred_provider() {
        let h = harness(true);
        let result = h.service.send_email(welcome("user@example.com")).await.unwrap();

        assert!(result.success);
        assert_eq!(result.provider, Some(ProviderId::Resend));
        assert_eq!(h.resend.sent_count().await, 1);
        assert_eq!(h.mailjet.sent_count().await, 0);
        assert_eq!(
            h.counters.get_provider_count(ProviderId::Resend).await.unwrap(),
            1
        );

        let log = h.logs.get(result.log_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(log.status, EmailStatus::Sent);
        assert_eq!(log.provider, Some(ProviderId::Resend));
        assert_eq!(log.provider_message_id.as_deref(), Some("resend-1"));
        assert!(log.sent_at.is_some());
    }

    #[tokio::test]
    async fn test_falls_back_when_primary_fails() {
        let h = harness(true);
        h.resend.fail_with(Some("Resend API error (500): boom")).await;

        let result = h.service.send_email(welcome("user@example.com")).await.unwrap();
        assert!(result.success);
        assert_eq!(result.provider, Some(ProviderId::Mailjet));
        assert_eq!(
            h.counters.get_provider_count(ProviderId::Mailjet).await.unwrap(),
            1
        );
        assert_eq!(
            h.counters.get_provider_count(ProviderId::Resend).await.unwrap(),
            0
        );

        let log = h.logs.get(result.log_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(log.status, EmailStatus::Sent);
        assert_eq!(log.metadata["provider"], json!("mailjet"));

        let metrics = h.service.metrics().render().unwrap();
        assert!(metrics.contains("courier_provider_fallbacks_total 1"));
    }

    #[tokio::test]
    async fn test_both_providers_failing_is_logged_for_retry() {
        let h = harness(true);
        h.resend.fail_with(Some("timeout")).await;
        h.mailjet.fail_with(Some("Mailjet API error (401): bad key")).await;

        let result = h.service.send_email(welcome("user@example.com")).await.unwrap();
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("All providers failed: resend: timeout; mailjet: Mailjet API error (401): bad key")
        );

        let log = h.logs.get(result.log_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(log.status, EmailStatus::Failed);
        assert_eq!(log.retry_count, 0);
        assert_eq!(log.next_retry_at, None);
        assert_eq!(h.counters.get_daily_counter().await.unwrap().total_count, 0);
    }

    #[tokio::test]
    async fn test_no_fallback_when_disabled() {
        let h = harness(false);
        h.resend.fail_with(Some("timeout")).await;

        let result = h.service.send_email(welcome("user@example.com")).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("timeout"));
        assert_eq!(h.mailjet.sent_count().await, 0);
    }

    #[tokio::test]
    async fn test_no_provider_available() {
        let h = harness(true);
        h.resend.set_healthy(false);
        h.mailjet.set_healthy(false);

        let result = h.service.send_email(welcome("user@example.com")).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.provider, None);

        let log = h.logs.get(result.log_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(log.status, EmailStatus::Failed);
    }

    #[tokio::test]
    async fn test_blocked_by_preferences_skips_logging() {
        let h = harness(true);
        h.service
            .preferences()
            .update(
                "u1",
                "user@example.com",
                &PreferenceUpdate {
                    marketing_emails: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mut message = welcome("user@example.com");
        message.template = "newsletter".to_string();
        message.user_id = Some("u1".to_string());

        let result = h.service.send_email(message).await.unwrap();
        assert!(!result.success);
        assert!(result.blocked);
        assert_eq!(result.log_id, None);
        assert_eq!(h.resend.sent_count().await, 0);

        let page = h
            .logs
            .list(&Default::default(), 1, 20)
            .await
            .unwrap();
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn test_invalid_request_is_an_error() {
        let h = harness(true);
        let err = h.service.send_email(welcome("nope")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(h.resend.sent_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_continues_past_failures() {
        let h = harness(true);
        let mut to_two = welcome("a@example.com");
        to_two.to.push("b@example.com".to_string());

        let start = tokio::time::Instant::now();
        let results = h
            .service
            .send_bulk_emails(vec![to_two, welcome("invalid"), welcome("c@example.com")])
            .await;

        assert_eq!(results.len(), 3);
        assert!(results[0].success);
        assert!(!results[1].success);
        assert!(results[2].success);
        assert!(start.elapsed() >= Duration::from_millis(200));

        // Counted per recipient
        assert_eq!(
            h.counters.get_provider_count(ProviderId::Resend).await.unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn test_redeliver_reuses_log_entry() {
        let h = harness(true);
        h.resend.fail_with(Some("down")).await;
        h.mailjet.fail_with(Some("down")).await;
        let failed = h.service.send_email(welcome("user@example.com")).await.unwrap();
        let log = h.logs.get(failed.log_id.unwrap()).await.unwrap().unwrap();

        h.mailjet.fail_with(None).await;
        let result = h.service.redeliver(&log).await;
        assert!(result.success);
        assert_eq!(result.provider, Some(ProviderId::Mailjet));
        assert_eq!(result.log_id, Some(log.id));
        assert_eq!(h.logs.list(&Default::default(), 1, 20).await.unwrap().total, 1);
    }

    #[test]
    fn test_preview_unknown_template() {
        let h = harness(true);
        assert!(matches!(
            h.service.preview("missing", &json!({})),
            Err(Error::Template(_))
        ));
        let rendered = h.service.preview("welcome", &json!({ "name": "Ada" })).unwrap();
        assert!(rendered.html.contains("Ada"));
    }
}
