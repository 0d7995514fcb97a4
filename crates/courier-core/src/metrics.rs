//! Prometheus metrics for email delivery

use courier_common::types::ProviderId;
use courier_common::{Error, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

/// Delivery metrics with their own registry
#[derive(Clone)]
pub struct EmailMetrics {
    registry: Registry,
    sent: IntCounterVec,
    failed: IntCounterVec,
    fallbacks: IntCounter,
    blocked: IntCounter,
    sent_today: IntGaugeVec,
}

fn metric_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("Metrics registration failed: {}", e))
}

impl EmailMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let sent = IntCounterVec::new(
            Opts::new("courier_emails_sent_total", "Emails accepted by a provider"),
            &["provider"],
        )
        .map_err(metric_error)?;
        let failed = IntCounterVec::new(
            Opts::new("courier_emails_failed_total", "Emails that could not be delivered"),
            &["reason"],
        )
        .map_err(metric_error)?;
        let fallbacks = IntCounter::new(
            "courier_provider_fallbacks_total",
            "Sends retried through the alternate provider",
        )
        .map_err(metric_error)?;
        let blocked = IntCounter::new(
            "courier_preference_blocked_total",
            "Sends suppressed by recipient preferences",
        )
        .map_err(metric_error)?;
        let sent_today = IntGaugeVec::new(
            Opts::new("courier_provider_sent_today", "Sends counted today per provider"),
            &["provider"],
        )
        .map_err(metric_error)?;

        registry.register(Box::new(sent.clone())).map_err(metric_error)?;
        registry.register(Box::new(failed.clone())).map_err(metric_error)?;
        registry.register(Box::new(fallbacks.clone())).map_err(metric_error)?;
        registry.register(Box::new(blocked.clone())).map_err(metric_error)?;
        registry.register(Box::new(sent_today.clone())).map_err(metric_error)?;

        Ok(Self {
            registry,
            sent,
            failed,
            fallbacks,
            blocked,
            sent_today,
        })
    }

    pub fn record_sent(&self, provider: ProviderId) {
        self.sent.with_label_values(&[provider.as_str()]).inc();
    }

    pub fn record_failed(&self, reason: &str) {
        self.failed.with_label_values(&[reason]).inc();
    }

    pub fn record_fallback(&self) {
        self.fallbacks.inc();
    }

    pub fn record_blocked(&self) {
        self.blocked.inc();
    }

    pub fn set_sent_today(&self, provider: ProviderId, count: u64) {
        self.sent_today
            .with_label_values(&[provider.as_str()])
            .set(count as i64);
    }

    /// Text exposition format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_recorded_series() {
        let metrics = EmailMetrics::new().unwrap();
        metrics.record_sent(ProviderId::Mailjet);
        metrics.record_failed("all_providers_failed");
        metrics.record_fallback();
        metrics.set_sent_today(ProviderId::Mailjet, 12);

        let text = metrics.render().unwrap();
        assert!(text.contains("courier_emails_sent_total{provider=\"mailjet\"} 1"));
        assert!(text.contains("courier_emails_failed_total{reason=\"all_providers_failed\"} 1"));
        assert!(text.contains("courier_provider_fallbacks_total 1"));
        assert!(text.contains("courier_provider_sent_today{provider=\"mailjet\"} 12"));
    }
}
