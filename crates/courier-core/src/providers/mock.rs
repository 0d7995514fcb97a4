//! Mock email provider for testing

use super::{EmailProvider, EmailResult, OutboundEmail};
use crate::templates::RenderedEmail;
use async_trait::async_trait;
use courier_common::config::ProviderConfig;
use courier_common::types::ProviderId;
use courier_common::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// Scriptable provider that captures sent emails
pub struct MockProvider {
    id: ProviderId,
    config: ProviderConfig,
    initialized: AtomicBool,
    healthy: AtomicBool,
    failure: Mutex<Option<String>>,
    sent: Mutex<Vec<OutboundEmail>>,
}

impl MockProvider {
    /// Create a healthy, initialized mock
    pub fn new(id: ProviderId, daily_limit: u32, fallback_threshold: f64) -> Self {
        Self {
            id,
            config: ProviderConfig {
                enabled: true,
                daily_limit,
                fallback_threshold,
            },
            initialized: AtomicBool::new(true),
            healthy: AtomicBool::new(true),
            failure: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Mark the provider disabled in its configuration
    pub fn disabled(mut self) -> Self {
        self.config.enabled = false;
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Make every following send fail with `message` (`None` to recover)
    pub async fn fail_with(&self, message: Option<&str>) {
        *self.failure.lock().await = message.map(String::from);
    }

    /// Get all sent emails
    pub async fn sent_emails(&self) -> Vec<OutboundEmail> {
        self.sent.lock().await.clone()
    }

    /// Get the count of sent emails
    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }
}

#[async_trait]
impl EmailProvider for MockProvider {
    fn id(&self) -> ProviderId {
        self.id
    }

    async fn initialize(&self) -> Result<()> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    async fn send_email(&self, message: &OutboundEmail, _content: &RenderedEmail) -> EmailResult {
        if let Some(error) = self.failure.lock().await.clone() {
            return EmailResult::failed(Some(self.id), error);
        }

        let mut sent = self.sent.lock().await;
        sent.push(message.clone());
        EmailResult::sent(self.id, Some(format!("{}-{}", self.id, sent.len())))
    }

    async fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn metadata(&self) -> ProviderConfig {
        self.config
    }
}
