//! Email provider abstraction and vendor adapters

pub mod mailjet;
pub mod mock;
pub mod resend;

pub use mailjet::MailjetProvider;
pub use mock::MockProvider;
pub use resend::ResendProvider;

use crate::templates::RenderedEmail;
use async_trait::async_trait;
use courier_common::config::ProviderConfig;
use courier_common::types::{EmailLogId, ProviderId};
use courier_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Base64-encoded attachment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    /// Base64 content
    pub content: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// Fully addressed message handed to a provider
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEmail {
    pub to: Vec<String>,
    pub subject: String,
    /// `"Display Name <email>"` or a bare address
    pub from: String,
    pub reply_to: Option<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub attachments: Vec<Attachment>,
}

/// Outcome of one send
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmailResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Provider that succeeded or was last attempted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderId>,
    /// Suppressed by recipient preferences
    #[serde(default)]
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_id: Option<EmailLogId>,
}

impl EmailResult {
    pub fn sent(provider: ProviderId, message_id: Option<String>) -> Self {
        Self {
            success: true,
            message_id,
            provider: Some(provider),
            ..Default::default()
        }
    }

    pub fn failed(provider: Option<ProviderId>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            provider,
            ..Default::default()
        }
    }

    pub fn blocked() -> Self {
        Self {
            success: false,
            error: Some("blocked by preference".to_string()),
            blocked: true,
            ..Default::default()
        }
    }

    pub fn with_log(mut self, log_id: EmailLogId) -> Self {
        self.log_id = Some(log_id);
        self
    }
}

/// Uniform contract over vendor APIs
///
/// Adapters perform exactly one network attempt per message and report
/// failures through `EmailResult` instead of returning errors. They never
/// touch counters or logs.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    fn id(&self) -> ProviderId;

    /// Validate credentials and mark the adapter ready; idempotent
    async fn initialize(&self) -> Result<()>;

    fn is_initialized(&self) -> bool;

    async fn send_email(&self, message: &OutboundEmail, content: &RenderedEmail) -> EmailResult;

    /// One result per input, same order
    async fn send_bulk_emails(&self, batch: &[(OutboundEmail, RenderedEmail)]) -> Vec<EmailResult> {
        let mut results = Vec::with_capacity(batch.len());
        for (message, content) in batch {
            results.push(self.send_email(message, content).await);
        }
        results
    }

    /// Cheap liveness check
    async fn is_healthy(&self) -> bool;

    /// Static configuration echo
    fn metadata(&self) -> ProviderConfig;
}

/// HTTP client shared by the vendor adapters
pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_email_result_shapes() {
        let sent = EmailResult::sent(ProviderId::Resend, Some("abc".into()));
        assert!(sent.success);
        assert_eq!(
            serde_json::to_value(&sent).unwrap(),
            serde_json::json!({"success": true, "message_id": "abc", "provider": "resend", "blocked": false})
        );

        let blocked = EmailResult::blocked();
        assert!(!blocked.success);
        assert!(blocked.blocked);
        assert_eq!(blocked.error.as_deref(), Some("blocked by preference"));
    }
}
