//! Resend provider
//!
//! Sends emails via the Resend HTTP API (`POST /emails`).

use super::{http_client, Attachment, EmailProvider, EmailResult, OutboundEmail};
use crate::templates::RenderedEmail;
use async_trait::async_trait;
use courier_common::config::{ProviderConfig, ResendConfig};
use courier_common::types::{Mailbox, ProviderId};
use courier_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Resend API request payload
#[derive(Debug, Serialize)]
struct ResendRequest<'a> {
    from: String,
    to: &'a [String],
    subject: &'a str,
    html: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    cc: &'a [String],
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    bcc: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<ResendAttachment<'a>>,
}

#[derive(Debug, Serialize)]
struct ResendAttachment<'a> {
    filename: &'a str,
    content: &'a str,
}

impl<'a> From<&'a Attachment> for ResendAttachment<'a> {
    fn from(a: &'a Attachment) -> Self {
        Self {
            filename: &a.filename,
            content: &a.content,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResendResponse {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResendError {
    message: String,
}

/// Resend email provider
pub struct ResendProvider {
    config: ResendConfig,
    client: reqwest::Client,
    ready: AtomicBool,
}

impl ResendProvider {
    pub fn new(config: ResendConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            config,
            client: http_client(timeout)?,
            ready: AtomicBool::new(false),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/emails", self.config.base_url.trim_end_matches('/'))
    }

    async fn deliver(
        &self,
        message: &OutboundEmail,
        content: &RenderedEmail,
    ) -> std::result::Result<Option<String>, String> {
        if !self.is_initialized() {
            return Err("Resend provider is not initialized".to_string());
        }

        let from = Mailbox::parse(&message.from)
            .ok_or_else(|| format!("Invalid sender address: {}", message.from))?;

        let payload = ResendRequest {
            from: from.to_string(),
            to: &message.to,
            subject: &message.subject,
            html: &content.html,
            text: content.text.as_deref(),
            cc: &message.cc,
            bcc: &message.bcc,
            reply_to: message.reply_to.as_deref(),
            attachments: message.attachments.iter().map(ResendAttachment::from).collect(),
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| format!("Resend request failed: {}", e))?;

        let status = response.status();
        if status.is_success() {
            let body: ResendResponse = response
                .json()
                .await
                .map_err(|e| format!("Invalid Resend response: {}", e))?;
            return Ok(body.id);
        }

        let text = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ResendError>(&text)
            .map(|e| e.message)
            .unwrap_or(text);
        Err(format!("Resend API error ({}): {}", status.as_u16(), detail))
    }
}

#[async_trait]
impl EmailProvider for ResendProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Resend
    }

    async fn initialize(&self) -> Result<()> {
        if self.config.api_key.trim().is_empty() {
            self.ready.store(false, Ordering::SeqCst);
            return Err(Error::Config("Resend API key is not configured".to_string()));
        }

        if !self.ready.swap(true, Ordering::SeqCst) {
            info!("Resend provider initialized");
        }
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn send_email(&self, message: &OutboundEmail, content: &RenderedEmail) -> EmailResult {
        match self.deliver(message, content).await {
            Ok(message_id) => {
                debug!(to = ?message.to, message_id = ?message_id, "Resend accepted email");
                EmailResult::sent(ProviderId::Resend, message_id)
            }
            Err(error) => {
                warn!(to = ?message.to, error = %error, "Resend send failed");
                EmailResult::failed(Some(ProviderId::Resend), error)
            }
        }
    }

    async fn is_healthy(&self) -> bool {
        self.config.enabled && self.is_initialized() && !self.config.api_key.is_empty()
    }

    fn metadata(&self) -> ProviderConfig {
        self.config.limits()
    }
}
