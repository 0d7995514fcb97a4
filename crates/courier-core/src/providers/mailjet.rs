//! Mailjet provider
//!
//! Sends emails via the Mailjet Send API v3.1 (`POST /v3.1/send`), batching
//! bulk sends natively.

use super::{http_client, EmailProvider, EmailResult, OutboundEmail};
use crate::templates::RenderedEmail;
use async_trait::async_trait;
use courier_common::config::{MailjetConfig, ProviderConfig};
use courier_common::types::{Mailbox, ProviderId};
use courier_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Messages per Send API request
pub const MAX_BATCH: usize = 50;

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SendRequest {
    messages: Vec<MailjetMessage>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct MailjetMessage {
    from: MailjetAddress,
    to: Vec<MailjetAddress>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    cc: Vec<MailjetAddress>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    bcc: Vec<MailjetAddress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<MailjetAddress>,
    subject: String,
    #[serde(rename = "HTMLPart")]
    html_part: String,
    #[serde(rename = "TextPart", skip_serializing_if = "Option::is_none")]
    text_part: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<MailjetAttachment>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct MailjetAddress {
    email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

impl MailjetAddress {
    fn parse(raw: &str) -> std::result::Result<Self, String> {
        let mailbox = Mailbox::parse(raw).ok_or_else(|| format!("Invalid address: {}", raw))?;
        Ok(Self {
            email: mailbox.email,
            name: mailbox.name,
        })
    }

    fn parse_all(raw: &[String]) -> std::result::Result<Vec<Self>, String> {
        raw.iter().map(|r| Self::parse(r)).collect()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct MailjetAttachment {
    filename: String,
    content_type: String,
    base64_content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendResponse {
    #[serde(default)]
    messages: Vec<MessageResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MessageResult {
    status: String,
    #[serde(default)]
    to: Vec<RecipientResult>,
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct RecipientResult {
    #[serde(rename = "MessageID")]
    message_id: Option<serde_json::Value>,
    #[serde(rename = "MessageUUID")]
    message_uuid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(rename = "ErrorMessage")]
    error_message: String,
}

impl MessageResult {
    fn into_result(self) -> EmailResult {
        if self.status.eq_ignore_ascii_case("success") {
            let message_id = self.to.into_iter().next().and_then(|r| {
                let id = match r.message_id {
                    Some(serde_json::Value::String(s)) => Some(s),
                    Some(serde_json::Value::Number(n)) => Some(n.to_string()),
                    _ => None,
                };
                id.or(r.message_uuid)
            });
            return EmailResult::sent(ProviderId::Mailjet, message_id);
        }

        let detail = if self.errors.is_empty() {
            format!("status {}", self.status)
        } else {
            self.errors
                .into_iter()
                .map(|e| e.error_message)
                .collect::<Vec<_>>()
                .join("; ")
        };
        EmailResult::failed(
            Some(ProviderId::Mailjet),
            format!("Mailjet rejected message: {}", detail),
        )
    }
}

/// Mailjet email provider
pub struct MailjetProvider {
    config: MailjetConfig,
    client: reqwest::Client,
    ready: AtomicBool,
}

impl MailjetProvider {
    pub fn new(config: MailjetConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            config,
            client: http_client(timeout)?,
            ready: AtomicBool::new(false),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v3.1/send", self.config.base_url.trim_end_matches('/'))
    }

    fn build_message(
        message: &OutboundEmail,
        content: &RenderedEmail,
    ) -> std::result::Result<MailjetMessage, String> {
        Ok(MailjetMessage {
            from: MailjetAddress::parse(&message.from)
                .map_err(|_| format!("Invalid sender address: {}", message.from))?,
            to: MailjetAddress::parse_all(&message.to)?,
            cc: MailjetAddress::parse_all(&message.cc)?,
            bcc: MailjetAddress::parse_all(&message.bcc)?,
            reply_to: message
                .reply_to
                .as_deref()
                .map(MailjetAddress::parse)
                .transpose()?,
            subject: message.subject.clone(),
            html_part: content.html.clone(),
            text_part: content.text.clone(),
            attachments: message
                .attachments
                .iter()
                .map(|a| MailjetAttachment {
                    filename: a.filename.clone(),
                    content_type: a
                        .content_type
                        .clone()
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                    base64_content: a.content.clone(),
                })
                .collect(),
        })
    }

    /// One request for up to `MAX_BATCH` messages
    async fn send_chunk(&self, chunk: &[(OutboundEmail, RenderedEmail)]) -> Vec<EmailResult> {
        if !self.is_initialized() {
            return chunk
                .iter()
                .map(|_| {
                    EmailResult::failed(
                        Some(ProviderId::Mailjet),
                        "Mailjet provider is not initialized",
                    )
                })
                .collect();
        }

        // Messages that fail local validation never reach the API
        let mut results: Vec<Option<EmailResult>> = vec![None; chunk.len()];
        let mut positions = Vec::new();
        let mut messages = Vec::new();
        for (i, (message, content)) in chunk.iter().enumerate() {
            match Self::build_message(message, content) {
                Ok(m) => {
                    positions.push(i);
                    messages.push(m);
                }
                Err(e) => results[i] = Some(EmailResult::failed(Some(ProviderId::Mailjet), e)),
            }
        }

        if !messages.is_empty() {
            let outcomes = self.post(SendRequest { messages }, positions.len()).await;
            for (i, outcome) in positions.into_iter().zip(outcomes) {
                results[i] = Some(outcome);
            }
        }

        results
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|| {
                    EmailResult::failed(Some(ProviderId::Mailjet), "Missing Mailjet result")
                })
            })
            .collect()
    }

    async fn post(&self, request: SendRequest, expected: usize) -> Vec<EmailResult> {
        let fail_all = |error: String| {
            warn!(error = %error, count = expected, "Mailjet send failed");
            (0..expected)
                .map(|_| EmailResult::failed(Some(ProviderId::Mailjet), error.clone()))
                .collect::<Vec<_>>()
        };

        let response = match self
            .client
            .post(self.endpoint())
            .basic_auth(&self.config.api_key, Some(&self.config.api_secret))
            .json(&request)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return fail_all(format!("Mailjet request failed: {}", e)),
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        // Mailjet reports per-message outcomes on both 2xx and 400 responses
        if let Ok(parsed) = serde_json::from_str::<SendResponse>(&body) {
            if parsed.messages.len() == expected {
                let results: Vec<EmailResult> =
                    parsed.messages.into_iter().map(MessageResult::into_result).collect();
                for result in results.iter().filter(|r| !r.success) {
                    warn!(error = ?result.error, "Mailjet rejected message");
                }
                debug!(
                    accepted = results.iter().filter(|r| r.success).count(),
                    total = expected,
                    "Mailjet batch sent"
                );
                return results;
            }
        }

        if status.is_success() {
            return fail_all(format!(
                "Unexpected Mailjet response: expected {} message results",
                expected
            ));
        }

        let detail = serde_json::from_str::<ErrorDetail>(&body)
            .map(|e| e.error_message)
            .unwrap_or(body);
        fail_all(format!("Mailjet API error ({}): {}", status.as_u16(), detail))
    }
}

#[async_trait]
impl EmailProvider for MailjetProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Mailjet
    }

    async fn initialize(&self) -> Result<()> {
        if self.config.api_key.trim().is_empty() || self.config.api_secret.trim().is_empty() {
            self.ready.store(false, Ordering::SeqCst);
            return Err(Error::Config(
                "Mailjet API key and secret must be configured".to_string(),
            ));
        }

        if !self.ready.swap(true, Ordering::SeqCst) {
            info!("Mailjet provider initialized");
        }
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn send_email(&self, message: &OutboundEmail, content: &RenderedEmail) -> EmailResult {
        let batch = [(message.clone(), content.clone())];
        self.send_chunk(&batch)
            .await
            .pop()
            .unwrap_or_else(|| EmailResult::failed(Some(ProviderId::Mailjet), "Missing Mailjet result"))
    }

    async fn send_bulk_emails(&self, batch: &[(OutboundEmail, RenderedEmail)]) -> Vec<EmailResult> {
        let mut results = Vec::with_capacity(batch.len());
        for chunk in batch.chunks(MAX_BATCH) {
            results.extend(self.send_chunk(chunk).await);
        }
        results
    }

    async fn is_healthy(&self) -> bool {
        self.config.enabled
            && self.is_initialized()
            && !self.config.api_key.is_empty()
            && !self.config.api_secret.is_empty()
    }

    fn metadata(&self) -> ProviderConfig {
        self.config.limits()
    }
}
