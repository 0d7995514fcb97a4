//! Persisted models

use chrono::{DateTime, NaiveDate, Utc};
use courier_common::types::{EmailCategory, EmailLogId, PreferenceId, ProviderId, UserId};
use courier_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;

/// Delivery status of an email log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
    Bounced,
}

impl EmailStatus {
    pub const ALL: [EmailStatus; 5] = [
        EmailStatus::Pending,
        EmailStatus::Sent,
        EmailStatus::Delivered,
        EmailStatus::Failed,
        EmailStatus::Bounced,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmailStatus::Pending => "pending",
            EmailStatus::Sent => "sent",
            EmailStatus::Delivered => "delivered",
            EmailStatus::Failed => "failed",
            EmailStatus::Bounced => "bounced",
        }
    }
}

impl std::fmt::Display for EmailStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EmailStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        EmailStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("Unknown email status: {}", s)))
    }
}

/// Email log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailLog {
    pub id: EmailLogId,
    pub to: Vec<String>,
    pub subject: String,
    pub template: String,
    pub template_data: serde_json::Value,
    pub from: Option<String>,
    pub reply_to: Option<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub status: EmailStatus,
    /// Provider that succeeded or was last attempted
    pub provider: Option<ProviderId>,
    pub provider_message_id: Option<String>,
    pub error_message: Option<String>,
    pub user_id: Option<UserId>,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmailLog {
    /// Build a pending entry from creation input
    pub fn pending(input: NewEmailLog) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::now_v7(),
            to: input.to,
            subject: input.subject,
            template: input.template,
            template_data: input.template_data,
            from: input.from,
            reply_to: input.reply_to,
            cc: input.cc,
            bcc: input.bcc,
            status: EmailStatus::Pending,
            provider: None,
            provider_message_id: None,
            error_message: None,
            user_id: input.user_id,
            retry_count: 0,
            next_retry_at: None,
            metadata: serde_json::json!({}),
            sent_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the retry sweep may pick this entry up at `now`
    pub fn is_retryable(&self, max_retries: i32, now: DateTime<Utc>) -> bool {
        self.status == EmailStatus::Failed
            && self.retry_count < max_retries
            && self.next_retry_at.map_or(true, |at| at <= now)
    }
}

/// Database row for `email_logs`
#[derive(Debug, Clone, FromRow)]
pub struct EmailLogRow {
    pub id: EmailLogId,
    pub to_addresses: serde_json::Value,
    pub subject: String,
    pub template: String,
    pub template_data: serde_json::Value,
    pub from_address: Option<String>,
    pub reply_to: Option<String>,
    pub cc_addresses: serde_json::Value,
    pub bcc_addresses: serde_json::Value,
    pub status: String,
    pub provider: Option<String>,
    pub provider_message_id: Option<String>,
    pub error_message: Option<String>,
    pub user_id: Option<String>,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<EmailLogRow> for EmailLog {
    type Error = Error;

    fn try_from(row: EmailLogRow) -> Result<Self> {
        let addresses = |value: serde_json::Value| -> Result<Vec<String>> {
            serde_json::from_value(value)
                .map_err(|e| Error::Database(format!("Malformed address list: {}", e)))
        };

        Ok(Self {
            id: row.id,
            to: addresses(row.to_addresses)?,
            subject: row.subject,
            template: row.template,
            template_data: row.template_data,
            from: row.from_address,
            reply_to: row.reply_to,
            cc: addresses(row.cc_addresses)?,
            bcc: addresses(row.bcc_addresses)?,
            status: row.status.parse()?,
            provider: row.provider.as_deref().map(str::parse).transpose()?,
            provider_message_id: row.provider_message_id,
            error_message: row.error_message,
            user_id: row.user_id,
            retry_count: row.retry_count,
            next_retry_at: row.next_retry_at,
            metadata: row.metadata,
            sent_at: row.sent_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Create email log input
#[derive(Debug, Clone, Default)]
pub struct NewEmailLog {
    pub to: Vec<String>,
    pub subject: String,
    pub template: String,
    pub template_data: serde_json::Value,
    pub from: Option<String>,
    pub reply_to: Option<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub user_id: Option<UserId>,
}

/// Filter for log queries
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmailLogFilter {
    pub status: Option<EmailStatus>,
    pub template: Option<String>,
    pub user_id: Option<UserId>,
}

impl EmailLogFilter {
    pub fn matches(&self, log: &EmailLog) -> bool {
        self.status.map_or(true, |s| log.status == s)
            && self.template.as_ref().map_or(true, |t| &log.template == t)
            && self
                .user_id
                .as_ref()
                .map_or(true, |u| log.user_id.as_ref() == Some(u))
    }
}

/// Count of emails on one UTC day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayCount {
    pub date: NaiveDate,
    pub count: i64,
}

/// Count of emails for one template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateCount {
    pub template: String,
    pub count: i64,
}

/// Count of emails for one recipient identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCount {
    pub user_id: UserId,
    pub count: i64,
}

/// Aggregate log statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailStats {
    pub total: i64,
    pub by_status: BTreeMap<String, i64>,
    pub by_template: Vec<TemplateCount>,
    pub by_day: Vec<DayCount>,
    pub top_users: Vec<UserCount>,
    /// Failed entries that reached the retry ceiling
    pub exhausted: i64,
}

/// Email preference record of one recipient identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailPreference {
    pub id: PreferenceId,
    pub user_id: UserId,
    pub email: String,
    pub order_updates: bool,
    pub subscription_notifications: bool,
    pub marketing_emails: bool,
    pub security_alerts: bool,
    pub partner_notifications: bool,
    pub payment_notifications: bool,
    pub system_notifications: bool,
    pub global_unsubscribe: bool,
    pub unsubscribed_categories: Vec<EmailCategory>,
    pub unsubscribe_token: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmailPreference {
    /// Default-open preferences
    pub fn new(user_id: UserId, email: String, unsubscribe_token: String) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4(),
            user_id,
            email,
            order_updates: true,
            subscription_notifications: true,
            marketing_emails: true,
            security_alerts: true,
            partner_notifications: true,
            payment_notifications: true,
            system_notifications: true,
            global_unsubscribe: false,
            unsubscribed_categories: Vec::new(),
            unsubscribe_token,
            created_at: now,
            updated_at: now,
        }
    }

    /// Flag for a category
    pub fn category(&self, category: EmailCategory) -> bool {
        match category {
            EmailCategory::OrderUpdates => self.order_updates,
            EmailCategory::SubscriptionNotifications => self.subscription_notifications,
            EmailCategory::MarketingEmails => self.marketing_emails,
            EmailCategory::SecurityAlerts => self.security_alerts,
            EmailCategory::PartnerNotifications => self.partner_notifications,
            EmailCategory::PaymentNotifications => self.payment_notifications,
            EmailCategory::SystemNotifications => self.system_notifications,
        }
    }

    /// Set a category flag, keeping `unsubscribed_categories` in sync
    pub fn set_category(&mut self, category: EmailCategory, enabled: bool) {
        let flag = match category {
            EmailCategory::OrderUpdates => &mut self.order_updates,
            EmailCategory::SubscriptionNotifications => &mut self.subscription_notifications,
            EmailCategory::MarketingEmails => &mut self.marketing_emails,
            EmailCategory::SecurityAlerts => &mut self.security_alerts,
            EmailCategory::PartnerNotifications => &mut self.partner_notifications,
            EmailCategory::PaymentNotifications => &mut self.payment_notifications,
            EmailCategory::SystemNotifications => &mut self.system_notifications,
        };
        *flag = enabled;

        self.unsubscribed_categories.retain(|c| *c != category);
        if !enabled {
            self.unsubscribed_categories.push(category);
        }
    }

    /// Apply a partial update
    pub fn apply(&mut self, update: &PreferenceUpdate) {
        for category in EmailCategory::ALL {
            if let Some(enabled) = update.get(category) {
                self.set_category(category, enabled);
            }
        }
        if let Some(global) = update.global_unsubscribe {
            self.global_unsubscribe = global;
        }
        self.updated_at = Utc::now();
    }
}

/// Database row for `email_preferences`
#[derive(Debug, Clone, FromRow)]
pub struct EmailPreferenceRow {
    pub id: PreferenceId,
    pub user_id: String,
    pub email: String,
    pub order_updates: bool,
    pub subscription_notifications: bool,
    pub marketing_emails: bool,
    pub security_alerts: bool,
    pub partner_notifications: bool,
    pub payment_notifications: bool,
    pub system_notifications: bool,
    pub global_unsubscribe: bool,
    pub unsubscribed_categories: serde_json::Value,
    pub unsubscribe_token: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<EmailPreferenceRow> for EmailPreference {
    type Error = Error;

    fn try_from(row: EmailPreferenceRow) -> Result<Self> {
        let unsubscribed_categories = serde_json::from_value(row.unsubscribed_categories)
            .map_err(|e| Error::Database(format!("Malformed category list: {}", e)))?;

        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            email: row.email,
            order_updates: row.order_updates,
            subscription_notifications: row.subscription_notifications,
            marketing_emails: row.marketing_emails,
            security_alerts: row.security_alerts,
            partner_notifications: row.partner_notifications,
            payment_notifications: row.payment_notifications,
            system_notifications: row.system_notifications,
            global_unsubscribe: row.global_unsubscribe,
            unsubscribed_categories,
            unsubscribe_token: row.unsubscribe_token,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Partial preference update
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreferenceUpdate {
    pub order_updates: Option<bool>,
    pub subscription_notifications: Option<bool>,
    pub marketing_emails: Option<bool>,
    pub security_alerts: Option<bool>,
    pub partner_notifications: Option<bool>,
    pub payment_notifications: Option<bool>,
    pub system_notifications: Option<bool>,
    pub global_unsubscribe: Option<bool>,
}

impl PreferenceUpdate {
    pub fn get(&self, category: EmailCategory) -> Option<bool> {
        match category {
            EmailCategory::OrderUpdates => self.order_updates,
            EmailCategory::SubscriptionNotifications => self.subscription_notifications,
            EmailCategory::MarketingEmails => self.marketing_emails,
            EmailCategory::SecurityAlerts => self.security_alerts,
            EmailCategory::PartnerNotifications => self.partner_notifications,
            EmailCategory::PaymentNotifications => self.payment_notifications,
            EmailCategory::SystemNotifications => self.system_notifications,
        }
    }
}

/// Per-provider, per-UTC-day send counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCounter {
    pub date: NaiveDate,
    pub per_provider: BTreeMap<ProviderId, u64>,
    pub total_count: u64,
    pub last_reset: DateTime<Utc>,
}

impl DailyCounter {
    /// Zeroed counter for a day
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            per_provider: ProviderId::ALL.into_iter().map(|p| (p, 0)).collect(),
            total_count: 0,
            last_reset: Utc::now(),
        }
    }

    /// Sends recorded for a provider
    pub fn count(&self, provider: ProviderId) -> u64 {
        self.per_provider.get(&provider).copied().unwrap_or(0)
    }

    /// Add to a provider's count and recompute the total
    pub fn increment(&mut self, provider: ProviderId, count: u64) {
        *self.per_provider.entry(provider).or_insert(0) += count;
        self.total_count = self.per_provider.values().sum();
    }

    /// Cache key of the counter for a day
    pub fn cache_key(date: NaiveDate) -> String {
        format!("email_counter:{}", date.format("%Y-%m-%d"))
    }
}
