//! Common types for Courier

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a recipient in the surrounding platform (opaque)
pub type UserId = String;

/// Unique identifier for email log entries
pub type EmailLogId = Uuid;

/// Unique identifier for preference records
pub type PreferenceId = Uuid;

/// Transactional email vendor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Resend,
    Mailjet,
}

impl ProviderId {
    /// All providers in declaration order (used for tie-breaking)
    pub const ALL: [ProviderId; 2] = [ProviderId::Resend, ProviderId::Mailjet];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Resend => "resend",
            ProviderId::Mailjet => "mailjet",
        }
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderId {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "resend" => Ok(ProviderId::Resend),
            "mailjet" => Ok(ProviderId::Mailjet),
            other => Err(crate::Error::Validation(format!(
                "Unknown email provider: {}",
                other
            ))),
        }
    }
}

/// Caller role attached to an API key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Partner,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Partner => "partner",
            Role::User => "user",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "partner" => Ok(Role::Partner),
            "user" => Ok(Role::User),
            other => Err(crate::Error::Validation(format!("Unknown role: {}", other))),
        }
    }
}

/// Email category a recipient can opt out of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EmailCategory {
    OrderUpdates,
    SubscriptionNotifications,
    MarketingEmails,
    SecurityAlerts,
    PartnerNotifications,
    PaymentNotifications,
    SystemNotifications,
}

impl EmailCategory {
    pub const ALL: [EmailCategory; 7] = [
        EmailCategory::OrderUpdates,
        EmailCategory::SubscriptionNotifications,
        EmailCategory::MarketingEmails,
        EmailCategory::SecurityAlerts,
        EmailCategory::PartnerNotifications,
        EmailCategory::PaymentNotifications,
        EmailCategory::SystemNotifications,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmailCategory::OrderUpdates => "orderUpdates",
            EmailCategory::SubscriptionNotifications => "subscriptionNotifications",
            EmailCategory::MarketingEmails => "marketingEmails",
            EmailCategory::SecurityAlerts => "securityAlerts",
            EmailCategory::PartnerNotifications => "partnerNotifications",
            EmailCategory::PaymentNotifications => "paymentNotifications",
            EmailCategory::SystemNotifications => "systemNotifications",
        }
    }
}

impl std::fmt::Display for EmailCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EmailCategory {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EmailCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| crate::Error::Validation(format!("Unknown email category: {}", s)))
    }
}

/// Mailbox: an address with an optional display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailbox {
    pub name: Option<String>,
    pub email: String,
}

impl Mailbox {
    /// Create a mailbox from an address only
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    /// Parse `"Display Name <email@domain>"` or a bare address
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();

        let (name, email) = match (s.rfind('<'), s.ends_with('>')) {
            (Some(open), true) => {
                let name = s[..open].trim().trim_matches('"').trim();
                let email = s[open + 1..s.len() - 1].trim();
                let name = if name.is_empty() {
                    None
                } else {
                    Some(name.to_string())
                };
                (name, email)
            }
            _ => (None, s),
        };

        if !is_valid_email(email) {
            return None;
        }

        Some(Self {
            name,
            email: email.to_string(),
        })
    }
}

impl std::fmt::Display for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} <{}>", name, self.email),
            None => f.write_str(&self.email),
        }
    }
}

impl std::str::FromStr for Mailbox {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| crate::Error::Validation(format!("Invalid email address: {}", s)))
    }
}

/// Validate email address format
pub fn is_valid_email(email: &str) -> bool {
    let mut parts = email.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) => {
            !local.is_empty()
                && !domain.is_empty()
                && !email.chars().any(char::is_whitespace)
        }
        _ => false,
    }
}

/// Paginated response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub data: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
}

impl<T> Paginated<T> {
    pub fn total_pages(&self) -> i64 {
        if self.limit <= 0 {
            return 0;
        }
        (self.total + self.limit - 1) / self.limit
    }
}
