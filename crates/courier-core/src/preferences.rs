//! Preference Gate and preference management

use crate::templates::TemplateId;
use courier_common::types::EmailCategory;
use courier_common::{Error, Result};
use courier_storage::{EmailPreference, PreferenceRepository, PreferenceUpdate};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{debug, info};

type HmacSha256 = Hmac<Sha256>;

/// Gate decision for one send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub allowed: bool,
    /// Present when the recipient has a preference record
    pub unsubscribe_url: Option<String>,
}

impl GateDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            unsubscribe_url: None,
        }
    }
}

/// Category opt-out enforcement and preference CRUD
pub struct PreferenceService {
    repo: Arc<dyn PreferenceRepository>,
    secret: String,
    unsubscribe_base_url: String,
}

impl PreferenceService {
    pub fn new(
        repo: Arc<dyn PreferenceRepository>,
        secret: impl Into<String>,
        unsubscribe_base_url: impl Into<String>,
    ) -> Self {
        Self {
            repo,
            secret: secret.into(),
            unsubscribe_base_url: unsubscribe_base_url.into(),
        }
    }

    /// Whether `user_id` accepts mail from `template`
    ///
    /// No user or no record allows; global unsubscribe blocks everything;
    /// unmapped templates are always allowed.
    pub async fn check_email_preferences(
        &self,
        user_id: Option<&str>,
        template: TemplateId,
    ) -> Result<bool> {
        Ok(self.evaluate(user_id, template).await?.allowed)
    }

    pub async fn evaluate(&self, user_id: Option<&str>, template: TemplateId) -> Result<GateDecision> {
        let Some(user_id) = user_id else {
            return Ok(GateDecision::allow());
        };
        let Some(pref) = self.repo.get_by_user(user_id).await? else {
            return Ok(GateDecision::allow());
        };

        let allowed = if pref.global_unsubscribe {
            false
        } else {
            template.category().map_or(true, |c| pref.category(c))
        };

        if !allowed {
            debug!(user_id, template = %template, "Blocked by email preferences");
        }

        Ok(GateDecision {
            allowed,
            unsubscribe_url: Some(self.unsubscribe_url(&pref.unsubscribe_token)),
        })
    }

    /// Fresh unsubscribe token: HMAC-SHA256 over the user and a random nonce
    pub fn generate_token(&self, user_id: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| Error::Internal(format!("Invalid unsubscribe secret: {}", e)))?;
        mac.update(user_id.as_bytes());
        mac.update(uuid::Uuid::new_v4().as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    pub fn unsubscribe_url(&self, token: &str) -> String {
        format!("{}/{}", self.unsubscribe_base_url.trim_end_matches('/'), token)
    }

    /// Preferences of a user, created with defaults when absent
    pub async fn get_or_create(&self, user_id: &str, email: &str) -> Result<EmailPreference> {
        if let Some(pref) = self.repo.get_by_user(user_id).await? {
            return Ok(pref);
        }

        let pref = EmailPreference::new(
            user_id.to_string(),
            email.to_string(),
            self.generate_token(user_id)?,
        );
        match self.repo.create(&pref).await {
            Ok(()) => {
                info!(user_id, "Created default email preferences");
                Ok(pref)
            }
            // Lost a creation race; use the winner's record
            Err(Error::Conflict(_)) => self
                .repo
                .get_by_user(user_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("Preferences for user {}", user_id))),
            Err(e) => Err(e),
        }
    }

    /// Partial update of the caller's own preferences
    pub async fn update(
        &self,
        user_id: &str,
        email: &str,
        update: &PreferenceUpdate,
    ) -> Result<EmailPreference> {
        let mut pref = self.get_or_create(user_id, email).await?;
        pref.apply(update);
        self.repo.save(&pref).await?;
        info!(user_id, "Updated email preferences");
        Ok(pref)
    }

    /// Administrative creation; `Conflict` when a record exists
    pub async fn create_for(
        &self,
        user_id: &str,
        email: &str,
        update: &PreferenceUpdate,
    ) -> Result<EmailPreference> {
        let mut pref = EmailPreference::new(
            user_id.to_string(),
            email.to_string(),
            self.generate_token(user_id)?,
        );
        pref.apply(update);
        self.repo.create(&pref).await?;
        info!(user_id, "Created email preferences");
        Ok(pref)
    }

    /// Token-based unsubscribe: listed categories, or everything when none given
    pub async fn unsubscribe_by_token(
        &self,
        token: &str,
        categories: Option<&[EmailCategory]>,
    ) -> Result<EmailPreference> {
        let mut pref = self
            .repo
            .get_by_token(token)
            .await?
            .ok_or_else(|| Error::NotFound("Invalid unsubscribe token".to_string()))?;

        match categories {
            Some(categories) if !categories.is_empty() => {
                for category in categories {
                    pref.set_category(*category, false);
                }
            }
            _ => pref.global_unsubscribe = true,
        }
        pref.updated_at = chrono::Utc::now();

        self.repo.save(&pref).await?;
        info!(
            user_id = %pref.user_id,
            global = pref.global_unsubscribe,
            "Processed unsubscribe"
        );
        Ok(pref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_storage::InMemoryPreferenceRepository;
    use pretty_assertions::assert_eq;

    fn service() -> PreferenceService {
        PreferenceService::new(
            Arc::new(InMemoryPreferenceRepository::new()),
            "test-secret",
            "https://courier.example.com/email/unsubscribe/",
        )
    }

    #[tokio::test]
    async fn test_default_open_without_record() {
        let svc = service();
        assert!(svc
            .check_email_preferences(Some("u1"), TemplateId::OrderConfirmation)
            .await
            .unwrap());
        assert!(svc
            .check_email_preferences(None, TemplateId::Promotion)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_global_unsubscribe_wins() {
        let svc = service();
        let update = PreferenceUpdate {
            global_unsubscribe: Some(true),
            order_updates: Some(true),
            ..Default::default()
        };
        svc.update("u1", "u1@example.com", &update).await.unwrap();

        assert!(!svc
            .check_email_preferences(Some("u1"), TemplateId::OrderConfirmation)
            .await
            .unwrap());
        assert!(!svc
            .check_email_preferences(Some("u1"), TemplateId::ContactReply)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_category_opt_out() {
        let svc = service();
        let update = PreferenceUpdate {
            marketing_emails: Some(false),
            ..Default::default()
        };
        let pref = svc.update("u1", "u1@example.com", &update).await.unwrap();
        assert_eq!(pref.unsubscribed_categories, vec![EmailCategory::MarketingEmails]);

        assert!(!svc
            .check_email_preferences(Some("u1"), TemplateId::Newsletter)
            .await
            .unwrap());
        assert!(svc
            .check_email_preferences(Some("u1"), TemplateId::OrderDelivered)
            .await
            .unwrap());
        // Unmapped template
        assert!(svc
            .check_email_preferences(Some("u1"), TemplateId::ContactReply)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_evaluate_exposes_unsubscribe_url() {
        let svc = service();
        let pref = svc.get_or_create("u1", "u1@example.com").await.unwrap();
        let decision = svc.evaluate(Some("u1"), TemplateId::Welcome).await.unwrap();
        assert_eq!(
            decision.unsubscribe_url,
            Some(format!(
                "https://courier.example.com/email/unsubscribe/{}",
                pref.unsubscribe_token
            ))
        );
    }

    #[tokio::test]
    async fn test_get_or_create_is_stable() {
        let svc = service();
        let first = svc.get_or_create("u1", "u1@example.com").await.unwrap();
        let second = svc.get_or_create("u1", "other@example.com").await.unwrap();
        assert_eq!(first, second);
        assert!(first.order_updates && first.marketing_emails);
        assert!(!first.global_unsubscribe);
        assert_eq!(first.unsubscribe_token.len(), 64);
    }

    #[tokio::test]
    async fn test_tokens_are_unique() {
        let svc = service();
        assert_ne!(
            svc.generate_token("u1").unwrap(),
            svc.generate_token("u1").unwrap()
        );
    }

    #[tokio::test]
    async fn test_create_for_conflicts() {
        let svc = service();
        svc.create_for("u1", "u1@example.com", &PreferenceUpdate::default())
            .await
            .unwrap();
        let err = svc
            .create_for("u1", "u1@example.com", &PreferenceUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_unsubscribe_by_token() {
        let svc = service();
        let pref = svc.get_or_create("u1", "u1@example.com").await.unwrap();

        let updated = svc
            .unsubscribe_by_token(
                &pref.unsubscribe_token,
                Some(&[EmailCategory::PartnerNotifications]),
            )
            .await
            .unwrap();
        assert!(!updated.partner_notifications);
        assert!(!updated.global_unsubscribe);

        let updated = svc
            .unsubscribe_by_token(&pref.unsubscribe_token, None)
            .await
            .unwrap();
        assert!(updated.global_unsubscribe);

        assert!(matches!(
            svc.unsubscribe_by_token("nope", None).await,
            Err(Error::NotFound(_))
        ));
    }
}
