//! Email preference repository

use crate::db::DatabasePool;
use crate::models::{EmailPreference, EmailPreferenceRow};
use async_trait::async_trait;
use courier_common::{Error, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Preference repository trait
#[async_trait]
pub trait PreferenceRepository: Send + Sync {
    /// Find preferences by recipient identity
    async fn get_by_user(&self, user_id: &str) -> Result<Option<EmailPreference>>;

    /// Find preferences by unsubscribe token
    async fn get_by_token(&self, token: &str) -> Result<Option<EmailPreference>>;

    /// Insert a new record; `Conflict` when the user already has one
    async fn create(&self, preference: &EmailPreference) -> Result<()>;

    /// Overwrite an existing record
    async fn save(&self, preference: &EmailPreference) -> Result<()>;
}

/// Database preference repository
pub struct DbPreferenceRepository {
    pool: DatabasePool,
}

impl DbPreferenceRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn fetch_one_where(
        &self,
        column: &str,
        value: &str,
    ) -> Result<Option<EmailPreference>> {
        let row = sqlx::query_as::<_, EmailPreferenceRow>(&format!(
            r#"
            SELECT id, user_id, email, order_updates, subscription_notifications,
                   marketing_emails, security_alerts, partner_notifications,
                   payment_notifications, system_notifications, global_unsubscribe,
                   unsubscribed_categories, unsubscribe_token, created_at, updated_at
            FROM email_preferences
            WHERE {} = $1
            "#,
            column
        ))
        .bind(value)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        row.map(EmailPreference::try_from).transpose()
    }
}

#[async_trait]
impl PreferenceRepository for DbPreferenceRepository {
    async fn get_by_user(&self, user_id: &str) -> Result<Option<EmailPreference>> {
        self.fetch_one_where("user_id", user_id).await
    }

    async fn get_by_token(&self, token: &str) -> Result<Option<EmailPreference>> {
        self.fetch_one_where("unsubscribe_token", token).await
    }

    async fn create(&self, p: &EmailPreference) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO email_preferences (
                id, user_id, email, order_updates, subscription_notifications,
                marketing_emails, security_alerts, partner_notifications,
                payment_notifications, system_notifications, global_unsubscribe,
                unsubscribed_categories, unsubscribe_token, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(p.id)
        .bind(&p.user_id)
        .bind(&p.email)
        .bind(p.order_updates)
        .bind(p.subscription_notifications)
        .bind(p.marketing_emails)
        .bind(p.security_alerts)
        .bind(p.partner_notifications)
        .bind(p.payment_notifications)
        .bind(p.system_notifications)
        .bind(p.global_unsubscribe)
        .bind(serde_json::json!(p.unsubscribed_categories))
        .bind(&p.unsubscribe_token)
        .bind(p.created_at)
        .bind(p.updated_at)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(Error::Conflict(format!(
                "Preferences already exist for user {}",
                p.user_id
            )));
        }
        Ok(())
    }

    async fn save(&self, p: &EmailPreference) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE email_preferences
            SET email = $2, order_updates = $3, subscription_notifications = $4,
                marketing_emails = $5, security_alerts = $6, partner_notifications = $7,
                payment_notifications = $8, system_notifications = $9,
                global_unsubscribe = $10, unsubscribed_categories = $11, updated_at = $12
            WHERE user_id = $1
            "#,
        )
        .bind(&p.user_id)
        .bind(&p.email)
        .bind(p.order_updates)
        .bind(p.subscription_notifications)
        .bind(p.marketing_emails)
        .bind(p.security_alerts)
        .bind(p.partner_notifications)
        .bind(p.payment_notifications)
        .bind(p.system_notifications)
        .bind(p.global_unsubscribe)
        .bind(serde_json::json!(p.unsubscribed_categories))
        .bind(p.updated_at)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!(
                "Preferences for user {} not found",
                p.user_id
            )));
        }
        Ok(())
    }
}

/// Process-local preference repository, keyed by user
#[derive(Default)]
pub struct InMemoryPreferenceRepository {
    records: RwLock<HashMap<String, EmailPreference>>,
}

impl InMemoryPreferenceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PreferenceRepository for InMemoryPreferenceRepository {
    async fn get_by_user(&self, user_id: &str) -> Result<Option<EmailPreference>> {
        Ok(self.records.read().await.get(user_id).cloned())
    }

    async fn get_by_token(&self, token: &str) -> Result<Option<EmailPreference>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|p| p.unsubscribe_token == token)
            .cloned())
    }

    async fn create(&self, preference: &EmailPreference) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&preference.user_id) {
            return Err(Error::Conflict(format!(
                "Preferences already exist for user {}",
                preference.user_id
            )));
        }
        records.insert(preference.user_id.clone(), preference.clone());
        Ok(())
    }

    async fn save(&self, preference: &EmailPreference) -> Result<()> {
        let mut records = self.records.write().await;
        match records.get_mut(&preference.user_id) {
            Some(existing) => {
                *existing = preference.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!(
                "Preferences for user {} not found",
                preference.user_id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_common::types::EmailCategory;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_create_conflicts_on_duplicate_user() {
        let repo = InMemoryPreferenceRepository::new();
        let pref = EmailPreference::new("u1".into(), "u1@example.com".into(), "t1".into());
        repo.create(&pref).await.unwrap();

        let err = repo.create(&pref).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_save_and_lookup_by_token() {
        let repo = InMemoryPreferenceRepository::new();
        let mut pref = EmailPreference::new("u1".into(), "u1@example.com".into(), "t1".into());
        repo.create(&pref).await.unwrap();

        pref.set_category(EmailCategory::PartnerNotifications, false);
        repo.save(&pref).await.unwrap();

        let stored = repo.get_by_token("t1").await.unwrap().unwrap();
        assert_eq!(stored, pref);
        assert!(repo.get_by_token("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_unknown_user_is_not_found() {
        let repo = InMemoryPreferenceRepository::new();
        let pref = EmailPreference::new("ghost".into(), "g@example.com".into(), "t".into());
        assert!(matches!(repo.save(&pref).await, Err(Error::NotFound(_))));
    }
}
