//! Email log repository

use crate::db::DatabasePool;
use crate::models::{
    DayCount, EmailLog, EmailLogFilter, EmailLogRow, EmailStats, EmailStatus, NewEmailLog,
    TemplateCount, UserCount,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use courier_common::types::{EmailLogId, Paginated, ProviderId};
use courier_common::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

const TOP_USERS: usize = 10;

/// Email log repository trait
#[async_trait]
pub trait EmailLogRepository: Send + Sync {
    /// Persist a new `pending` entry
    async fn create(&self, input: NewEmailLog) -> Result<EmailLog>;

    /// Get an entry by ID
    async fn get(&self, id: EmailLogId) -> Result<Option<EmailLog>>;

    /// Mark an entry as sent through `provider`
    async fn mark_sent(
        &self,
        id: EmailLogId,
        provider: ProviderId,
        provider_message_id: Option<String>,
    ) -> Result<()>;

    /// Mark an entry as failed for the current cycle
    async fn mark_failed(
        &self,
        id: EmailLogId,
        provider: Option<ProviderId>,
        error: &str,
    ) -> Result<()>;

    /// Record a failed retry attempt and schedule the next one
    async fn record_retry_failure(
        &self,
        id: EmailLogId,
        provider: Option<ProviderId>,
        error: &str,
        retry_count: i32,
        next_retry_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Failed entries due for a retry, oldest first
    async fn find_retryable(
        &self,
        max_retries: i32,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EmailLog>>;

    /// Paginated query, newest first (`page` is 1-based)
    async fn list(
        &self,
        filter: &EmailLogFilter,
        page: i64,
        limit: i64,
    ) -> Result<Paginated<EmailLog>>;

    /// Aggregate statistics over entries created since `since`
    async fn stats(&self, since: Option<DateTime<Utc>>, max_retries: i32) -> Result<EmailStats>;
}

fn provider_metadata(provider: Option<ProviderId>) -> serde_json::Value {
    match provider {
        Some(p) => serde_json::json!({ "provider": p.as_str() }),
        None => serde_json::json!({}),
    }
}

/// Database email log repository
pub struct DbEmailLogRepository {
    pool: DatabasePool,
}

impl DbEmailLogRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, to_addresses, subject, template, template_data, from_address, reply_to,
           cc_addresses, bcc_addresses, status, provider, provider_message_id,
           error_message, user_id, retry_count, next_retry_at, metadata, sent_at,
           created_at, updated_at
    FROM email_logs
"#;

#[async_trait]
impl EmailLogRepository for DbEmailLogRepository {
    async fn create(&self, input: NewEmailLog) -> Result<EmailLog> {
        let log = EmailLog::pending(input);

        sqlx::query(
            r#"
            INSERT INTO email_logs (
                id, to_addresses, subject, template, template_data, from_address, reply_to,
                cc_addresses, bcc_addresses, status, user_id, retry_count, metadata,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(log.id)
        .bind(serde_json::json!(log.to))
        .bind(&log.subject)
        .bind(&log.template)
        .bind(&log.template_data)
        .bind(&log.from)
        .bind(&log.reply_to)
        .bind(serde_json::json!(log.cc))
        .bind(serde_json::json!(log.bcc))
        .bind(log.status.as_str())
        .bind(&log.user_id)
        .bind(log.retry_count)
        .bind(&log.metadata)
        .bind(log.created_at)
        .bind(log.updated_at)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(log)
    }

    async fn get(&self, id: EmailLogId) -> Result<Option<EmailLog>> {
        let row = sqlx::query_as::<_, EmailLogRow>(&format!("{} WHERE id = $1", SELECT_COLUMNS))
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        row.map(EmailLog::try_from).transpose()
    }

    async fn mark_sent(
        &self,
        id: EmailLogId,
        provider: ProviderId,
        provider_message_id: Option<String>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE email_logs
            SET status = 'sent', provider = $2, provider_message_id = $3,
                error_message = NULL, next_retry_at = NULL,
                metadata = metadata || $4, sent_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(provider.as_str())
        .bind(provider_message_id)
        .bind(provider_metadata(Some(provider)))
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: EmailLogId,
        provider: Option<ProviderId>,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE email_logs
            SET status = 'failed', provider = COALESCE($2, provider), error_message = $3,
                metadata = metadata || $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(provider.map(|p| p.as_str()))
        .bind(error)
        .bind(provider_metadata(provider))
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn record_retry_failure(
        &self,
        id: EmailLogId,
        provider: Option<ProviderId>,
        error: &str,
        retry_count: i32,
        next_retry_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE email_logs
            SET status = 'failed', provider = COALESCE($2, provider), error_message = $3,
                retry_count = $4, next_retry_at = $5,
                metadata = metadata || $6, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(provider.map(|p| p.as_str()))
        .bind(error)
        .bind(retry_count)
        .bind(next_retry_at)
        .bind(provider_metadata(provider))
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn find_retryable(
        &self,
        max_retries: i32,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EmailLog>> {
        let rows = sqlx::query_as::<_, EmailLogRow>(&format!(
            r#"{}
            WHERE status = 'failed'
              AND retry_count < $1
              AND (next_retry_at IS NULL OR next_retry_at <= $2)
            ORDER BY created_at ASC
            LIMIT $3
            "#,
            SELECT_COLUMNS
        ))
        .bind(max_retries)
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.into_iter().map(EmailLog::try_from).collect()
    }

    async fn list(
        &self,
        filter: &EmailLogFilter,
        page: i64,
        limit: i64,
    ) -> Result<Paginated<EmailLog>> {
        let page = page.max(1);
        let limit = limit.clamp(1, 100);
        let status = filter.status.map(|s| s.as_str());

        let where_clause = r#"
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR template = $2)
              AND ($3::text IS NULL OR user_id = $3)
        "#;

        let rows = sqlx::query_as::<_, EmailLogRow>(&format!(
            "{} {} ORDER BY created_at DESC LIMIT $4 OFFSET $5",
            SELECT_COLUMNS, where_clause
        ))
        .bind(status)
        .bind(&filter.template)
        .bind(&filter.user_id)
        .bind(limit)
        .bind((page - 1) * limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let (total,): (i64,) =
            sqlx::query_as(&format!("SELECT COUNT(*) FROM email_logs {}", where_clause))
                .bind(status)
                .bind(&filter.template)
                .bind(&filter.user_id)
                .fetch_one(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        Ok(Paginated {
            data: rows
                .into_iter()
                .map(EmailLog::try_from)
                .collect::<Result<Vec<_>>>()?,
            total,
            page,
            limit,
        })
    }

    async fn stats(&self, since: Option<DateTime<Utc>>, max_retries: i32) -> Result<EmailStats> {
        let pool = self.pool.pool();
        let window = "($1::timestamptz IS NULL OR created_at >= $1)";

        let by_status: Vec<(String, i64)> = sqlx::query_as(&format!(
            "SELECT status, COUNT(*) FROM email_logs WHERE {} GROUP BY status",
            window
        ))
        .bind(since)
        .fetch_all(pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let by_template: Vec<(String, i64)> = sqlx::query_as(&format!(
            "SELECT template, COUNT(*) FROM email_logs WHERE {} \
             GROUP BY template ORDER BY COUNT(*) DESC, template",
            window
        ))
        .bind(since)
        .fetch_all(pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let by_day: Vec<(NaiveDate, i64)> = sqlx::query_as(&format!(
            "SELECT (created_at AT TIME ZONE 'UTC')::date AS day, COUNT(*) FROM email_logs \
             WHERE {} GROUP BY day ORDER BY day",
            window
        ))
        .bind(since)
        .fetch_all(pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let top_users: Vec<(String, i64)> = sqlx::query_as(&format!(
            "SELECT user_id, COUNT(*) FROM email_logs WHERE user_id IS NOT NULL AND {} \
             GROUP BY user_id ORDER BY COUNT(*) DESC, user_id LIMIT {}",
            window, TOP_USERS
        ))
        .bind(since)
        .fetch_all(pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let (exhausted,): (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM email_logs WHERE status = 'failed' AND retry_count >= $2 AND {}",
            window
        ))
        .bind(since)
        .bind(max_retries)
        .fetch_one(pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(EmailStats {
            total: by_status.iter().map(|(_, c)| c).sum(),
            by_status: by_status.into_iter().collect(),
            by_template: by_template
                .into_iter()
                .map(|(template, count)| TemplateCount { template, count })
                .collect(),
            by_day: by_day
                .into_iter()
                .map(|(date, count)| DayCount { date, count })
                .collect(),
            top_users: top_users
                .into_iter()
                .map(|(user_id, count)| UserCount { user_id, count })
                .collect(),
            exhausted,
        })
    }
}

/// Process-local email log repository
#[derive(Default)]
pub struct InMemoryEmailLogRepository {
    logs: RwLock<Vec<EmailLog>>,
}

impl InMemoryEmailLogRepository {
    pub fn new() -> Self {
        Self::default()
    }

    async fn update<F>(&self, id: EmailLogId, apply: F) -> Result<()>
    where
        F: FnOnce(&mut EmailLog) + Send,
    {
        let mut logs = self.logs.write().await;
        let log = logs
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or_else(|| Error::NotFound(format!("Email log {} not found", id)))?;
        apply(log);
        log.updated_at = Utc::now();
        Ok(())
    }
}

fn merge_provider(log: &mut EmailLog, provider: Option<ProviderId>) {
    if let Some(p) = provider {
        log.provider = Some(p);
        if let Some(meta) = log.metadata.as_object_mut() {
            meta.insert("provider".into(), serde_json::json!(p.as_str()));
        } else {
            log.metadata = provider_metadata(Some(p));
        }
    }
}

fn count_by<K: Ord>(keys: impl Iterator<Item = K>) -> BTreeMap<K, i64> {
    let mut counts = BTreeMap::new();
    for key in keys {
        *counts.entry(key).or_insert(0) += 1;
    }
    counts
}

#[async_trait]
impl EmailLogRepository for InMemoryEmailLogRepository {
    async fn create(&self, input: NewEmailLog) -> Result<EmailLog> {
        let log = EmailLog::pending(input);
        self.logs.write().await.push(log.clone());
        Ok(log)
    }

    async fn get(&self, id: EmailLogId) -> Result<Option<EmailLog>> {
        Ok(self.logs.read().await.iter().find(|l| l.id == id).cloned())
    }

    async fn mark_sent(
        &self,
        id: EmailLogId,
        provider: ProviderId,
        provider_message_id: Option<String>,
    ) -> Result<()> {
        self.update(id, |log| {
            log.status = EmailStatus::Sent;
            log.provider_message_id = provider_message_id;
            log.error_message = None;
            log.next_retry_at = None;
            log.sent_at = Some(Utc::now());
            merge_provider(log, Some(provider));
        })
        .await
    }

    async fn mark_failed(
        &self,
        id: EmailLogId,
        provider: Option<ProviderId>,
        error: &str,
    ) -> Result<()> {
        let error = error.to_string();
        self.update(id, |log| {
            log.status = EmailStatus::Failed;
            log.error_message = Some(error);
            merge_provider(log, provider);
        })
        .await
    }

    async fn record_retry_failure(
        &self,
        id: EmailLogId,
        provider: Option<ProviderId>,
        error: &str,
        retry_count: i32,
        next_retry_at: DateTime<Utc>,
    ) -> Result<()> {
        let error = error.to_string();
        self.update(id, |log| {
            log.status = EmailStatus::Failed;
            log.error_message = Some(error);
            log.retry_count = retry_count;
            log.next_retry_at = Some(next_retry_at);
            merge_provider(log, provider);
        })
        .await
    }

    async fn find_retryable(
        &self,
        max_retries: i32,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EmailLog>> {
        let logs = self.logs.read().await;
        let mut due: Vec<EmailLog> = logs
            .iter()
            .filter(|l| l.is_retryable(max_retries, now))
            .cloned()
            .collect();
        due.sort_by_key(|l| l.created_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn list(
        &self,
        filter: &EmailLogFilter,
        page: i64,
        limit: i64,
    ) -> Result<Paginated<EmailLog>> {
        let page = page.max(1);
        let limit = limit.clamp(1, 100);

        let logs = self.logs.read().await;
        let mut matching: Vec<&EmailLog> = logs.iter().filter(|l| filter.matches(l)).collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len() as i64;
        let data = matching
            .into_iter()
            .skip(((page - 1) * limit) as usize)
            .take(limit as usize)
            .cloned()
            .collect();

        Ok(Paginated {
            data,
            total,
            page,
            limit,
        })
    }

    async fn stats(&self, since: Option<DateTime<Utc>>, max_retries: i32) -> Result<EmailStats> {
        let logs = self.logs.read().await;
        let window: Vec<&EmailLog> = logs
            .iter()
            .filter(|l| since.map_or(true, |s| l.created_at >= s))
            .collect();

        let by_status = count_by(window.iter().map(|l| l.status.as_str().to_string()));

        let mut by_template: Vec<TemplateCount> = count_by(window.iter().map(|l| l.template.clone()))
            .into_iter()
            .map(|(template, count)| TemplateCount { template, count })
            .collect();
        by_template.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.template.cmp(&b.template)));

        let by_day = count_by(window.iter().map(|l| l.created_at.date_naive()))
            .into_iter()
            .map(|(date, count)| DayCount { date, count })
            .collect();

        let mut per_user: HashMap<&str, i64> = HashMap::new();
        for user in window.iter().filter_map(|l| l.user_id.as_deref()) {
            *per_user.entry(user).or_insert(0) += 1;
        }
        let mut top_users: Vec<UserCount> = per_user
            .into_iter()
            .map(|(user_id, count)| UserCount {
                user_id: user_id.to_string(),
                count,
            })
            .collect();
        top_users.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.user_id.cmp(&b.user_id)));
        top_users.truncate(TOP_USERS);

        let exhausted = window
            .iter()
            .filter(|l| l.status == EmailStatus::Failed && l.retry_count >= max_retries)
            .count() as i64;

        Ok(EmailStats {
            total: window.len() as i64,
            by_status,
            by_template,
            by_day,
            top_users,
            exhausted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn new_log(template: &str, user: Option<&str>) -> NewEmailLog {
        NewEmailLog {
            to: vec!["someone@example.com".into()],
            subject: "Subject".into(),
            template: template.into(),
            template_data: serde_json::json!({}),
            user_id: user.map(String::from),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_mark_sent_records_provider_metadata() {
        let repo = InMemoryEmailLogRepository::new();
        let log = repo.create(new_log("welcome", None)).await.unwrap();
        assert_eq!(log.status, EmailStatus::Pending);

        repo.mark_sent(log.id, ProviderId::Mailjet, Some("mj-1".into()))
            .await
            .unwrap();

        let stored = repo.get(log.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EmailStatus::Sent);
        assert_eq!(stored.provider, Some(ProviderId::Mailjet));
        assert_eq!(stored.metadata["provider"], "mailjet");
        assert_eq!(stored.provider_message_id.as_deref(), Some("mj-1"));
        assert!(stored.sent_at.is_some());
    }

    #[tokio::test]
    async fn test_find_retryable_respects_ceiling_and_schedule() {
        let repo = InMemoryEmailLogRepository::new();
        let now = Utc::now();

        let due = repo.create(new_log("welcome", None)).await.unwrap();
        repo.mark_failed(due.id, Some(ProviderId::Resend), "boom")
            .await
            .unwrap();

        let later = repo.create(new_log("welcome", None)).await.unwrap();
        repo.record_retry_failure(later.id, None, "boom", 1, now + chrono::Duration::minutes(2))
            .await
            .unwrap();

        let exhausted = repo.create(new_log("welcome", None)).await.unwrap();
        repo.record_retry_failure(exhausted.id, None, "boom", 3, now)
            .await
            .unwrap();

        let _pending = repo.create(new_log("welcome", None)).await.unwrap();

        let found = repo.find_retryable(3, now, 10).await.unwrap();
        assert_eq!(found.iter().map(|l| l.id).collect::<Vec<_>>(), vec![due.id]);
    }

    #[tokio::test]
    async fn test_list_filters_and_paginates() {
        let repo = InMemoryEmailLogRepository::new();
        for _ in 0..3 {
            repo.create(new_log("order-confirmation", Some("u1"))).await.unwrap();
        }
        repo.create(new_log("welcome", Some("u2"))).await.unwrap();

        let filter = EmailLogFilter {
            template: Some("order-confirmation".into()),
            ..Default::default()
        };
        let page = repo.list(&filter, 2, 2).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.data.len(), 1);
        assert_eq!(page.total_pages(), 2);
    }

    #[tokio::test]
    async fn test_stats_counts_exhausted_entries() {
        let repo = InMemoryEmailLogRepository::new();
        let a = repo.create(new_log("welcome", Some("u1"))).await.unwrap();
        let b = repo.create(new_log("welcome", Some("u1"))).await.unwrap();
        let c = repo.create(new_log("promotion", Some("u2"))).await.unwrap();

        repo.mark_sent(a.id, ProviderId::Resend, None).await.unwrap();
        repo.record_retry_failure(b.id, None, "down", 3, Utc::now())
            .await
            .unwrap();
        repo.mark_failed(c.id, None, "down").await.unwrap();

        let stats = repo.stats(None, 3).await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_status.get("failed"), Some(&2));
        assert_eq!(stats.by_status.get("sent"), Some(&1));
        assert_eq!(stats.exhausted, 1);
        assert_eq!(stats.by_template[0].template, "welcome");
        assert_eq!(stats.top_users[0].user_id, "u1");
        assert_eq!(stats.by_day.len(), 1);
    }
}
