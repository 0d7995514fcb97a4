//! API Key repository

use crate::db::DatabasePool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::types::{Role, UserId};
use courier_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tokio::sync::RwLock;
use uuid::Uuid;

/// API Key ID type
pub type ApiKeyId = Uuid;

/// API Key model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: ApiKeyId,
    pub name: String,
    /// Recipient identity the key acts for (`user` role keys)
    pub user_id: Option<UserId>,
    pub role: Role,
    pub key_hash: String,
    pub key_prefix: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    /// Check if the API key has expired
    pub fn is_expired(&self) -> bool {
        self.expires_at.map_or(false, |at| at < Utc::now())
    }
}

#[derive(Debug, FromRow)]
struct ApiKeyRow {
    id: ApiKeyId,
    name: String,
    user_id: Option<String>,
    role: String,
    key_hash: String,
    key_prefix: String,
    expires_at: Option<DateTime<Utc>>,
    last_used_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ApiKeyRow> for ApiKey {
    type Error = Error;

    fn try_from(row: ApiKeyRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            name: row.name,
            user_id: row.user_id,
            role: row.role.parse()?,
            key_hash: row.key_hash,
            key_prefix: row.key_prefix,
            expires_at: row.expires_at,
            last_used_at: row.last_used_at,
            created_at: row.created_at,
        })
    }
}

/// Create API key input (hash already computed)
#[derive(Debug, Clone)]
pub struct NewApiKey {
    pub name: String,
    pub user_id: Option<UserId>,
    pub role: Role,
    pub key_hash: String,
    pub key_prefix: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewApiKey {
    fn into_key(self) -> ApiKey {
        ApiKey {
            id: Uuid::new_v4(),
            name: self.name,
            user_id: self.user_id,
            role: self.role,
            key_hash: self.key_hash,
            key_prefix: self.key_prefix,
            expires_at: self.expires_at,
            last_used_at: None,
            created_at: Utc::now(),
        }
    }
}

/// API key repository trait
#[async_trait]
pub trait ApiKeyRepository: Send + Sync {
    /// Find live API keys by their prefix (for initial lookup)
    async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<ApiKey>>;

    /// Get an API key by ID
    async fn get(&self, id: ApiKeyId) -> Result<Option<ApiKey>>;

    /// Update last_used_at timestamp
    async fn update_last_used(&self, id: ApiKeyId) -> Result<()>;

    /// Store a new key
    async fn create(&self, input: NewApiKey) -> Result<ApiKey>;
}

/// Database API key repository
pub struct DbApiKeyRepository {
    pool: DatabasePool,
}

impl DbApiKeyRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ApiKeyRepository for DbApiKeyRepository {
    async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<ApiKey>> {
        let rows = sqlx::query_as::<_, ApiKeyRow>(
            r#"
            SELECT id, name, user_id, role, key_hash, key_prefix,
                   expires_at, last_used_at, created_at
            FROM api_keys
            WHERE key_prefix = $1
              AND (expires_at IS NULL OR expires_at > NOW())
            LIMIT 10
            "#,
        )
        .bind(prefix)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        rows.into_iter().map(ApiKey::try_from).collect()
    }

    async fn get(&self, id: ApiKeyId) -> Result<Option<ApiKey>> {
        let row = sqlx::query_as::<_, ApiKeyRow>(
            r#"
            SELECT id, name, user_id, role, key_hash, key_prefix,
                   expires_at, last_used_at, created_at
            FROM api_keys
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        row.map(ApiKey::try_from).transpose()
    }

    async fn update_last_used(&self, id: ApiKeyId) -> Result<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = $2 WHERE id = $1")
            .bind(id)
            .bind(Utc::now())
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn create(&self, input: NewApiKey) -> Result<ApiKey> {
        let key = input.into_key();

        sqlx::query(
            r#"
            INSERT INTO api_keys (id, name, user_id, role, key_hash, key_prefix, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(key.id)
        .bind(&key.name)
        .bind(&key.user_id)
        .bind(key.role.as_str())
        .bind(&key.key_hash)
        .bind(&key.key_prefix)
        .bind(key.expires_at)
        .bind(key.created_at)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(key)
    }
}

/// Process-local API key repository
#[derive(Default)]
pub struct InMemoryApiKeyRepository {
    keys: RwLock<Vec<ApiKey>>,
}

impl InMemoryApiKeyRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApiKeyRepository for InMemoryApiKeyRepository {
    async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<ApiKey>> {
        Ok(self
            .keys
            .read()
            .await
            .iter()
            .filter(|k| k.key_prefix == prefix && !k.is_expired())
            .cloned()
            .collect())
    }

    async fn get(&self, id: ApiKeyId) -> Result<Option<ApiKey>> {
        Ok(self.keys.read().await.iter().find(|k| k.id == id).cloned())
    }

    async fn update_last_used(&self, id: ApiKeyId) -> Result<()> {
        if let Some(key) = self.keys.write().await.iter_mut().find(|k| k.id == id) {
            key.last_used_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn create(&self, input: NewApiKey) -> Result<ApiKey> {
        let key = input.into_key();
        self.keys.write().await.push(key.clone());
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_key(prefix: &str, expires_at: Option<DateTime<Utc>>) -> NewApiKey {
        NewApiKey {
            name: "test".into(),
            user_id: None,
            role: Role::Admin,
            key_hash: "hash".into(),
            key_prefix: prefix.into(),
            expires_at,
        }
    }

    #[tokio::test]
    async fn test_find_by_prefix_skips_expired() {
        let repo = InMemoryApiKeyRepository::new();
        let live = repo.create(new_key("cr_abcde", None)).await.unwrap();
        repo.create(new_key("cr_abcde", Some(Utc::now() - chrono::Duration::hours(1))))
            .await
            .unwrap();

        let found = repo.find_by_prefix("cr_abcde").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, live.id);
    }

    #[tokio::test]
    async fn test_update_last_used() {
        let repo = InMemoryApiKeyRepository::new();
        let key = repo.create(new_key("cr_12345", None)).await.unwrap();
        assert!(key.last_used_at.is_none());

        repo.update_last_used(key.id).await.unwrap();
        assert!(repo.get(key.id).await.unwrap().unwrap().last_used_at.is_some());
    }
}
