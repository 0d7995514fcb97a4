//! Key/value cache with per-entry expiry

use async_trait::async_trait;
use courier_common::{Error, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

/// String cache with TTL
#[async_trait]
pub trait Cache: Send + Sync {
    /// Get a live value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value that expires after `ttl`
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Remove a value
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check that the backend is reachable
    async fn health_check(&self) -> Result<()>;
}

/// Process-local cache
#[derive(Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, (String, Instant)>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some((value, expires_at)) if *expires_at > now => {
                    return Ok(Some(value.clone()))
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Expired: drop it lazily
        let mut entries = self.entries.write().await;
        if matches!(entries.get(key), Some((_, expires_at)) if *expires_at <= now) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        // Stale day keys are never read again, so expiry is enforced here too
        let before = entries.len();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        let pruned = before - entries.len();
        if pruned > 0 {
            debug!(pruned, "Pruned expired cache entries");
        }

        entries.insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Redis-backed cache
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    /// Connect to Redis
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to Redis cache");

        let client = redis::Client::open(url)
            .map_err(|e| Error::Cache(format!("Invalid Redis URL: {}", e)))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::Cache(format!("Failed to connect: {}", e)))?;

        info!("Redis connection established");
        Ok(Self { conn })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get::<_, Option<String>>(key)
            .await
            .map_err(|e| Error::Cache(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let seconds = ttl.as_secs().max(1);
        debug!(key, seconds, "Writing cache entry");
        conn.set_ex::<_, _, ()>(key, value, seconds)
            .await
            .map_err(|e| Error::Cache(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| Error::Cache(e.to_string()))
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.exists::<_, bool>("courier:health")
            .await
            .map(|_| ())
            .map_err(|e| Error::Cache(format!("Health check failed: {}", e)))
    }
}
