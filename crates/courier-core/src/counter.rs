//! Daily Counter Store - per-provider send counts for the current UTC day

use chrono::{NaiveDate, Utc};
use courier_common::types::ProviderId;
use courier_common::{Error, Result};
use courier_storage::{Cache, DailyCounter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

type Today = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

/// Daily counter store backed by a TTL cache
///
/// Counters are kept under `email_counter:<YYYY-MM-DD>` and expire after the
/// configured TTL, so a new day starts from zero without any cleanup job.
/// Increments are read-modify-write; the local mutex serializes them within
/// this process only.
pub struct DailyCounterStore {
    cache: Arc<dyn Cache>,
    ttl: Duration,
    write_lock: Mutex<()>,
    today: Today,
}

impl DailyCounterStore {
    pub fn new(cache: Arc<dyn Cache>, ttl: Duration) -> Self {
        Self {
            cache,
            ttl,
            write_lock: Mutex::new(()),
            today: Arc::new(|| Utc::now().date_naive()),
        }
    }

    /// Override how the current day is derived
    pub fn with_clock(mut self, today: impl Fn() -> NaiveDate + Send + Sync + 'static) -> Self {
        self.today = Arc::new(today);
        self
    }

    fn today(&self) -> NaiveDate {
        (self.today)()
    }

    async fn load(&self, date: NaiveDate) -> Result<Option<DailyCounter>> {
        let key = DailyCounter::cache_key(date);
        match self.cache.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| Error::Cache(format!("Malformed counter {}: {}", key, e))),
            None => Ok(None),
        }
    }

    async fn store(&self, counter: &DailyCounter) -> Result<()> {
        let raw = serde_json::to_string(counter)
            .map_err(|e| Error::Internal(format!("Failed to encode counter: {}", e)))?;
        self.cache
            .set(&DailyCounter::cache_key(counter.date), &raw, self.ttl)
            .await
    }

    /// Today's counter, created zeroed when absent
    pub async fn get_daily_counter(&self) -> Result<DailyCounter> {
        let date = self.today();
        if let Some(counter) = self.load(date).await? {
            return Ok(counter);
        }

        let _guard = self.write_lock.lock().await;
        // Another task may have created it while we waited
        if let Some(counter) = self.load(date).await? {
            return Ok(counter);
        }
        let counter = DailyCounter::new(date);
        self.store(&counter).await?;
        debug!(date = %date, "Created daily counter");
        Ok(counter)
    }

    /// Add `count` sends to a provider's counter for today
    pub async fn increment_counter(&self, provider: ProviderId, count: u64) -> Result<DailyCounter> {
        let date = self.today();
        let _guard = self.write_lock.lock().await;

        let mut counter = self
            .load(date)
            .await?
            .unwrap_or_else(|| DailyCounter::new(date));
        counter.increment(provider, count);
        self.store(&counter).await?;

        debug!(
            provider = %provider,
            count,
            sent_today = counter.count(provider),
            total = counter.total_count,
            "Incremented daily counter"
        );
        Ok(counter)
    }

    /// Sends recorded today for a provider
    pub async fn get_provider_count(&self, provider: ProviderId) -> Result<u64> {
        Ok(self
            .load(self.today())
            .await?
            .map(|c| c.count(provider))
            .unwrap_or(0))
    }

    pub async fn is_near_limit(
        &self,
        provider: ProviderId,
        daily_limit: u32,
        threshold: f64,
    ) -> Result<bool> {
        let count = self.get_provider_count(provider).await?;
        Ok(near_limit(count, daily_limit, threshold))
    }

    pub async fn has_reached_limit(&self, provider: ProviderId, daily_limit: u32) -> Result<bool> {
        Ok(self.get_provider_count(provider).await? >= daily_limit as u64)
    }

    /// Zero today's counter
    pub async fn reset_counters(&self) -> Result<DailyCounter> {
        let date = self.today();
        let _guard = self.write_lock.lock().await;
        let counter = DailyCounter::new(date);
        self.store(&counter).await?;
        info!(date = %date, "Daily counters reset");
        Ok(counter)
    }
}

/// Inclusive near-limit test: `count >= floor(limit * threshold)`
pub fn near_limit(count: u64, daily_limit: u32, threshold: f64) -> bool {
    count >= (daily_limit as f64 * threshold).floor() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_storage::InMemoryCache;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn store() -> DailyCounterStore {
        DailyCounterStore::new(Arc::new(InMemoryCache::new()), DAY)
    }

    #[tokio::test]
    async fn test_fresh_counter_is_zeroed() {
        let counter = store().get_daily_counter().await.unwrap();
        assert_eq!(counter.total_count, 0);
        assert_eq!(counter.count(ProviderId::Resend), 0);
        assert_eq!(counter.count(ProviderId::Mailjet), 0);
        assert_eq!(counter.date, Utc::now().date_naive());
    }

    #[tokio::test]
    async fn test_increment_keeps_total_in_sync() {
        let store = store();
        store.increment_counter(ProviderId::Resend, 1).await.unwrap();
        store.increment_counter(ProviderId::Mailjet, 4).await.unwrap();
        let counter = store.increment_counter(ProviderId::Resend, 2).await.unwrap();

        assert_eq!(counter.count(ProviderId::Resend), 3);
        assert_eq!(counter.total_count, 7);
        assert_eq!(store.get_daily_counter().await.unwrap(), counter);
    }

    #[tokio::test]
    async fn test_near_limit_boundary_is_inclusive() {
        assert!(!near_limit(89, 100, 0.9));
        assert!(near_limit(90, 100, 0.9));
        assert!(near_limit(91, 100, 0.9));
        // floor(15 * 0.9) = 13
        assert!(near_limit(13, 15, 0.9));
        assert!(!near_limit(12, 15, 0.9));
        assert!(!near_limit(99, 100, 1.0));
        assert!(near_limit(100, 100, 1.0));

        let store = store();
        store.increment_counter(ProviderId::Resend, 90).await.unwrap();
        assert!(store.is_near_limit(ProviderId::Resend, 100, 0.9).await.unwrap());
        assert!(!store.has_reached_limit(ProviderId::Resend, 100).await.unwrap());

        store.increment_counter(ProviderId::Resend, 10).await.unwrap();
        assert!(store.has_reached_limit(ProviderId::Resend, 100).await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_zeroes_today() {
        let store = store();
        store.increment_counter(ProviderId::Mailjet, 5).await.unwrap();
        let counter = store.reset_counters().await.unwrap();
        assert_eq!(counter.total_count, 0);
        assert_eq!(store.get_provider_count(ProviderId::Mailjet).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_day_rollover_gives_independent_counters() {
        let day = Arc::new(AtomicU32::new(14));
        let clock = day.clone();
        let store = DailyCounterStore::new(Arc::new(InMemoryCache::new()), DAY).with_clock(
            move || NaiveDate::from_ymd_opt(2025, 3, clock.load(Ordering::SeqCst)).unwrap(),
        );

        store.increment_counter(ProviderId::Resend, 3).await.unwrap();
        let first = store.get_daily_counter().await.unwrap();
        assert_eq!(first.count(ProviderId::Resend), 3);

        day.store(15, Ordering::SeqCst);
        let second = store.get_daily_counter().await.unwrap();
        assert_eq!(second.total_count, 0);
        let second = store.increment_counter(ProviderId::Resend, 1).await.unwrap();
        assert_eq!(second.count(ProviderId::Resend), 1);

        // Yesterday's record expires with its TTL
        tokio::time::advance(DAY + Duration::from_secs(1)).await;
        day.store(14, Ordering::SeqCst);
        assert_eq!(store.get_provider_count(ProviderId::Resend).await.unwrap(), 0);
    }
}
