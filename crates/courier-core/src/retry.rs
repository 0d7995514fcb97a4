//! Retry Scheduler - periodic re-delivery of failed sends

use crate::delivery::EmailService;
use crate::templates::TemplateId;
use chrono::{Duration, Utc};
use courier_common::Result;
use courier_storage::EmailLog;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Entries closed without a send (blocked or unknown template)
    pub skipped: usize,
    /// Another sweep was already running
    pub skipped_run: bool,
}

/// Clears the run flag when a sweep ends, including on early return
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct RetryScheduler {
    service: Arc<EmailService>,
    running: AtomicBool,
}

impl RetryScheduler {
    pub fn new(service: Arc<EmailService>) -> Self {
        Self {
            service,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Sweep up to `limit` due entries below `max_retries`
    pub async fn run_once(&self, limit: i64, max_retries: i32) -> Result<RetrySummary> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Retry sweep already in progress, skipping");
            return Ok(RetrySummary {
                skipped_run: true,
                ..Default::default()
            });
        }
        let _guard = RunGuard(&self.running);

        let due = self
            .service
            .logs()
            .find_retryable(max_retries, Utc::now(), limit)
            .await?;

        let mut summary = RetrySummary::default();
        for log in due {
            summary.processed += 1;
            self.retry_entry(&log, max_retries, &mut summary).await;
        }

        if summary.processed > 0 {
            info!(
                processed = summary.processed,
                succeeded = summary.succeeded,
                failed = summary.failed,
                skipped = summary.skipped,
                "Retry sweep finished"
            );
        }
        Ok(summary)
    }

    async fn retry_entry(&self, log: &EmailLog, max_retries: i32, summary: &mut RetrySummary) {
        let logs = self.service.logs();
        let result = self.service.redeliver(log).await;

        if result.success {
            summary.succeeded += 1;
            if let Some(provider) = result.provider {
                if let Err(e) = logs
                    .mark_sent(log.id, provider, result.message_id.clone())
                    .await
                {
                    error!(log_id = %log.id, "Failed to mark retried email as sent: {}", e);
                }
            }
            info!(log_id = %log.id, attempt = log.retry_count + 1, "Retried email sent");
            return;
        }

        let error = result.error.as_deref().unwrap_or("unknown error");
        let now = Utc::now();

        // Nothing a later attempt could change; close the entry
        let terminal = result.blocked || log.template.parse::<TemplateId>().is_err();
        let (retry_count, next_retry_at) = if terminal {
            summary.skipped += 1;
            (max_retries.max(log.retry_count + 1), now)
        } else {
            summary.failed += 1;
            (log.retry_count + 1, now + calculate_backoff(log.retry_count))
        };

        if let Err(e) = logs
            .record_retry_failure(log.id, result.provider, error, retry_count, next_retry_at)
            .await
        {
            error!(log_id = %log.id, "Failed to record retry failure: {}", e);
            return;
        }

        if retry_count >= max_retries {
            warn!(
                log_id = %log.id,
                retry_count,
                "Email permanently failed, manual intervention required: {}",
                error
            );
        } else {
            debug!(
                log_id = %log.id,
                retry_count,
                next_retry_at = %next_retry_at,
                "Retry failed, rescheduled"
            );
        }
    }

    /// Sweep every `period` until `shutdown` flips to true
    pub async fn run(
        &self,
        period: std::time::Duration,
        limit: i64,
        max_retries: i32,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Retry scheduler started (interval: {}s)", period.as_secs());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once(limit, max_retries).await {
                        error!("Error processing retries: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Retry scheduler stopped");
    }
}

/// Exponential backoff: 2^attempts minutes
fn calculate_backoff(attempts: i32) -> Duration {
    // Exponent bound keeps the result inside chrono's range
    Duration::minutes(2_i64.pow(attempts.clamp(0, MAX_BACKOFF_EXPONENT) as u32))
}

const MAX_BACKOFF_EXPONENT: i32 = 30;
