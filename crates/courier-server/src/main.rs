//! Courier - transactional email delivery service entry point

use anyhow::{Context, Result};
use courier_api::{create_router, seed_bootstrap_keys, AppState};
use courier_common::config::{CacheBackend, Config, LoggingConfig};
use courier_core::{
    DailyCounterStore, EmailMetrics, EmailProvider, EmailService, MailjetProvider,
    MiniJinjaRenderer, PreferenceService, ProviderFactory, ResendProvider, RetryScheduler,
};
use courier_storage::{
    ApiKeyRepository, Cache, DatabasePool, DbApiKeyRepository, DbEmailLogRepository,
    DbPreferenceRepository, EmailLogRepository, InMemoryApiKeyRepository, InMemoryCache,
    InMemoryEmailLogRepository, InMemoryPreferenceRepository, PreferenceRepository, RedisCache,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

struct Repositories {
    logs: Arc<dyn EmailLogRepository>,
    preferences: Arc<dyn PreferenceRepository>,
    api_keys: Arc<dyn ApiKeyRepository>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    init_logging(&config.logging);

    info!("Starting Courier email service...");

    // Initialize database, or fall back to in-memory storage
    let db_pool = match &config.database {
        Some(db_config) => {
            let pool = DatabasePool::new(db_config).await?;
            info!("Database connection established");

            pool.migrate().await?;
            info!("Database migrations completed");
            Some(pool)
        }
        None => {
            warn!("No database configured, using in-memory storage");
            None
        }
    };

    let repos = match &db_pool {
        Some(pool) => Repositories {
            logs: Arc::new(DbEmailLogRepository::new(pool.clone())),
            preferences: Arc::new(DbPreferenceRepository::new(pool.clone())),
            api_keys: Arc::new(DbApiKeyRepository::new(pool.clone())),
        },
        None => Repositories {
            logs: Arc::new(InMemoryEmailLogRepository::new()),
            preferences: Arc::new(InMemoryPreferenceRepository::new()),
            api_keys: Arc::new(InMemoryApiKeyRepository::new()),
        },
    };

    // Initialize counter cache
    let cache: Arc<dyn Cache> = match config.cache.backend {
        CacheBackend::Redis => {
            let url = config
                .cache
                .url
                .as_deref()
                .context("cache.url is required for the redis backend")?;
            let cache = RedisCache::connect(url).await?;
            info!("Redis counter cache connected");
            Arc::new(cache)
        }
        CacheBackend::Memory => {
            info!("Using in-memory counter cache");
            Arc::new(InMemoryCache::new())
        }
    };
    let counters = Arc::new(DailyCounterStore::new(
        cache,
        Duration::from_secs(config.cache.counter_ttl_secs),
    ));

    // Initialize providers
    let timeout = Duration::from_secs(config.email.request_timeout_secs);
    let providers: Vec<Arc<dyn EmailProvider>> = vec![
        Arc::new(ResendProvider::new(config.email.resend.clone(), timeout)?),
        Arc::new(MailjetProvider::new(config.email.mailjet.clone(), timeout)?),
    ];
    let factory = Arc::new(ProviderFactory::new(
        providers,
        counters,
        config.email.preferred_provider,
    ));
    let ready = factory
        .initialize_all()
        .await
        .iter()
        .filter(|(_, outcome)| outcome.is_ok())
        .count();
    if ready == 0 {
        warn!("No email provider initialized; sends will fail until one recovers");
    }

    // Initialize delivery services
    let preferences = Arc::new(PreferenceService::new(
        repos.preferences,
        config.email.unsubscribe_secret.clone(),
        config.email.unsubscribe_base_url.clone(),
    ));
    let email = Arc::new(EmailService::new(
        factory,
        Arc::new(MiniJinjaRenderer::new()?),
        repos.logs,
        preferences,
        Arc::new(EmailMetrics::new()?),
        &config.email,
    ));
    let retry = Arc::new(RetryScheduler::new(email.clone()));

    // Seed API keys
    let seeded = seed_bootstrap_keys(repos.api_keys.as_ref(), &config.api.bootstrap_keys).await?;
    if seeded > 0 {
        info!("Seeded {} bootstrap API keys", seeded);
    }

    // Start retry sweep
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let retry_handle = if config.retry.enabled {
        let retry = retry.clone();
        let period = Duration::from_secs(config.retry.interval_secs);
        let limit = config.retry.batch_limit;
        let max_retries = config.retry.max_retries;
        info!(
            "Starting retry sweep every {}s (batch {}, max retries {})",
            config.retry.interval_secs, limit, max_retries
        );
        Some(tokio::spawn(async move {
            retry.run(period, limit, max_retries, shutdown_rx).await;
        }))
    } else {
        info!("Retry sweep disabled");
        None
    };

    // Start API server
    let state = Arc::new(AppState {
        email,
        retry,
        api_keys: repos.api_keys,
        db_pool,
        retry_config: config.retry.clone(),
    });
    let app = create_router(state, &config.api);

    let addr = format!("{}:{}", config.server.bind_address, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind API server to {}", addr))?;
    info!("Courier listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutdown signal received");
    signal_retry_shutdown(&shutdown_tx);
    if let Some(handle) = retry_handle {
        if let Err(e) = handle.await {
            warn!("Retry sweep ended abnormally: {}", e);
        }
    }

    info!("Courier shutdown complete");

    Ok(())
}

/// Tell the retry loop to stop; false when nothing is listening anymore
fn signal_retry_shutdown(shutdown_tx: &watch::Sender<bool>) -> bool {
    match shutdown_tx.send(true) {
        Ok(()) => true,
        Err(_) => {
            warn!("Retry sweep already stopped before shutdown signal");
            false
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info,courier=debug"));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retry_shutdown_reaches_listener() {
        let (tx, mut rx) = watch::channel(false);
        assert!(signal_retry_shutdown(&tx));
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[test]
    fn retry_shutdown_without_listener_is_reported() {
        let (tx, rx) = watch::channel(false);
        drop(rx);
        assert!(!signal_retry_shutdown(&tx));
    }
}
