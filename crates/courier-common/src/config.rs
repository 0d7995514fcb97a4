//! Configuration for Courier

use crate::types::{ProviderId, Role};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration (in-memory repositories when absent)
    pub database: Option<DatabaseConfig>,

    /// Counter cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Email delivery configuration
    #[serde(default)]
    pub email: EmailConfig,

    /// Retry sweep configuration
    #[serde(default)]
    pub retry: RetryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

/// Cache backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Memory,
    Redis,
}

/// Cache configuration (daily counters live here)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_backend")]
    pub backend: CacheBackend,

    /// Redis URL (required for the redis backend)
    pub url: Option<String>,

    /// TTL applied to daily counter records
    #[serde(default = "default_counter_ttl")]
    pub counter_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            url: None,
            counter_ttl_secs: default_counter_ttl(),
        }
    }
}

fn default_cache_backend() -> CacheBackend {
    CacheBackend::Memory
}

fn default_counter_ttl() -> u64 {
    24 * 60 * 60
}

/// Static quota configuration of one provider
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub enabled: bool,
    pub daily_limit: u32,
    pub fallback_threshold: f64,
}

impl ProviderConfig {
    fn validate(&self, provider: ProviderId) -> crate::Result<()> {
        if !(self.fallback_threshold > 0.0 && self.fallback_threshold <= 1.0) {
            return Err(crate::Error::Config(format!(
                "{}: fallback_threshold must be in (0, 1], got {}",
                provider, self.fallback_threshold
            )));
        }
        Ok(())
    }
}

/// Resend provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResendConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_resend_daily_limit")]
    pub daily_limit: u32,

    #[serde(default = "default_fallback_threshold")]
    pub fallback_threshold: f64,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_resend_base_url")]
    pub base_url: String,
}

impl ResendConfig {
    pub fn limits(&self) -> ProviderConfig {
        ProviderConfig {
            enabled: self.enabled,
            daily_limit: self.daily_limit,
            fallback_threshold: self.fallback_threshold,
        }
    }
}

impl Default for ResendConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            daily_limit: default_resend_daily_limit(),
            fallback_threshold: default_fallback_threshold(),
            api_key: String::new(),
            base_url: default_resend_base_url(),
        }
    }
}

fn default_resend_daily_limit() -> u32 {
    100
}

fn default_resend_base_url() -> String {
    "https://api.resend.com".to_string()
}

/// Mailjet provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailjetConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_mailjet_daily_limit")]
    pub daily_limit: u32,

    #[serde(default = "default_fallback_threshold")]
    pub fallback_threshold: f64,

    #[serde(default)]
    pub api_key: String,

    #[serde(default)]
    pub api_secret: String,

    #[serde(default = "default_mailjet_base_url")]
    pub base_url: String,
}

impl MailjetConfig {
    pub fn limits(&self) -> ProviderConfig {
        ProviderConfig {
            enabled: self.enabled,
            daily_limit: self.daily_limit,
            fallback_threshold: self.fallback_threshold,
        }
    }
}

impl Default for MailjetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            daily_limit: default_mailjet_daily_limit(),
            fallback_threshold: default_fallback_threshold(),
            api_key: String::new(),
            api_secret: String::new(),
            base_url: default_mailjet_base_url(),
        }
    }
}

fn default_mailjet_daily_limit() -> u32 {
    200
}

fn default_mailjet_base_url() -> String {
    "https://api.mailjet.com".to_string()
}

fn default_fallback_threshold() -> f64 {
    0.9
}

fn default_true() -> bool {
    true
}

/// Email delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    /// Provider used whenever it is healthy and comfortably under quota
    #[serde(default = "default_preferred_provider")]
    pub preferred_provider: ProviderId,

    /// Retry through the alternate provider when the selected one fails
    #[serde(default = "default_true")]
    pub auto_fallback: bool,

    /// Sender used when a message does not carry one
    #[serde(default = "default_from")]
    pub default_from: String,

    /// Delay between messages of a bulk send
    #[serde(default = "default_bulk_delay_ms")]
    pub bulk_delay_ms: u64,

    /// Vendor HTTP request timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Base URL for unsubscribe links
    #[serde(default = "default_unsubscribe_base_url")]
    pub unsubscribe_base_url: String,

    /// Secret used to derive unsubscribe tokens
    #[serde(default)]
    pub unsubscribe_secret: String,

    #[serde(default)]
    pub resend: ResendConfig,

    #[serde(default)]
    pub mailjet: MailjetConfig,
}

impl EmailConfig {
    /// Quota configuration of a provider
    pub fn provider(&self, id: ProviderId) -> ProviderConfig {
        match id {
            ProviderId::Resend => self.resend.limits(),
            ProviderId::Mailjet => self.mailjet.limits(),
        }
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            preferred_provider: default_preferred_provider(),
            auto_fallback: true,
            default_from: default_from(),
            bulk_delay_ms: default_bulk_delay_ms(),
            request_timeout_secs: default_request_timeout(),
            unsubscribe_base_url: default_unsubscribe_base_url(),
            unsubscribe_secret: String::new(),
            resend: ResendConfig::default(),
            mailjet: MailjetConfig::default(),
        }
    }
}

fn default_preferred_provider() -> ProviderId {
    ProviderId::Resend
}

fn default_from() -> String {
    "Courier <noreply@localhost>".to_string()
}

fn default_bulk_delay_ms() -> u64 {
    100
}

fn default_request_timeout() -> u64 {
    30
}

fn default_unsubscribe_base_url() -> String {
    "http://localhost:8080/email/unsubscribe".to_string()
}

/// Retry sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Run the periodic sweep
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between sweeps
    #[serde(default = "default_retry_interval")]
    pub interval_secs: u64,

    /// Maximum entries per sweep
    #[serde(default = "default_batch_limit")]
    pub batch_limit: i64,

    /// Retry ceiling per log entry
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_retry_interval(),
            batch_limit: default_batch_limit(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_retry_interval() -> u64 {
    300
}

fn default_batch_limit() -> i64 {
    50
}

fn default_max_retries() -> i32 {
    3
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// API key seeded at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapKey {
    pub name: String,
    /// Plain key; only its hash is stored
    pub key: String,
    pub role: Role,
    pub user_id: Option<String>,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Serve /openapi.json and /docs
    #[serde(default = "default_true")]
    pub enable_docs: bool,

    /// CORS allowed origins
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Keys inserted into the key store on startup
    #[serde(default)]
    pub bootstrap_keys: Vec<BootstrapKey>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enable_docs: true,
            cors_origins: Vec::new(),
            bootstrap_keys: Vec::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: None,
            cache: CacheConfig::default(),
            email: EmailConfig::default(),
            retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl Config {
    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from a file, layering `COURIER__*` environment variables on top
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .add_source(::config::Environment::with_prefix("COURIER").separator("__"))
            .build()
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        settings
            .try_deserialize()
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from `COURIER_CONFIG` or the default locations
    pub fn load() -> crate::Result<Self> {
        let mut paths = Vec::new();
        if let Ok(explicit) = std::env::var("COURIER_CONFIG") {
            paths.push(PathBuf::from(explicit));
        }
        paths.push(PathBuf::from("./courier.toml"));
        paths.push(PathBuf::from("/etc/courier/courier.toml"));

        let mut config = match paths.into_iter().find(|p| p.exists()) {
            Some(path) => {
                tracing::info!(path = %path.display(), "Loading configuration");
                Self::from_file(&path)?
            }
            None => {
                tracing::warn!("No configuration file found, using defaults");
                Self::default()
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply well-known secret environment variables
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("RESEND_API_KEY") {
            self.email.resend.api_key = key;
        }
        if let Ok(key) = std::env::var("MAILJET_API_KEY") {
            self.email.mailjet.api_key = key;
        }
        if let Ok(secret) = std::env::var("MAILJET_API_SECRET") {
            self.email.mailjet.api_secret = secret;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            match self.database.as_mut() {
                Some(db) => db.url = url,
                None => {
                    self.database = Some(DatabaseConfig {
                        url,
                        max_connections: default_max_connections(),
                        min_connections: default_min_connections(),
                    })
                }
            }
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            self.cache.url = Some(url);
        }
    }

    /// Check configuration invariants
    pub fn validate(&self) -> crate::Result<()> {
        for id in ProviderId::ALL {
            self.email.provider(id).validate(id)?;
        }

        if self.cache.backend == CacheBackend::Redis && self.cache.url.is_none() {
            return Err(crate::Error::Config(
                "cache.url is required for the redis backend".to_string(),
            ));
        }

        if self.retry.max_retries < 0 {
            return Err(crate::Error::Config(
                "retry.max_retries must not be negative".to_string(),
            ));
        }

        if self.retry.interval_secs == 0 {
            return Err(crate::Error::Config(
                "retry.interval_secs must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.email.preferred_provider, ProviderId::Resend);
        assert!(config.email.auto_fallback);
        assert_eq!(config.email.bulk_delay_ms, 100);
        assert_eq!(config.cache.counter_ttl_secs, 86_400);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 3000

[database]
url = "postgres://localhost/courier"

[email]
preferred_provider = "mailjet"
auto_fallback = false

[email.resend]
daily_limit = 3000
fallback_threshold = 0.8
api_key = "re_test"

[email.mailjet]
enabled = false

[retry]
max_retries = 5
"#;

        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.database.unwrap().url, "postgres://localhost/courier");
        assert_eq!(config.email.preferred_provider, ProviderId::Mailjet);
        assert!(!config.email.auto_fallback);
        assert_eq!(config.email.resend.daily_limit, 3000);
        assert_eq!(config.email.resend.api_key, "re_test");
        assert!(!config.email.mailjet.enabled);
        assert_eq!(config.email.mailjet.daily_limit, 200);
        assert_eq!(config.retry.max_retries, 5);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let mut config = Config::default();
        config.email.mailjet.fallback_threshold = 0.0;
        assert!(config.validate().is_err());

        config.email.mailjet.fallback_threshold = 1.5;
        assert!(config.validate().is_err());

        config.email.mailjet.fallback_threshold = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_redis_requires_url() {
        let mut config = Config::default();
        config.cache.backend = CacheBackend::Redis;
        assert!(config.validate().is_err());

        config.cache.url = Some("redis://127.0.0.1:6379".to_string());
        assert!(config.validate().is_ok());
    }
}
