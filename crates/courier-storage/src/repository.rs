//! Repository layer for data access

pub mod api_keys;
pub mod email_logs;
pub mod preferences;

// Re-export concrete repository implementations
pub use api_keys::{DbApiKeyRepository, InMemoryApiKeyRepository};
pub use email_logs::{DbEmailLogRepository, InMemoryEmailLogRepository};
pub use preferences::{DbPreferenceRepository, InMemoryPreferenceRepository};

// Re-export repository traits
pub use api_keys::ApiKeyRepository;
pub use email_logs::EmailLogRepository;
pub use preferences::PreferenceRepository;

// Re-export API key types
pub use api_keys::{ApiKey, ApiKeyId, NewApiKey};
