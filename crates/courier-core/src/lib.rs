//! Courier Core - provider routing, delivery pipeline and retry sweep
//!
//! This crate provides the transactional email machinery for Courier,
//! including vendor adapters, daily quota tracking, provider selection with
//! fallback, preference enforcement and the retry scheduler.

pub mod counter;
pub mod delivery;
pub mod metrics;
pub mod preferences;
pub mod providers;
pub mod retry;
pub mod selector;
pub mod templates;

pub use counter::DailyCounterStore;
pub use delivery::{EmailMessage, EmailService};
pub use metrics::EmailMetrics;
pub use preferences::{GateDecision, PreferenceService};
pub use providers::{
    Attachment, EmailProvider, EmailResult, MailjetProvider, MockProvider, OutboundEmail,
    ResendProvider,
};
pub use retry::{RetryScheduler, RetrySummary};
pub use selector::{
    HealthSnapshot, ProviderFactory, ProviderHealth, ProviderSelection, ProviderStats,
    SelectionReason,
};
pub use templates::{MiniJinjaRenderer, RenderedEmail, TemplateId, TemplateRenderer};
