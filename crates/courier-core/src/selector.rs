//! Provider Factory - health- and quota-aware provider selection

use crate::counter::{near_limit, DailyCounterStore};
use crate::providers::EmailProvider;
use courier_common::types::ProviderId;
use courier_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why a provider was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionReason {
    OnlyAvailable,
    Primary,
    Fallback,
}

impl SelectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionReason::OnlyAvailable => "only_available",
            SelectionReason::Primary => "primary",
            SelectionReason::Fallback => "fallback",
        }
    }
}

/// Chosen provider
#[derive(Clone)]
pub struct ProviderSelection {
    pub provider: Arc<dyn EmailProvider>,
    pub reason: SelectionReason,
}

impl std::fmt::Debug for ProviderSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSelection")
            .field("provider", &self.provider.id())
            .field("reason", &self.reason)
            .finish()
    }
}

/// Per-provider quota and health snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderStats {
    pub provider: ProviderId,
    pub sent_today: u64,
    pub daily_limit: u32,
    pub fallback_threshold: f64,
    pub is_enabled: bool,
    pub is_healthy: bool,
    pub is_near_limit: bool,
    pub remaining: u64,
}

impl ProviderStats {
    /// Enabled, healthy and under its daily limit
    pub fn is_available(&self) -> bool {
        self.is_enabled && self.is_healthy && self.sent_today < self.daily_limit as u64
    }
}

/// Initialization and health of one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider: ProviderId,
    pub initialized: bool,
    pub healthy: bool,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Health of the provider set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub providers: Vec<ProviderHealth>,
    pub has_available_provider: bool,
}

/// Registry of providers and the selection state machine
pub struct ProviderFactory {
    /// Sorted by provider declaration order
    providers: Vec<Arc<dyn EmailProvider>>,
    counters: Arc<DailyCounterStore>,
    preferred: ProviderId,
}

impl ProviderFactory {
    pub fn new(
        mut providers: Vec<Arc<dyn EmailProvider>>,
        counters: Arc<DailyCounterStore>,
        preferred: ProviderId,
    ) -> Self {
        providers.sort_by_key(|p| p.id());
        Self {
            providers,
            counters,
            preferred,
        }
    }

    pub fn preferred(&self) -> ProviderId {
        self.preferred
    }

    pub fn counters(&self) -> &Arc<DailyCounterStore> {
        &self.counters
    }

    pub fn providers(&self) -> &[Arc<dyn EmailProvider>] {
        &self.providers
    }

    pub fn provider(&self, id: ProviderId) -> Option<Arc<dyn EmailProvider>> {
        self.providers.iter().find(|p| p.id() == id).cloned()
    }

    /// Initialize every provider; failures leave that provider unhealthy
    pub async fn initialize_all(&self) -> Vec<(ProviderId, Result<()>)> {
        let mut outcomes = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            let outcome = provider.initialize().await;
            match &outcome {
                Ok(()) => info!(provider = %provider.id(), "Email provider ready"),
                Err(e) => warn!(provider = %provider.id(), error = %e, "Email provider not initialized"),
            }
            outcomes.push((provider.id(), outcome));
        }
        outcomes
    }

    /// Quota and health of every provider, evaluated now
    pub async fn provider_stats(&self) -> Result<Vec<ProviderStats>> {
        let counter = self.counters.get_daily_counter().await?;
        let mut stats = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            let meta = provider.metadata();
            let sent_today = counter.count(provider.id());
            stats.push(ProviderStats {
                provider: provider.id(),
                sent_today,
                daily_limit: meta.daily_limit,
                fallback_threshold: meta.fallback_threshold,
                is_enabled: meta.enabled,
                is_healthy: provider.is_healthy().await,
                is_near_limit: near_limit(sent_today, meta.daily_limit, meta.fallback_threshold),
                remaining: (meta.daily_limit as u64).saturating_sub(sent_today),
            });
        }
        Ok(stats)
    }

    async fn available(&self) -> Result<Vec<(Arc<dyn EmailProvider>, ProviderStats)>> {
        let stats = self.provider_stats().await?;
        Ok(self
            .providers
            .iter()
            .cloned()
            .zip(stats)
            .filter(|(_, s)| s.is_available())
            .collect())
    }

    /// Pick a provider for the next send
    pub async fn select(&self) -> Result<ProviderSelection> {
        let available = self.available().await?;

        let selection = match available.as_slice() {
            [] => return Err(Error::NoProviderAvailable),
            [(only, _)] => ProviderSelection {
                provider: only.clone(),
                reason: SelectionReason::OnlyAvailable,
            },
            _ => {
                let preferred = available
                    .iter()
                    .find(|(p, s)| p.id() == self.preferred && !s.is_near_limit);
                let alternate = available
                    .iter()
                    .find(|(p, s)| p.id() != self.preferred && !s.is_near_limit);

                match (preferred, alternate) {
                    (Some((p, _)), _) => ProviderSelection {
                        provider: p.clone(),
                        reason: SelectionReason::Primary,
                    },
                    (None, Some((p, _))) => ProviderSelection {
                        provider: p.clone(),
                        reason: SelectionReason::Fallback,
                    },
                    (None, None) => {
                        // Everyone is near the cap: most remaining capacity, first declared wins ties
                        let mut best = &available[0];
                        for candidate in &available[1..] {
                            if candidate.1.remaining > best.1.remaining {
                                best = candidate;
                            }
                        }
                        ProviderSelection {
                            provider: best.0.clone(),
                            reason: SelectionReason::Fallback,
                        }
                    }
                }
            }
        };

        debug!(
            provider = %selection.provider.id(),
            reason = selection.reason.as_str(),
            "Selected email provider"
        );
        Ok(selection)
    }

    pub async fn has_available_provider(&self) -> Result<bool> {
        Ok(!self.available().await?.is_empty())
    }

    /// Another provider that is enabled and healthy
    pub async fn fallback_for(&self, failed: ProviderId) -> Option<Arc<dyn EmailProvider>> {
        for provider in self.providers.iter().filter(|p| p.id() != failed) {
            if provider.metadata().enabled && provider.is_healthy().await {
                return Some(provider.clone());
            }
        }
        None
    }

    pub async fn health(&self) -> Result<HealthSnapshot> {
        let mut providers = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            providers.push(ProviderHealth {
                provider: provider.id(),
                initialized: provider.is_initialized(),
                healthy: provider.is_healthy().await,
                enabled: provider.metadata().enabled,
                error: None,
            });
        }
        Ok(HealthSnapshot {
            providers,
            has_available_provider: self.has_available_provider().await?,
        })
    }

    /// Re-run initialization and report the new health
    pub async fn refresh_health(&self) -> Result<HealthSnapshot> {
        let outcomes = self.initialize_all().await;
        let mut snapshot = self.health().await?;
        for (entry, (_, outcome)) in snapshot.providers.iter_mut().zip(outcomes) {
            entry.error = outcome.err().map(|e| e.to_string());
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockProvider;
    use courier_storage::InMemoryCache;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct Fixture {
        resend: Arc<MockProvider>,
        mailjet: Arc<MockProvider>,
        factory: ProviderFactory,
    }

    fn fixture_with(resend: MockProvider, mailjet: MockProvider) -> Fixture {
        let resend = Arc::new(resend);
        let mailjet = Arc::new(mailjet);
        let counters = Arc::new(DailyCounterStore::new(
            Arc::new(InMemoryCache::new()),
            Duration::from_secs(86_400),
        ));
        let factory = ProviderFactory::new(
            vec![
                mailjet.clone() as Arc<dyn EmailProvider>,
                resend.clone() as Arc<dyn EmailProvider>,
            ],
            counters,
            ProviderId::Resend,
        );
        Fixture {
            resend,
            mailjet,
            factory,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            MockProvider::new(ProviderId::Resend, 100, 0.9),
            MockProvider::new(ProviderId::Mailjet, 100, 0.9),
        )
    }

    async fn set_counts(f: &Fixture, resend: u64, mailjet: u64) {
        let counters = f.factory.counters();
        counters.increment_counter(ProviderId::Resend, resend).await.unwrap();
        counters.increment_counter(ProviderId::Mailjet, mailjet).await.unwrap();
    }

    async fn selected(f: &Fixture) -> (ProviderId, SelectionReason) {
        let s = f.factory.select().await.unwrap();
        (s.provider.id(), s.reason)
    }

    #[tokio::test]
    async fn test_preferred_under_threshold_is_primary() {
        let f = fixture();
        set_counts(&f, 50, 0).await;
        assert_eq!(selected(&f).await, (ProviderId::Resend, SelectionReason::Primary));
    }

    #[tokio::test]
    async fn test_near_limit_preferred_falls_back() {
        let f = fixture();
        set_counts(&f, 91, 10).await;
        assert_eq!(selected(&f).await, (ProviderId::Mailjet, SelectionReason::Fallback));
    }

    #[tokio::test]
    async fn test_threshold_boundary_counts_as_near() {
        let f = fixture();
        set_counts(&f, 90, 0).await;
        assert_eq!(selected(&f).await, (ProviderId::Mailjet, SelectionReason::Fallback));
    }

    #[tokio::test]
    async fn test_all_near_limit_picks_most_remaining() {
        let f = fixture();
        set_counts(&f, 95, 92).await;
        assert_eq!(selected(&f).await, (ProviderId::Mailjet, SelectionReason::Fallback));
    }

    #[tokio::test]
    async fn test_remaining_tie_uses_declaration_order() {
        let f = fixture();
        set_counts(&f, 93, 93).await;
        assert_eq!(selected(&f).await, (ProviderId::Resend, SelectionReason::Fallback));
    }

    #[tokio::test]
    async fn test_single_healthy_provider_is_only_available() {
        let f = fixture();
        f.resend.set_healthy(false);
        set_counts(&f, 0, 95).await;
        assert_eq!(
            selected(&f).await,
            (ProviderId::Mailjet, SelectionReason::OnlyAvailable)
        );
    }

    #[tokio::test]
    async fn test_exhausted_provider_is_unavailable() {
        let f = fixture();
        set_counts(&f, 100, 0).await;
        assert_eq!(
            selected(&f).await,
            (ProviderId::Mailjet, SelectionReason::OnlyAvailable)
        );
    }

    #[tokio::test]
    async fn test_no_provider_available() {
        let f = fixture_with(
            MockProvider::new(ProviderId::Resend, 100, 0.9).disabled(),
            MockProvider::new(ProviderId::Mailjet, 100, 0.9),
        );
        set_counts(&f, 0, 100).await;

        assert!(matches!(f.factory.select().await, Err(Error::NoProviderAvailable)));
        assert!(!f.factory.has_available_provider().await.unwrap());
    }

    #[tokio::test]
    async fn test_fallback_for_skips_unhealthy() {
        let f = fixture();
        assert_eq!(
            f.factory.fallback_for(ProviderId::Resend).await.map(|p| p.id()),
            Some(ProviderId::Mailjet)
        );

        f.mailjet.set_healthy(false);
        assert!(f.factory.fallback_for(ProviderId::Resend).await.is_none());
    }

    #[tokio::test]
    async fn test_provider_stats_report_quota() {
        let f = fixture();
        set_counts(&f, 90, 3).await;

        let stats = f.factory.provider_stats().await.unwrap();
        assert_eq!(stats[0].provider, ProviderId::Resend);
        assert!(stats[0].is_near_limit);
        assert_eq!(stats[0].remaining, 10);
        assert_eq!(stats[1].provider, ProviderId::Mailjet);
        assert!(!stats[1].is_near_limit);
        assert_eq!(stats[1].sent_today, 3);
    }

    #[tokio::test]
    async fn test_health_snapshot() {
        let f = fixture();
        f.mailjet.set_healthy(false);

        let snapshot = f.factory.refresh_health().await.unwrap();
        assert!(snapshot.has_available_provider);
        assert_eq!(snapshot.providers.len(), 2);
        assert!(snapshot.providers[0].healthy);
        assert!(!snapshot.providers[1].healthy);
        assert!(snapshot.providers.iter().all(|p| p.initialized && p.error.is_none()));
    }
}
