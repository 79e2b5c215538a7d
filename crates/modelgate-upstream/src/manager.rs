use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use modelgate_common::{ModelMapping, ProviderConfig, ProxyConfig};

use crate::provider::{Provider, UpstreamError};
use crate::recovery;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub max_failures: u32,
    pub recovery_interval: Duration,
    pub health_check_period: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            max_failures: 3,
            recovery_interval: Duration::from_secs(30),
            health_check_period: Duration::from_secs(60),
        }
    }
}

impl ManagerSettings {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            max_failures: config.effective_max_failures(),
            recovery_interval: config.effective_recovery_interval(),
            health_check_period: config.effective_health_check_period(),
        }
    }
}

/// One routable (provider, mapping) pair for an alias.
#[derive(Clone)]
pub struct Candidate {
    pub provider: Arc<Provider>,
    pub mapping: ModelMapping,
}

impl Candidate {
    pub fn combined_priority(&self) -> i64 {
        self.provider.config().effective_priority() + self.mapping.effective_priority()
    }

    pub fn combined_weight(&self) -> u64 {
        self.provider.config().effective_weight() * self.mapping.effective_weight()
    }

    pub fn alias(&self) -> &str {
        self.mapping.effective_alias()
    }

    pub fn upstream(&self) -> &str {
        &self.mapping.upstream
    }

    pub fn health(&self) -> Option<&Arc<crate::health::HealthState>> {
        self.provider.health_for(&self.mapping.upstream)
    }

    /// `name(upstream)`, the form attempt logs and error messages use.
    pub fn label(&self) -> String {
        format!("{}({})", self.provider.name(), self.mapping.upstream)
    }

    fn same_entry(&self, other: &Candidate) -> bool {
        Arc::ptr_eq(&self.provider, &other.provider)
            && self.mapping.upstream == other.mapping.upstream
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelStats {
    pub alias: String,
    pub upstream: String,
    pub healthy: bool,
    pub failure_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStats {
    pub name: String,
    pub healthy: bool,
    pub total_requests: u64,
    pub success_requests: u64,
    pub success_rate: f64,
    pub models: Vec<ModelStats>,
}

/// Routing and health authority over the configured providers.
///
/// The provider list and per-provider indices are immutable after construction;
/// the only mutable pieces are atomics (health counters, the process-wide
/// round-robin counter) and the stop signal for the recovery loop. Constructing
/// a Manager spawns that loop, so it must happen inside a Tokio runtime. On hot
/// reload a replacement Manager is built, the counter is carried over with
/// `restore_round_robin`, and the old instance is `stop()`ed.
pub struct Manager {
    providers: Vec<Arc<Provider>>,
    settings: ManagerSettings,
    round_robin: AtomicU64,
    stop: watch::Sender<bool>,
}

impl Manager {
    pub fn new(
        configs: &[ProviderConfig],
        settings: ManagerSettings,
    ) -> Result<Arc<Self>, UpstreamError> {
        let providers = configs
            .iter()
            .map(|config| Provider::new(config.clone(), settings.max_failures).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        let (stop, stop_rx) = watch::channel(false);
        recovery::spawn(providers.clone(), settings.clone(), stop_rx);

        Ok(Arc::new(Self {
            providers,
            settings,
            round_robin: AtomicU64::new(0),
            stop,
        }))
    }

    /// Unblocks the recovery loop; in-flight requests finish on their own.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn providers(&self) -> &[Arc<Provider>] {
        &self.providers
    }

    pub fn round_robin_value(&self) -> u64 {
        self.round_robin.load(Ordering::Relaxed)
    }

    /// Carries the load-balancing position over from a replaced Manager.
    pub fn restore_round_robin(&self, value: u64) {
        self.round_robin.store(value, Ordering::Relaxed);
    }

    /// Failover-ordered candidates for an alias: healthy entries when any
    /// exist, every entry otherwise (degraded mode), ordered by combined
    /// priority ascending then combined weight descending. Ties keep input
    /// order.
    pub fn candidates_for(&self, alias: &str) -> Vec<Candidate> {
        let mut candidates = self.collect(alias, true);
        if candidates.is_empty() {
            candidates = self.collect(alias, false);
        }
        candidates.sort_by(|a, b| {
            a.combined_priority()
                .cmp(&b.combined_priority())
                .then_with(|| b.combined_weight().cmp(&a.combined_weight()))
        });
        candidates
    }

    fn collect(&self, alias: &str, healthy_only: bool) -> Vec<Candidate> {
        let mut out = Vec::new();
        for provider in &self.providers {
            let Some(indices) = provider.mapping_indices(alias) else {
                continue;
            };
            for &idx in indices {
                let mapping = provider.mapping(idx).clone();
                if healthy_only {
                    let healthy = provider
                        .health_for(&mapping.upstream)
                        .map(|health| health.is_healthy())
                        .unwrap_or(true);
                    if !healthy {
                        continue;
                    }
                }
                out.push(Candidate {
                    provider: Arc::clone(provider),
                    mapping,
                });
            }
        }
        out
    }

    /// Weighted round-robin pick restricted to the top-priority tier. The
    /// counter only advances when the tier actually has alternatives.
    pub fn select_for(&self, alias: &str) -> Option<Candidate> {
        let candidates = self.candidates_for(alias);
        let first = candidates.first()?;
        let top_priority = first.combined_priority();
        let top: Vec<&Candidate> = candidates
            .iter()
            .take_while(|candidate| candidate.combined_priority() == top_priority)
            .collect();
        if top.len() == 1 {
            return Some(top[0].clone());
        }

        let total: u64 = top.iter().map(|candidate| candidate.combined_weight()).sum();
        let target = self.round_robin.fetch_add(1, Ordering::Relaxed) % total;
        let mut running = 0u64;
        for candidate in &top {
            running += candidate.combined_weight();
            if target < running {
                return Some((*candidate).clone());
            }
        }
        Some(top[0].clone())
    }

    /// The per-request attempt order: the round-robin head first, then the
    /// remaining candidates in priority/weight order. No entry appears twice.
    pub fn failover_plan(&self, alias: &str) -> Vec<Candidate> {
        let all = self.candidates_for(alias);
        if all.len() <= 1 {
            return all;
        }
        let Some(selected) = self.select_for(alias) else {
            return all;
        };

        let mut plan = Vec::with_capacity(all.len());
        plan.push(selected);
        for candidate in all {
            if candidate.same_entry(&plan[0]) {
                continue;
            }
            plan.push(candidate);
        }
        plan
    }

    pub fn record_success(&self, candidate: &Candidate) {
        candidate.provider.record_request(true);
        if let Some(health) = candidate.health()
            && health.record_success()
        {
            info!(
                provider = %candidate.provider.name(),
                upstream = %candidate.upstream(),
                "upstream recovered after successful request"
            );
        }
    }

    pub fn record_failure(&self, candidate: &Candidate) {
        candidate.provider.record_request(false);
        if let Some(health) = candidate.health() {
            let (failures, tripped) = health.record_failure();
            if tripped {
                warn!(
                    provider = %candidate.provider.name(),
                    upstream = %candidate.upstream(),
                    failures,
                    "upstream marked unhealthy"
                );
            }
        }
    }

    /// Every distinct alias across all providers, deduplicated and sorted.
    pub fn aliases(&self) -> Vec<String> {
        let mut set = BTreeSet::new();
        for provider in &self.providers {
            for alias in provider.aliases() {
                set.insert(alias.to_string());
            }
        }
        set.into_iter().collect()
    }

    pub fn has_alias(&self, alias: &str) -> bool {
        self.providers
            .iter()
            .any(|provider| provider.mapping_indices(alias).is_some())
    }

    pub fn stats(&self) -> Vec<ProviderStats> {
        self.providers
            .iter()
            .map(|provider| {
                let (total, success) = provider.request_counts();
                let success_rate = if total > 0 {
                    success as f64 / total as f64 * 100.0
                } else {
                    0.0
                };
                let models = provider
                    .config()
                    .model_mappings
                    .iter()
                    .map(|mapping| {
                        let health = provider.health_for(&mapping.upstream);
                        ModelStats {
                            alias: mapping.effective_alias().to_string(),
                            upstream: mapping.upstream.clone(),
                            healthy: health.map(|h| h.is_healthy()).unwrap_or(true),
                            failure_count: health.map(|h| h.failure_count()).unwrap_or(0),
                        }
                    })
                    .collect();
                let healthy = provider
                    .health_entries()
                    .all(|(_, health)| health.is_healthy());
                ProviderStats {
                    name: provider.name().to_string(),
                    healthy,
                    total_requests: total,
                    success_requests: success,
                    success_rate,
                    models,
                }
            })
            .collect()
    }
}
