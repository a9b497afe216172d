//! Provider registry: holds constructed providers, answers which of
//! them can serve a given indicator type, and aggregates per-provider
//! call statistics from the contract's events.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;

use crate::models::IocType;
use crate::providers::{CallOutcome, IntelSource, Provider, ProviderConfig, ProviderEvents};

/// Running statistics for one provider
#[derive(Debug, Clone, Serialize, Default)]
pub struct ProviderCallStats {
    pub total_calls: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub avg_response_ms: f64,
}

#[derive(Debug, Default)]
struct StatsRow {
    total: u64,
    succeeded: u64,
    failed: u64,
    response_ms_sum: u64,
}

/// Shared call-statistics sink, fed by [`Provider::enrich`]
#[derive(Default)]
pub struct RegistryStats {
    rows: RwLock<HashMap<String, StatsRow>>,
}

impl ProviderEvents for RegistryStats {
    fn provider_call(&self, provider: &str, outcome: CallOutcome, elapsed_ms: u64) {
        let mut rows = self.rows.write();
        let row = rows.entry(provider.to_string()).or_default();
        row.total += 1;
        match outcome {
            CallOutcome::Success => {
                row.succeeded += 1;
                row.response_ms_sum += elapsed_ms;
            }
            CallOutcome::Failure => row.failed += 1,
        }
    }
}

impl RegistryStats {
    fn snapshot(&self) -> HashMap<String, ProviderCallStats> {
        self.rows
            .read()
            .iter()
            .map(|(id, row)| {
                let avg = if row.succeeded > 0 {
                    row.response_ms_sum as f64 / row.succeeded as f64
                } else {
                    0.0
                };
                (
                    id.clone(),
                    ProviderCallStats {
                        total_calls: row.total,
                        succeeded: row.succeeded,
                        failed: row.failed,
                        avg_response_ms: avg,
                    },
                )
            })
            .collect()
    }
}

/// Registry of wrapped providers
pub struct ProviderRegistry {
    providers: RwLock<Vec<Arc<Provider>>>,
    stats: Arc<RegistryStats>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
            stats: Arc::new(RegistryStats::default()),
        }
    }

    /// Register an already-constructed source
    pub fn register(&self, source: Arc<dyn IntelSource>, config: ProviderConfig) {
        let provider = Arc::new(Provider::new(
            source,
            config,
            self.stats.clone() as Arc<dyn ProviderEvents>,
        ));
        tracing::info!(provider = provider.id(), "Provider registered");
        self.providers.write().push(provider);
    }

    /// Register through a fallible builder. A constructor failure is
    /// logged and skipped so the remaining providers still register.
    pub fn register_with<F>(&self, name: &str, config: ProviderConfig, builder: F)
    where
        F: FnOnce() -> anyhow::Result<Arc<dyn IntelSource>>,
    {
        match builder() {
            Ok(source) => self.register(source, config),
            Err(e) => {
                tracing::warn!(provider = name, error = %e, "Provider construction failed, skipping");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }

    pub fn all(&self) -> Vec<Arc<Provider>> {
        self.providers.read().clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Provider>> {
        self.providers
            .read()
            .iter()
            .find(|p| p.id() == id)
            .cloned()
    }

    /// Enabled providers that can answer for the given indicator type
    pub fn supporting(&self, ioc_type: IocType) -> Vec<Arc<Provider>> {
        self.providers
            .read()
            .iter()
            .filter(|p| p.is_enabled() && p.supports(ioc_type))
            .cloned()
            .collect()
    }

    /// Recommended subset for a type, each with a human-readable
    /// justification
    pub fn recommended(&self, ioc_type: IocType) -> Vec<(Arc<Provider>, String)> {
        self.supporting(ioc_type)
            .into_iter()
            .map(|p| {
                let why = if p.specializes_in(ioc_type) {
                    let desc = p.description();
                    if desc.is_empty() {
                        format!("{} specializes in {} indicators", p.id(), ioc_type)
                    } else {
                        desc
                    }
                } else {
                    format!("{} has general {} coverage", p.id(), ioc_type)
                };
                (p, why)
            })
            .collect()
    }

    /// Per-provider call statistics, accumulated across all enrichments
    pub fn stats(&self) -> HashMap<String, ProviderCallStats> {
        self.stats.snapshot()
    }

    /// Concurrent connectivity self-test across all providers
    pub async fn test_all(&self) -> HashMap<String, bool> {
        let providers = self.all();
        let checks = providers.iter().map(|p| async {
            let healthy = p.test_connection().await;
            (p.id().to_string(), healthy)
        });
        join_all(checks).await.into_iter().collect()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
