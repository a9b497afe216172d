//! Enrichment orchestrator: cache check, provider selection, bounded
//! concurrent fan-out, fusion, write-through, and stats. The one
//! entry point the API layer calls.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use metrics::histogram;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::cache::EnrichmentCache;
use crate::error::EnrichError;
use crate::fusion::FusionEngine;
use crate::models::{EnrichStats, FusedResult, Indicator, IocType, ProviderResult};
use crate::providers::registry::ProviderRegistry;
use crate::providers::Provider;

/// Which providers an enrichment run consults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SelectionStrategy {
    /// Every enabled provider supporting the type
    All,
    /// The registry's recommended subset
    Recommended,
    /// An explicit provider id list, still filtered by type support
    Custom(Vec<String>),
}

/// Runtime-mutable orchestration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub selection: SelectionStrategy,
    /// Providers per concurrent batch; batches run sequentially
    pub max_concurrent_providers: usize,
    pub min_successful_providers: usize,
    /// Whole-operation ceiling, independent of per-provider timeouts
    pub operation_timeout_ms: u64,
    /// Indicators enriched in parallel by `enrich_batch`
    pub batch_concurrency: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            selection: SelectionStrategy::All,
            max_concurrent_providers: 4,
            min_successful_providers: 1,
            operation_timeout_ms: 30_000,
            batch_concurrency: 4,
        }
    }
}

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct EnrichOptions {
    /// Skip the cache lookup (the fresh result is still written back)
    pub force_refresh: bool,
    /// Override the configured selection with explicit provider ids
    pub providers: Option<Vec<String>>,
}

/// A successful enrichment: the fused result plus run statistics
#[derive(Debug, Clone)]
pub struct EnrichOutcome {
    pub result: FusedResult,
    pub stats: EnrichStats,
}

/// One item of a batch run, success or failure tagged per indicator
#[derive(Debug)]
pub struct BatchItem {
    pub indicator: Indicator,
    pub outcome: Result<EnrichOutcome, EnrichError>,
}

/// Persistence boundary: every fused result is offered here. The core
/// only emits; it never reads back.
pub trait EnrichmentSink: Send + Sync {
    fn enriched(&self, result: &FusedResult, stats: &EnrichStats);
}

/// The orchestrator wires registry, cache, and fusion together
pub struct Orchestrator {
    registry: Arc<ProviderRegistry>,
    cache: Arc<EnrichmentCache>,
    fusion: Arc<FusionEngine>,
    config: RwLock<OrchestratorConfig>,
    sink: RwLock<Option<Arc<dyn EnrichmentSink>>>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        cache: Arc<EnrichmentCache>,
        fusion: Arc<FusionEngine>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            cache,
            fusion,
            config: RwLock::new(config),
            sink: RwLock::new(None),
        }
    }

    /// Register the archival sink; passed explicitly, no global bus
    pub fn set_sink(&self, sink: Arc<dyn EnrichmentSink>) {
        *self.sink.write() = Some(sink);
    }

    pub fn config(&self) -> OrchestratorConfig {
        self.config.read().clone()
    }

    pub fn update_config(&self, config: OrchestratorConfig) {
        *self.config.write() = config;
    }

    /// Enrich one indicator end to end
    pub async fn enrich(
        &self,
        value: &str,
        ioc_type: IocType,
    ) -> Result<EnrichOutcome, EnrichError> {
        self.enrich_with(Indicator::new(value, ioc_type), EnrichOptions::default())
            .await
    }

    pub async fn enrich_with(
        &self,
        indicator: Indicator,
        options: EnrichOptions,
    ) -> Result<EnrichOutcome, EnrichError> {
        let started = Instant::now();
        let config = self.config();

        if !options.force_refresh {
            if let Some(result) = self.cache.get(&indicator) {
                tracing::debug!(indicator = %indicator, "Cache hit, no provider calls");
                return Ok(EnrichOutcome {
                    result,
                    stats: EnrichStats {
                        total_providers: 0,
                        successful_providers: 0,
                        failed_providers: 0,
                        cached_result: true,
                        processing_time_ms: started.elapsed().as_millis() as u64,
                    },
                });
            }
        }

        let providers = self.select_providers(&indicator, &options, &config)?;
        let total_providers = providers.len();
        tracing::info!(
            indicator = %indicator,
            providers = total_providers,
            "Enriching indicator"
        );

        let timeout = Duration::from_millis(config.operation_timeout_ms);
        let fan_out = self.fan_out(&indicator, &providers, config.max_concurrent_providers);
        // Late results arriving after the deadline are dropped with the
        // cancelled future, never merged
        let results = tokio::time::timeout(timeout, fan_out)
            .await
            .map_err(|_| EnrichError::OperationTimeout(config.operation_timeout_ms))?;

        let successful = results.iter().filter(|r| r.success).count();
        if successful < config.min_successful_providers {
            return Err(EnrichError::InsufficientProviders {
                succeeded: successful,
                required: config.min_successful_providers,
            });
        }

        let result = self.fusion.fuse(&indicator, results)?;
        self.cache.set(&indicator, result.clone());

        let stats = EnrichStats {
            total_providers,
            successful_providers: successful,
            failed_providers: total_providers - successful,
            cached_result: false,
            processing_time_ms: started.elapsed().as_millis() as u64,
        };
        histogram!("enrichment_duration_ms").record(stats.processing_time_ms as f64);

        if let Some(sink) = self.sink.read().clone() {
            sink.enriched(&result, &stats);
        }

        Ok(EnrichOutcome { result, stats })
    }

    /// Enrich many indicators concurrently. One indicator's failure
    /// never aborts its siblings.
    pub async fn enrich_batch(&self, items: Vec<(String, IocType)>) -> Vec<BatchItem> {
        let concurrency = self.config().batch_concurrency.max(1);
        stream::iter(items.into_iter().map(|(value, ioc_type)| {
            let indicator = Indicator::new(&value, ioc_type);
            async move {
                let outcome = self
                    .enrich_with(indicator.clone(), EnrichOptions::default())
                    .await;
                BatchItem { indicator, outcome }
            }
        }))
        .buffer_unordered(concurrency)
        .collect()
        .await
    }

    fn select_providers(
        &self,
        indicator: &Indicator,
        options: &EnrichOptions,
        config: &OrchestratorConfig,
    ) -> Result<Vec<Arc<Provider>>, EnrichError> {
        let by_ids = |ids: &[String]| -> Vec<Arc<Provider>> {
            ids.iter()
                .filter_map(|id| self.registry.get(id))
                .filter(|p| p.is_enabled() && p.supports(indicator.ioc_type))
                .collect()
        };

        let providers = if let Some(ids) = &options.providers {
            by_ids(ids)
        } else {
            match &config.selection {
                SelectionStrategy::All => self.registry.supporting(indicator.ioc_type),
                SelectionStrategy::Recommended => self
                    .registry
                    .recommended(indicator.ioc_type)
                    .into_iter()
                    .map(|(p, _)| p)
                    .collect(),
                SelectionStrategy::Custom(ids) => by_ids(ids),
            }
        };

        if providers.is_empty() {
            return Err(EnrichError::NoProvidersAvailable(indicator.ioc_type));
        }
        Ok(providers)
    }

    /// Sequential batches of concurrent provider calls. Individual
    /// failures come back failure-shaped; nothing here panics a batch.
    async fn fan_out(
        &self,
        indicator: &Indicator,
        providers: &[Arc<Provider>],
        batch_size: usize,
    ) -> Vec<ProviderResult> {
        let mut results = Vec::with_capacity(providers.len());
        for batch in providers.chunks(batch_size.max(1)) {
            let calls = batch.iter().map(|p| p.enrich(indicator));
            results.extend(join_all(calls).await);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, EnrichmentCache};
    use crate::fusion::{FusionConfig, WeightTable};
    use crate::models::{Observation, Reputation, Verdict};
    use crate::providers::{IntelSource, ProviderConfig};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubSource {
        id: &'static str,
        score: f64,
        verdict: Verdict,
        fail: bool,
        hang: bool,
        calls: AtomicUsize,
    }

    impl StubSource {
        fn good(id: &'static str, score: f64, verdict: Verdict) -> Arc<Self> {
            Arc::new(Self {
                id,
                score,
                verdict,
                fail: false,
                hang: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn bad(id: &'static str) -> Arc<Self> {
            Arc::new(Self {
                id,
                score: 0.0,
                verdict: Verdict::Unknown,
                fail: true,
                hang: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn hanging(id: &'static str) -> Arc<Self> {
            Arc::new(Self {
                id,
                score: 0.0,
                verdict: Verdict::Unknown,
                fail: false,
                hang: true,
                calls: AtomicUsize::new(0),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl IntelSource for StubSource {
        fn id(&self) -> &str {
            self.id
        }

        fn supported_types(&self) -> &[IocType] {
            &[IocType::Ip, IocType::Domain]
        }

        async fn fetch(&self, _indicator: &Indicator) -> anyhow::Result<Observation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.fail {
                anyhow::bail!("upstream unavailable");
            }
            Ok(Observation {
                reputation: Some(Reputation {
                    score: self.score,
                    verdict: self.verdict,
                    confidence: 0.9,
                }),
                ..Default::default()
            })
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
    }

    fn harness(sources: Vec<Arc<StubSource>>, config: OrchestratorConfig) -> Harness {
        let registry = Arc::new(ProviderRegistry::new());
        for source in sources {
            registry.register(
                source as Arc<dyn IntelSource>,
                ProviderConfig {
                    retry_attempts: 0,
                    ..Default::default()
                },
            );
        }
        let cache = Arc::new(EnrichmentCache::new(CacheConfig {
            ttl_secs: 60,
            ..Default::default()
        }));
        let weights = Arc::new(WeightTable::new());
        let fusion = Arc::new(FusionEngine::new(FusionConfig::default(), weights));
        Harness {
            orchestrator: Orchestrator::new(registry, cache, fusion, config),
        }
    }

    #[tokio::test]
    async fn enrich_fuses_across_providers() {
        let h = harness(
            vec![
                StubSource::good("a", 90.0, Verdict::Malicious),
                StubSource::good("b", 85.0, Verdict::Malicious),
            ],
            OrchestratorConfig::default(),
        );
        let outcome = h.orchestrator.enrich("1.2.3.4", IocType::Ip).await.unwrap();
        assert_eq!(outcome.result.consensus.verdict, Verdict::Malicious);
        assert_eq!(outcome.stats.total_providers, 2);
        assert_eq!(outcome.stats.successful_providers, 2);
        assert!(!outcome.stats.cached_result);
    }

    #[tokio::test]
    async fn second_call_hits_cache_with_zero_provider_calls() {
        let source = StubSource::good("a", 90.0, Verdict::Malicious);
        let h = harness(vec![source.clone()], OrchestratorConfig::default());

        let first = h.orchestrator.enrich("1.2.3.4", IocType::Ip).await.unwrap();
        assert!(!first.stats.cached_result);
        assert_eq!(source.call_count(), 1);

        let second = h.orchestrator.enrich("1.2.3.4", IocType::Ip).await.unwrap();
        assert!(second.stats.cached_result);
        assert_eq!(second.stats.total_providers, 0);
        assert_eq!(source.call_count(), 1);
        assert_eq!(first.result.id, second.result.id);
    }

    #[tokio::test]
    async fn force_refresh_bypasses_cache() {
        let source = StubSource::good("a", 90.0, Verdict::Malicious);
        let h = harness(vec![source.clone()], OrchestratorConfig::default());
        h.orchestrator.enrich("1.2.3.4", IocType::Ip).await.unwrap();
        h.orchestrator
            .enrich_with(
                Indicator::new("1.2.3.4", IocType::Ip),
                EnrichOptions {
                    force_refresh: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(source.call_count(), 2);
    }

    #[tokio::test]
    async fn insufficient_successes_fail_and_skip_cache() {
        let h = harness(
            vec![
                StubSource::good("a", 90.0, Verdict::Malicious),
                StubSource::bad("b"),
                StubSource::bad("c"),
            ],
            OrchestratorConfig {
                min_successful_providers: 2,
                ..Default::default()
            },
        );
        let err = h
            .orchestrator
            .enrich("1.2.3.4", IocType::Ip)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EnrichError::InsufficientProviders { succeeded: 1, required: 2 }
        ));

        // Not cached: a retry consults providers again
        let err = h
            .orchestrator
            .enrich("1.2.3.4", IocType::Ip)
            .await
            .unwrap_err();
        assert!(matches!(err, EnrichError::InsufficientProviders { .. }));
    }

    #[tokio::test]
    async fn partial_failure_is_not_an_error() {
        let h = harness(
            vec![
                StubSource::good("a", 90.0, Verdict::Malicious),
                StubSource::bad("b"),
            ],
            OrchestratorConfig::default(),
        );
        let outcome = h.orchestrator.enrich("1.2.3.4", IocType::Ip).await.unwrap();
        assert_eq!(outcome.stats.failed_providers, 1);
        assert_eq!(outcome.result.aggregation.providers_failed, 1);
    }

    #[tokio::test]
    async fn no_supporting_providers_fails_fast() {
        let h = harness(
            vec![StubSource::good("a", 90.0, Verdict::Malicious)],
            OrchestratorConfig::default(),
        );
        let err = h
            .orchestrator
            .enrich("CVE-2021-44228", IocType::Cve)
            .await
            .unwrap_err();
        assert!(matches!(err, EnrichError::NoProvidersAvailable(IocType::Cve)));
    }

    #[tokio::test(start_paused = true)]
    async fn operation_timeout_bounds_the_whole_run() {
        let h = harness(
            vec![StubSource::hanging("slow")],
            OrchestratorConfig {
                operation_timeout_ms: 500,
                ..Default::default()
            },
        );
        let err = h
            .orchestrator
            .enrich("1.2.3.4", IocType::Ip)
            .await
            .unwrap_err();
        assert!(matches!(err, EnrichError::OperationTimeout(500)));
    }

    #[tokio::test]
    async fn custom_provider_selection_filters_by_support() {
        let a = StubSource::good("a", 90.0, Verdict::Malicious);
        let b = StubSource::good("b", 10.0, Verdict::Benign);
        let h = harness(vec![a.clone(), b.clone()], OrchestratorConfig::default());
        h.orchestrator
            .enrich_with(
                Indicator::new("1.2.3.4", IocType::Ip),
                EnrichOptions {
                    providers: Some(vec!["a".to_string(), "missing".to_string()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(a.call_count(), 1);
        assert_eq!(b.call_count(), 0);
    }

    #[tokio::test]
    async fn batch_isolates_failures() {
        let h = harness(
            vec![StubSource::good("a", 90.0, Verdict::Malicious)],
            OrchestratorConfig::default(),
        );
        let items = vec![
            ("1.2.3.4".to_string(), IocType::Ip),
            ("CVE-2021-44228".to_string(), IocType::Cve), // unsupported
            ("5.6.7.8".to_string(), IocType::Ip),
        ];
        let batch = h.orchestrator.enrich_batch(items).await;
        assert_eq!(batch.len(), 3);
        let ok = batch.iter().filter(|item| item.outcome.is_ok()).count();
        let failed = batch.iter().filter(|item| item.outcome.is_err()).count();
        assert_eq!(ok, 2);
        assert_eq!(failed, 1);
    }

    struct RecordingSink {
        seen: Mutex<Vec<uuid::Uuid>>,
    }

    impl EnrichmentSink for RecordingSink {
        fn enriched(&self, result: &FusedResult, _stats: &EnrichStats) {
            self.seen.lock().push(result.id);
        }
    }

    #[tokio::test]
    async fn sink_receives_every_fresh_result() {
        let h = harness(
            vec![StubSource::good("a", 90.0, Verdict::Malicious)],
            OrchestratorConfig::default(),
        );
        let sink = Arc::new(RecordingSink {
            seen: Mutex::new(vec![]),
        });
        h.orchestrator.set_sink(sink.clone());

        h.orchestrator.enrich("1.2.3.4", IocType::Ip).await.unwrap();
        // Cache hit does not re-emit
        h.orchestrator.enrich("1.2.3.4", IocType::Ip).await.unwrap();
        assert_eq!(sink.seen.lock().len(), 1);
    }
}
