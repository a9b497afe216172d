//! Provider contract: the plugin trait every intelligence source
//! implements, and the wrapper that enforces the runtime behavior
//! (rate limiting, retries, timeouts) shared by all of them.

pub mod http;
pub mod rate_limit;
pub mod registry;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::counter;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::EnrichError;
use crate::models::{Indicator, IocType, Observation, ProviderResult};
use rate_limit::{RateLimitConfig, RateLimiter};

/// Trait for intelligence sources. Implementations only answer queries;
/// rate limiting, retries and timeouts live in [`Provider`].
#[async_trait]
pub trait IntelSource: Send + Sync {
    /// Stable provider id, used for weights, stats, and dedup sources
    fn id(&self) -> &str;

    /// One-line description for operators
    fn description(&self) -> &str {
        ""
    }

    /// Indicator types this source can answer for
    fn supported_types(&self) -> &[IocType];

    /// Types this source is particularly good at; drives the
    /// registry's recommended subset
    fn specialties(&self) -> &[IocType] {
        self.supported_types()
    }

    /// Query the source for one indicator
    async fn fetch(&self, indicator: &Indicator) -> anyhow::Result<Observation>;

    /// Cheap connectivity probe
    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Runtime configuration for one wrapped provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub enabled: bool,
    pub rate_limit: RateLimitConfig,
    pub timeout_ms: u64,
    pub retry_attempts: u32,
    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            enabled: true,
            rate_limit: RateLimitConfig::default(),
            timeout_ms: 10_000,
            retry_attempts: 2,
            cache_enabled: true,
            cache_ttl_secs: 3600,
        }
    }
}

/// Outcome of one attempted provider call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
}

/// Observer for provider call outcomes; the registry's statistics
/// implement this. No global event bus.
pub trait ProviderEvents: Send + Sync {
    fn provider_call(&self, provider: &str, outcome: CallOutcome, elapsed_ms: u64);
}

/// Sink that drops all events, for standalone providers
pub struct NoEvents;

impl ProviderEvents for NoEvents {
    fn provider_call(&self, _provider: &str, _outcome: CallOutcome, _elapsed_ms: u64) {}
}

const MAX_BACKOFF_SECS: u64 = 30;

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt).min(MAX_BACKOFF_SECS))
}

/// A wrapped intelligence source enforcing the provider contract.
/// `enrich` never returns an `Err`: every failure is folded into a
/// failure-shaped [`ProviderResult`] so one bad provider can never
/// abort a fan-out.
pub struct Provider {
    id: String,
    source: Arc<dyn IntelSource>,
    config: RwLock<ProviderConfig>,
    limiter: RateLimiter,
    events: Arc<dyn ProviderEvents>,
}

impl Provider {
    pub fn new(
        source: Arc<dyn IntelSource>,
        config: ProviderConfig,
        events: Arc<dyn ProviderEvents>,
    ) -> Self {
        Self {
            id: source.id().to_string(),
            source,
            config: RwLock::new(config),
            limiter: RateLimiter::new(),
            events,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> String {
        self.source.description().to_string()
    }

    pub fn is_enabled(&self) -> bool {
        self.config.read().enabled
    }

    pub fn supports(&self, ioc_type: IocType) -> bool {
        self.source.supported_types().contains(&ioc_type)
    }

    pub fn specializes_in(&self, ioc_type: IocType) -> bool {
        self.source.specialties().contains(&ioc_type)
    }

    pub fn config(&self) -> ProviderConfig {
        self.config.read().clone()
    }

    pub fn update_config(&self, config: ProviderConfig) {
        *self.config.write() = config;
    }

    /// Requests this provider has issued today, for quota dashboards
    pub fn daily_request_count(&self) -> u32 {
        self.limiter.daily_count()
    }

    /// Enrich one indicator under the full contract: fast-fail on
    /// disabled/unsupported, rate-limit check, then retries with
    /// exponential backoff, each try bounded by the configured timeout.
    pub async fn enrich(&self, indicator: &Indicator) -> ProviderResult {
        let cfg = self.config();

        // Config rejections are synchronous and consume no slots
        if !cfg.enabled {
            return ProviderResult::failure(
                &self.id,
                EnrichError::ProviderDisabled(self.id.clone()),
            );
        }
        if !self.supports(indicator.ioc_type) {
            return ProviderResult::failure(
                &self.id,
                EnrichError::UnsupportedIndicator {
                    provider: self.id.clone(),
                    ioc_type: indicator.ioc_type,
                },
            );
        }

        if let Err(hit) = self.limiter.try_acquire(&cfg.rate_limit) {
            tracing::warn!(
                provider = %self.id,
                retry_at = %hit.retry_at,
                "Rate limit exceeded"
            );
            self.emit(CallOutcome::Failure, 0);
            return ProviderResult::failure(
                &self.id,
                EnrichError::RateLimited {
                    provider: self.id.clone(),
                    retry_at: hit.retry_at,
                },
            );
        }

        let timeout = Duration::from_millis(cfg.timeout_ms);
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 0..=cfg.retry_attempts {
            if attempt > 0 {
                // 2^attempt seconds, counted from the first failure;
                // cancellable by dropping the future
                tokio::time::sleep(backoff_delay(attempt - 1)).await;
            }

            let started = Instant::now();
            match tokio::time::timeout(timeout, self.source.fetch(indicator)).await {
                Ok(Ok(observation)) => {
                    let elapsed = started.elapsed().as_millis() as u64;
                    self.emit(CallOutcome::Success, elapsed);
                    return self.stamp(observation, elapsed);
                }
                Ok(Err(e)) => {
                    tracing::debug!(
                        provider = %self.id,
                        attempt,
                        error = %e,
                        "Provider call failed"
                    );
                    last_err = Some(e);
                }
                Err(_) => {
                    tracing::debug!(provider = %self.id, attempt, "Provider call timed out");
                    last_err = Some(
                        EnrichError::Timeout {
                            provider: self.id.clone(),
                            timeout_ms: cfg.timeout_ms,
                        }
                        .into(),
                    );
                }
            }
        }

        let err = last_err.unwrap_or_else(|| anyhow::anyhow!("provider returned no result"));
        tracing::warn!(
            provider = %self.id,
            indicator = %indicator,
            error = %err,
            "Provider failed after retries"
        );
        self.emit(CallOutcome::Failure, 0);
        ProviderResult::failure(
            &self.id,
            EnrichError::Provider {
                provider: self.id.clone(),
                source: err,
            },
        )
    }

    /// Connectivity probe, reported as a plain boolean
    pub async fn test_connection(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let timeout = Duration::from_millis(self.config().timeout_ms);
        matches!(
            tokio::time::timeout(timeout, self.source.ping()).await,
            Ok(Ok(()))
        )
    }

    fn stamp(&self, observation: Observation, elapsed_ms: u64) -> ProviderResult {
        ProviderResult {
            success: true,
            provider: self.id.clone(),
            reputation: observation.reputation,
            metadata: observation.metadata,
            related_indicators: observation.related_indicators,
            tags: observation.tags,
            references: observation.references,
            response_time_ms: elapsed_ms,
            cached: false,
            error: None,
        }
    }

    fn emit(&self, outcome: CallOutcome, elapsed_ms: u64) {
        let label = match outcome {
            CallOutcome::Success => "success",
            CallOutcome::Failure => "failure",
        };
        counter!("provider_calls_total", "provider" => self.id.clone(), "outcome" => label)
            .increment(1);
        self.events.provider_call(&self.id, outcome, elapsed_ms);
    }
}
