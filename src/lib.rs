//! iocfusion
//!
//! Enriches threat indicators (IPs, domains, URLs, hashes, emails,
//! CVEs) by fanning out to independent, unreliable, rate-limited
//! intelligence providers concurrently, then fusing their conflicting
//! answers into one consensus verdict with a calibrated confidence.
//! Ground-truth feedback adjusts provider trust weights over time.
//!
//! The moving parts, wired together by [`orchestrator::Orchestrator`]:
//!
//! - [`providers`]: the provider contract (rate limiting, retries,
//!   timeouts) and the registry of constructed providers
//! - [`cache`]: a TTL + LRU cache of fused results
//! - [`fusion`]: the consensus/aggregation engine and the shared
//!   provider weight table
//! - [`scoring`]: the adaptive confidence model
//! - [`accuracy`]: the provider accuracy tracker closing the
//!   feedback loop

pub mod accuracy;
pub mod cache;
pub mod error;
pub mod fusion;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod scoring;

pub use accuracy::{AccuracyConfig, AccuracyTracker, ProviderAccuracy, Trend};
pub use cache::{CacheConfig, CacheEntry, CacheStats, EnrichmentCache};
pub use error::{EnrichError, ErrorKind};
pub use fusion::{ConsensusStrategy, FusionConfig, FusionEngine, WeightTable};
pub use models::{
    Consensus, EnrichStats, FusedResult, Indicator, IocType, ProviderResult, Reputation,
    Verdict,
};
pub use orchestrator::{
    BatchItem, EnrichOptions, EnrichOutcome, EnrichmentSink, Orchestrator,
    OrchestratorConfig, SelectionStrategy,
};
pub use providers::registry::{ProviderCallStats, ProviderRegistry};
pub use providers::{IntelSource, Provider, ProviderConfig};
pub use scoring::{
    Assessment, ConfidenceModel, Feedback, MlFeatures, RecommendedAction, ScoringConfig,
};
