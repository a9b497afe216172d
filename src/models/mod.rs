//! Core data models for enrichment and fusion

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod ioc_utils;

/// Types of Indicators of Compromise
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum IocType {
    Ip,
    Domain,
    Url,
    Hash,
    Email,
    Cve,
}

impl std::fmt::Display for IocType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IocType::Ip => write!(f, "ip"),
            IocType::Domain => write!(f, "domain"),
            IocType::Url => write!(f, "url"),
            IocType::Hash => write!(f, "hash"),
            IocType::Email => write!(f, "email"),
            IocType::Cve => write!(f, "cve"),
        }
    }
}

/// Classification of an indicator, by one provider or by consensus
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Benign,
    Suspicious,
    Malicious,
    Unknown,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Benign => write!(f, "benign"),
            Verdict::Suspicious => write!(f, "suspicious"),
            Verdict::Malicious => write!(f, "malicious"),
            Verdict::Unknown => write!(f, "unknown"),
        }
    }
}

impl Verdict {
    /// Bucket a 0-100 reputation score into a verdict
    pub fn from_score(score: f64) -> Self {
        if score >= 61.0 {
            Verdict::Malicious
        } else if score >= 26.0 {
            Verdict::Suspicious
        } else if score >= 0.0 {
            Verdict::Benign
        } else {
            Verdict::Unknown
        }
    }
}

/// A typed threat indicator. Identity is immutable; value comparison
/// for cache and dedup keys is case-insensitive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Indicator {
    pub value: String,
    pub ioc_type: IocType,
}

impl Indicator {
    /// Create an indicator with a normalized value for the given type
    pub fn new(value: &str, ioc_type: IocType) -> Self {
        Self {
            value: ioc_utils::normalize_ioc(value, ioc_type),
            ioc_type,
        }
    }

    /// Detect the type from the raw value, then normalize
    pub fn detect(value: &str) -> Option<Self> {
        ioc_utils::detect_ioc_type(value).map(|t| Self::new(value, t))
    }

    /// Normalized `(value, type)` key used by the cache and dedup logic
    pub fn cache_key(&self) -> (String, IocType) {
        (self.value.trim().to_lowercase(), self.ioc_type)
    }
}

impl std::fmt::Display for Indicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ioc_type, self.value)
    }
}

/// One provider's reputation assessment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reputation {
    /// Threat score, 0 (clean) to 100 (confirmed malicious)
    pub score: f64,
    pub verdict: Verdict,
    /// Provider's own confidence in the assessment, 0.0-1.0
    pub confidence: f64,
}

/// Geolocation details reported by a provider
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Geolocation {
    pub country: Option<String>,
    pub city: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Network ownership details reported by a provider
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NetworkInfo {
    pub asn: Option<u32>,
    pub as_org: Option<String>,
    pub isp: Option<String>,
    pub usage_type: Option<String>,
}

/// A named threat associated with an indicator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatInfo {
    pub name: String,
    pub category: Option<String>,
    pub confidence: f64,
}

/// Structured metadata from a single provider: typed categories plus a
/// residual map for provider-specific extras.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderMetadata {
    pub geolocation: Option<Geolocation>,
    pub network: Option<NetworkInfo>,
    #[serde(default)]
    pub threats: Vec<ThreatInfo>,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// An indicator related to the one being enriched
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedIndicator {
    pub value: String,
    pub ioc_type: IocType,
    pub relationship: Option<String>,
}

/// One provider's complete answer for one indicator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResult {
    pub success: bool,
    pub provider: String,
    pub reputation: Option<Reputation>,
    #[serde(default)]
    pub metadata: ProviderMetadata,
    #[serde(default)]
    pub related_indicators: Vec<RelatedIndicator>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub references: Vec<String>,
    pub response_time_ms: u64,
    pub cached: bool,
    pub error: Option<String>,
}

impl ProviderResult {
    /// A failure-shaped result; failures are recorded, never thrown
    pub fn failure(provider: &str, error: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            provider: provider.to_string(),
            reputation: None,
            metadata: ProviderMetadata::default(),
            related_indicators: vec![],
            tags: vec![],
            references: vec![],
            response_time_ms: 0,
            cached: false,
            error: Some(error.to_string()),
        }
    }

    /// Valid for aggregation: succeeded with a usable reputation
    pub fn is_valid(&self) -> bool {
        self.success
            && self
                .reputation
                .as_ref()
                .is_some_and(|r| r.score.is_finite())
    }
}

/// The raw answer an [`crate::providers::IntelSource`] produces; the
/// contract wrapper stamps identity and timing around it.
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub reputation: Option<Reputation>,
    pub metadata: ProviderMetadata,
    pub related_indicators: Vec<RelatedIndicator>,
    pub tags: Vec<String>,
    pub references: Vec<String>,
}

/// Consensus computed across providers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consensus {
    pub score: f64,
    pub verdict: Verdict,
    pub confidence: f64,
    /// Fraction of surviving weight behind each verdict; sums to 1,
    /// or 0 when nothing survived the confidence cutoff
    pub distribution: HashMap<Verdict, f64>,
    /// Weight share of the winning verdict, 0.0-1.0
    pub agreement: f64,
    pub provider_count: usize,
}

/// Geolocation after fusion, with corroboration info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusedGeolocation {
    pub country: String,
    pub city: Option<String>,
    pub confidence: f64,
    pub sources: Vec<String>,
}

/// A threat after fusion across providers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusedThreat {
    pub name: String,
    pub category: Option<String>,
    pub confidence: f64,
    pub sources: Vec<String>,
}

/// A related indicator after dedup, with contributing sources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusedRelated {
    pub value: String,
    pub ioc_type: IocType,
    pub relationship: Option<String>,
    pub sources: Vec<String>,
    pub confidence: f64,
}

/// A tag after dedup, with contributing sources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusedTag {
    pub tag: String,
    pub sources: Vec<String>,
    pub count: usize,
}

/// Metadata merged across providers
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FusedMetadata {
    pub geolocation: Option<FusedGeolocation>,
    pub network: Option<NetworkInfo>,
    #[serde(default)]
    pub threats: Vec<FusedThreat>,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Bookkeeping for one aggregation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationMeta {
    pub timestamp: DateTime<Utc>,
    pub processing_time_ms: u64,
    pub providers_used: usize,
    pub providers_succeeded: usize,
    pub providers_failed: usize,
    /// Providers whose verdict differed from the consensus verdict
    pub conflicts_resolved: usize,
}

/// The fused answer for one indicator across all queried providers.
/// Built fresh on every orchestration run, never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusedResult {
    pub id: Uuid,
    pub indicator: Indicator,
    pub consensus: Consensus,
    pub metadata: FusedMetadata,
    #[serde(default)]
    pub related_indicators: Vec<FusedRelated>,
    #[serde(default)]
    pub tags: Vec<FusedTag>,
    pub provider_results: Vec<ProviderResult>,
    pub aggregation: AggregationMeta,
}

impl FusedResult {
    /// Provider results that passed validity checks
    pub fn valid_results(&self) -> impl Iterator<Item = &ProviderResult> {
        self.provider_results.iter().filter(|r| r.is_valid())
    }
}

/// Per-enrichment run statistics returned alongside the fused result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichStats {
    pub total_providers: usize,
    pub successful_providers: usize,
    pub failed_providers: usize,
    pub cached_result: bool,
    pub processing_time_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_case_insensitive() {
        let a = Indicator::new("EVIL.example.COM", IocType::Domain);
        let b = Indicator::new("evil.example.com", IocType::Domain);
        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn score_buckets() {
        assert_eq!(Verdict::from_score(90.0), Verdict::Malicious);
        assert_eq!(Verdict::from_score(40.0), Verdict::Suspicious);
        assert_eq!(Verdict::from_score(5.0), Verdict::Benign);
        assert_eq!(Verdict::from_score(-1.0), Verdict::Unknown);
    }

    #[test]
    fn failed_result_is_invalid() {
        let r = ProviderResult::failure("vt", "timed out");
        assert!(!r.is_valid());
        assert_eq!(r.error.as_deref(), Some("timed out"));
    }

    #[test]
    fn nan_score_is_invalid() {
        let mut r = ProviderResult::failure("vt", "x");
        r.success = true;
        r.error = None;
        r.reputation = Some(Reputation {
            score: f64::NAN,
            verdict: Verdict::Malicious,
            confidence: 0.9,
        });
        assert!(!r.is_valid());
    }
}
