//! Aggregation engine: reconciles disagreeing provider answers into
//! one consensus verdict with a calibrated confidence, merged
//! metadata, and deduplicated related indicators and tags.
//!
//! `fuse_with` is a pure function of its inputs and a provider-weight
//! snapshot; aggregating the same results twice yields identical
//! consensus values.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EnrichError;
use crate::models::{
    AggregationMeta, Consensus, FusedGeolocation, FusedMetadata, FusedRelated, FusedResult,
    FusedTag, FusedThreat, Indicator, NetworkInfo, ProviderResult, Verdict,
};

/// Weight assumed anywhere a provider has no learned weight yet
pub const DEFAULT_PROVIDER_WEIGHT: f64 = 0.5;

/// Shared provider trust weights in `[0,1]`. Aggregation reads an
/// immutable snapshot so a weight update landing mid-fusion can never
/// corrupt an in-flight computation.
#[derive(Default)]
pub struct WeightTable {
    weights: RwLock<HashMap<String, f64>>,
}

impl WeightTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_weights(weights: HashMap<String, f64>) -> Self {
        Self {
            weights: RwLock::new(weights),
        }
    }

    pub fn snapshot(&self) -> HashMap<String, f64> {
        self.weights.read().clone()
    }

    pub fn get(&self, provider: &str) -> Option<f64> {
        self.weights.read().get(provider).copied()
    }

    pub fn set(&self, provider: &str, weight: f64) {
        self.weights
            .write()
            .insert(provider.to_string(), weight.clamp(0.0, 1.0));
    }
}

/// How the consensus verdict is chosen
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConsensusStrategy {
    /// Highest weight-sum verdict bucket
    Weighted,
    /// Verdict backed by the most providers, weights ignored
    Majority,
    /// Verdict of the single most confident provider
    HighestConfidence,
}

/// Runtime-mutable fusion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    pub strategy: ConsensusStrategy,
    /// Providers below this confidence do not vote
    pub min_confidence_threshold: f64,
    /// Weight assumed for providers absent from the weight table
    pub default_provider_weight: f64,
    /// Keep failed results in the returned provider list
    pub include_failed: bool,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            strategy: ConsensusStrategy::Weighted,
            min_confidence_threshold: 0.2,
            default_provider_weight: DEFAULT_PROVIDER_WEIGHT,
            include_failed: true,
        }
    }
}

/// Tie-break ordering: prefer the more severe verdict
fn severity_rank(verdict: Verdict) -> u8 {
    match verdict {
        Verdict::Malicious => 3,
        Verdict::Suspicious => 2,
        Verdict::Benign => 1,
        Verdict::Unknown => 0,
    }
}

/// The aggregation engine: configuration plus the shared weight table
pub struct FusionEngine {
    config: RwLock<FusionConfig>,
    weights: Arc<WeightTable>,
}

impl FusionEngine {
    pub fn new(config: FusionConfig, weights: Arc<WeightTable>) -> Self {
        Self {
            config: RwLock::new(config),
            weights,
        }
    }

    pub fn config(&self) -> FusionConfig {
        self.config.read().clone()
    }

    pub fn update_config(&self, config: FusionConfig) {
        *self.config.write() = config;
    }

    pub fn weights(&self) -> Arc<WeightTable> {
        self.weights.clone()
    }

    /// Fuse one fan-out's worth of provider results
    pub fn fuse(
        &self,
        indicator: &Indicator,
        results: Vec<ProviderResult>,
    ) -> Result<FusedResult, EnrichError> {
        let config = self.config();
        let weights = self.weights.snapshot();
        fuse_with(indicator, results, &config, &weights)
    }
}

/// Pure fusion over a fixed config and weight snapshot
pub fn fuse_with(
    indicator: &Indicator,
    results: Vec<ProviderResult>,
    config: &FusionConfig,
    weights: &HashMap<String, f64>,
) -> Result<FusedResult, EnrichError> {
    let started = Instant::now();

    let valid: Vec<&ProviderResult> = results.iter().filter(|r| r.is_valid()).collect();
    if valid.is_empty() {
        return Err(EnrichError::NoValidResults);
    }

    let surviving: Vec<&ProviderResult> = valid
        .iter()
        .copied()
        .filter(|r| {
            r.reputation
                .as_ref()
                .is_some_and(|rep| rep.confidence >= config.min_confidence_threshold)
        })
        .collect();

    let consensus = compute_consensus(&surviving, config, weights);

    // Unanimity means nothing needed resolving
    let conflicts_resolved = if consensus.provider_count == 0 {
        0
    } else {
        valid
            .iter()
            .filter(|r| {
                r.reputation
                    .as_ref()
                    .is_some_and(|rep| rep.verdict != consensus.verdict)
            })
            .count()
    };

    let metadata = merge_metadata(&valid);
    let related_indicators = merge_related(&valid);
    let tags = merge_tags(&valid);

    let providers_used = results.len();
    let providers_succeeded = results.iter().filter(|r| r.success).count();
    let providers_failed = providers_used - providers_succeeded;

    let provider_results = if config.include_failed {
        results
    } else {
        results.into_iter().filter(|r| r.success).collect()
    };

    Ok(FusedResult {
        id: Uuid::new_v4(),
        indicator: indicator.clone(),
        consensus,
        metadata,
        related_indicators,
        tags,
        provider_results,
        aggregation: AggregationMeta {
            timestamp: Utc::now(),
            processing_time_ms: started.elapsed().as_millis() as u64,
            providers_used,
            providers_succeeded,
            providers_failed,
            conflicts_resolved,
        },
    })
}

fn provider_weight(weights: &HashMap<String, f64>, config: &FusionConfig, id: &str) -> f64 {
    weights.get(id).copied().unwrap_or(config.default_provider_weight)
}

fn compute_consensus(
    surviving: &[&ProviderResult],
    config: &FusionConfig,
    weights: &HashMap<String, f64>,
) -> Consensus {
    if surviving.is_empty() {
        return Consensus {
            score: 0.0,
            verdict: Verdict::Unknown,
            confidence: 0.0,
            distribution: HashMap::new(),
            agreement: 0.0,
            provider_count: 0,
        };
    }

    let mut total_weight = 0.0;
    let mut score_sum = 0.0;
    let mut verdict_weight: HashMap<Verdict, f64> = HashMap::new();
    let mut verdict_conf_weight: HashMap<Verdict, f64> = HashMap::new();
    let mut verdict_votes: HashMap<Verdict, usize> = HashMap::new();

    for result in surviving {
        let Some(rep) = result.reputation.as_ref() else {
            continue;
        };
        let weight = provider_weight(weights, config, &result.provider);
        total_weight += weight;
        score_sum += weight * rep.score;
        *verdict_weight.entry(rep.verdict).or_insert(0.0) += weight;
        *verdict_conf_weight.entry(rep.verdict).or_insert(0.0) += weight * rep.confidence;
        *verdict_votes.entry(rep.verdict).or_insert(0) += 1;
    }

    let verdict = match config.strategy {
        ConsensusStrategy::Weighted => verdict_weight
            .iter()
            .max_by(|(va, wa), (vb, wb)| {
                wa.partial_cmp(wb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(severity_rank(**va).cmp(&severity_rank(**vb)))
            })
            .map(|(v, _)| *v)
            .unwrap_or(Verdict::Unknown),
        ConsensusStrategy::Majority => verdict_votes
            .iter()
            .max_by(|(va, ca), (vb, cb)| {
                ca.cmp(cb).then(severity_rank(**va).cmp(&severity_rank(**vb)))
            })
            .map(|(v, _)| *v)
            .unwrap_or(Verdict::Unknown),
        ConsensusStrategy::HighestConfidence => surviving
            .iter()
            .max_by(|a, b| {
                let ca = a.reputation.as_ref().map_or(0.0, |rep| rep.confidence);
                let cb = b.reputation.as_ref().map_or(0.0, |rep| rep.confidence);
                ca.partial_cmp(&cb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .and_then(|r| r.reputation.as_ref())
            .map(|rep| rep.verdict)
            .unwrap_or(Verdict::Unknown),
    };

    let agreement = if total_weight > 0.0 {
        verdict_weight.get(&verdict).copied().unwrap_or(0.0) / total_weight
    } else {
        0.0
    };

    // Weight-weighted mean confidence of the winning bucket, discounted
    // by agreement; together these reduce to the winner's confidence
    // mass over the total weight
    let confidence = if total_weight > 0.0 {
        verdict_conf_weight.get(&verdict).copied().unwrap_or(0.0) / total_weight
    } else {
        0.0
    };

    let distribution = if total_weight > 0.0 {
        verdict_weight
            .into_iter()
            .map(|(v, w)| (v, w / total_weight))
            .collect()
    } else {
        HashMap::new()
    };

    Consensus {
        score: if total_weight > 0.0 { score_sum / total_weight } else { 0.0 },
        verdict,
        confidence: confidence.clamp(0.0, 1.0),
        distribution,
        agreement,
        provider_count: surviving.len(),
    }
}

fn merge_metadata(valid: &[&ProviderResult]) -> FusedMetadata {
    // Geolocation: most frequently reported country wins, ties broken
    // by first encountered
    let mut country_order: Vec<String> = Vec::new();
    let mut country_counts: HashMap<String, usize> = HashMap::new();
    let mut country_sources: HashMap<String, Vec<String>> = HashMap::new();
    let mut cities: HashMap<String, String> = HashMap::new();
    let mut reporting = 0usize;

    for result in valid {
        if let Some(geo) = &result.metadata.geolocation {
            if let Some(country) = &geo.country {
                reporting += 1;
                let key = country.to_uppercase();
                if !country_counts.contains_key(&key) {
                    country_order.push(key.clone());
                }
                *country_counts.entry(key.clone()).or_insert(0) += 1;
                country_sources
                    .entry(key.clone())
                    .or_default()
                    .push(result.provider.clone());
                if let Some(city) = &geo.city {
                    cities.entry(key).or_insert_with(|| city.clone());
                }
            }
        }
    }

    let geolocation = country_order
        .iter()
        .enumerate()
        .max_by_key(|(idx, c)| {
            // Reverse(idx) breaks count ties toward the first reported
            (
                country_counts.get(*c).copied().unwrap_or(0),
                std::cmp::Reverse(*idx),
            )
        })
        .map(|(_, winner)| FusedGeolocation {
            country: winner.clone(),
            city: cities.get(winner).cloned(),
            confidence: country_counts[winner] as f64 / reporting as f64,
            sources: country_sources.remove(winner).unwrap_or_default(),
        });

    // Network: first non-null wins, field by field
    let mut network = NetworkInfo::default();
    let mut any_network = false;
    for result in valid {
        if let Some(net) = &result.metadata.network {
            any_network = true;
            if network.asn.is_none() {
                network.asn = net.asn;
            }
            if network.as_org.is_none() {
                network.as_org = net.as_org.clone();
            }
            if network.isp.is_none() {
                network.isp = net.isp.clone();
            }
            if network.usage_type.is_none() {
                network.usage_type = net.usage_type.clone();
            }
        }
    }

    // Threats: dedup by normalized name; corroboration boosts confidence
    let mut threat_order: Vec<String> = Vec::new();
    let mut threats: HashMap<String, FusedThreat> = HashMap::new();
    let mut threat_confidences: HashMap<String, Vec<f64>> = HashMap::new();
    for result in valid {
        for threat in &result.metadata.threats {
            let key = threat.name.trim().to_lowercase();
            threat_confidences.entry(key.clone()).or_default().push(threat.confidence);
            let entry = threats.entry(key.clone()).or_insert_with(|| {
                threat_order.push(key.clone());
                FusedThreat {
                    name: threat.name.clone(),
                    category: threat.category.clone(),
                    confidence: 0.0,
                    sources: vec![],
                }
            });
            if entry.category.is_none() {
                entry.category = threat.category.clone();
            }
            if !entry.sources.contains(&result.provider) {
                entry.sources.push(result.provider.clone());
            }
        }
    }
    let threats = threat_order
        .iter()
        .filter_map(|key| {
            let mut threat = threats.remove(key)?;
            let confs = threat_confidences.get(key)?;
            let avg = confs.iter().sum::<f64>() / confs.len() as f64;
            let boost = 0.1 * (threat.sources.len().saturating_sub(1)) as f64;
            threat.confidence = (avg + boost).min(1.0);
            Some(threat)
        })
        .collect();

    let first_seen = valid.iter().filter_map(|r| r.metadata.first_seen).min();
    let last_seen = valid.iter().filter_map(|r| r.metadata.last_seen).max();

    FusedMetadata {
        geolocation,
        network: any_network.then_some(network),
        threats,
        first_seen,
        last_seen,
    }
}

fn merge_related(valid: &[&ProviderResult]) -> Vec<FusedRelated> {
    let mut order: Vec<(String, crate::models::IocType)> = Vec::new();
    let mut merged: HashMap<(String, crate::models::IocType), FusedRelated> = HashMap::new();

    for result in valid {
        for related in &result.related_indicators {
            let key = (related.value.trim().to_lowercase(), related.ioc_type);
            let entry = merged.entry(key.clone()).or_insert_with(|| {
                order.push(key.clone());
                FusedRelated {
                    value: related.value.clone(),
                    ioc_type: related.ioc_type,
                    relationship: related.relationship.clone(),
                    sources: vec![],
                    confidence: 0.5,
                }
            });
            if entry.relationship.is_none() {
                entry.relationship = related.relationship.clone();
            }
            if !entry.sources.contains(&result.provider) {
                entry.sources.push(result.provider.clone());
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| {
            let mut related = merged.remove(&key)?;
            let boost = 0.1 * (related.sources.len().saturating_sub(1)) as f64;
            related.confidence = (0.5 + boost).min(1.0);
            Some(related)
        })
        .collect()
}

fn merge_tags(valid: &[&ProviderResult]) -> Vec<FusedTag> {
    let mut order: Vec<String> = Vec::new();
    let mut merged: HashMap<String, FusedTag> = HashMap::new();

    for result in valid {
        for tag in &result.tags {
            let key = tag.trim().to_lowercase();
            if key.is_empty() {
                continue;
            }
            let entry = merged.entry(key.clone()).or_insert_with(|| {
                order.push(key.clone());
                FusedTag {
                    tag: key.clone(),
                    sources: vec![],
                    count: 0,
                }
            });
            if !entry.sources.contains(&result.provider) {
                entry.sources.push(result.provider.clone());
                entry.count += 1;
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| merged.remove(&key))
        .collect()
}
