//! Adaptive confidence model. Grades a fused result with a fixed
//! reliability score and a learned confidence adjustment, recommends a
//! disposition, and explains which thresholds drove it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::fusion::WeightTable;
use crate::models::{FusedResult, Verdict};

/// Label attached to a training sample by the review workflow
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Feedback {
    Correct,
    Incorrect,
    Uncertain,
}

/// What the model recommends doing with a fused result
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RecommendedAction {
    Accept,
    Review,
    ReEnrich,
}

/// Feature vector derived from a fused result; a pure function of the
/// result and the provider-weight snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MlFeatures {
    pub provider_agreement: f64,
    pub verdict_consistency: f64,
    pub score_variance: f64,
    pub avg_confidence: f64,
    pub max_confidence: f64,
    pub min_confidence: f64,
    pub metadata_completeness: f64,
    pub related_count: f64,
    pub threat_count: f64,
    pub tag_count: f64,
    pub provider_count: f64,
    pub high_trust_count: f64,
}

impl MlFeatures {
    /// Feature values normalized into `[0,1]`, oriented so higher
    /// means "more likely correct"
    pub fn normalized(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("provider_agreement", self.provider_agreement.clamp(0.0, 1.0)),
            ("verdict_consistency", self.verdict_consistency.clamp(0.0, 1.0)),
            // Max possible variance for 0-100 scores is 2500
            ("score_stability", 1.0 - (self.score_variance / 2500.0).min(1.0)),
            ("avg_confidence", self.avg_confidence.clamp(0.0, 1.0)),
            ("max_confidence", self.max_confidence.clamp(0.0, 1.0)),
            ("min_confidence", self.min_confidence.clamp(0.0, 1.0)),
            ("metadata_completeness", self.metadata_completeness.clamp(0.0, 1.0)),
            ("related_count", (self.related_count / 10.0).min(1.0)),
            ("threat_count", (self.threat_count / 5.0).min(1.0)),
            ("tag_count", (self.tag_count / 10.0).min(1.0)),
            ("provider_count", (self.provider_count / 5.0).min(1.0)),
            ("high_trust_count", (self.high_trust_count / 3.0).min(1.0)),
        ]
    }
}

/// One labeled outcome; appended, never mutated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSample {
    pub features: MlFeatures,
    pub actual_verdict: Verdict,
    pub feedback: Feedback,
    pub timestamp: DateTime<Utc>,
}

/// The model's verdict on a fused result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assessment {
    pub confidence_score: f64,
    pub reliability_score: f64,
    pub recommended_action: RecommendedAction,
    pub reasoning: Vec<String>,
}

/// Runtime-mutable scoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub learning_rate: f64,
    pub min_training_samples: usize,
    pub review_threshold: f64,
    /// Providers at or above this weight count as high-trust
    pub high_trust_weight: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.2,
            min_training_samples: 20,
            review_threshold: 0.6,
            high_trust_weight: 0.7,
        }
    }
}

/// Extract the feature vector from a fused result
pub fn extract_features(
    fused: &FusedResult,
    weights: &HashMap<String, f64>,
    high_trust_weight: f64,
) -> MlFeatures {
    let valid: Vec<_> = fused.valid_results().collect();
    let n = valid.len();

    let (verdict_consistency, score_variance, avg_c, max_c, min_c) = if n > 0 {
        let mut verdict_votes: HashMap<Verdict, usize> = HashMap::new();
        let mut scores = Vec::with_capacity(n);
        let mut confs = Vec::with_capacity(n);
        for r in &valid {
            let Some(rep) = r.reputation.as_ref() else {
                continue;
            };
            *verdict_votes.entry(rep.verdict).or_insert(0) += 1;
            scores.push(rep.score);
            confs.push(rep.confidence);
        }
        let modal = verdict_votes.values().max().copied().unwrap_or(0);
        let mean = scores.iter().sum::<f64>() / n as f64;
        let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n as f64;
        let avg_c = confs.iter().sum::<f64>() / n as f64;
        let max_c = confs.iter().cloned().fold(f64::MIN, f64::max);
        let min_c = confs.iter().cloned().fold(f64::MAX, f64::min);
        (modal as f64 / n as f64, variance, avg_c, max_c, min_c)
    } else {
        (0.0, 0.0, 0.0, 0.0, 0.0)
    };

    let metadata_completeness = if n > 0 {
        valid
            .iter()
            .map(|r| {
                let m = &r.metadata;
                let present = [
                    m.geolocation.is_some(),
                    m.network.is_some(),
                    !m.threats.is_empty(),
                    m.first_seen.is_some() || m.last_seen.is_some(),
                ]
                .iter()
                .filter(|p| **p)
                .count();
                present as f64 / 4.0
            })
            .sum::<f64>()
            / n as f64
    } else {
        0.0
    };

    let high_trust_count = valid
        .iter()
        .filter(|r| {
            weights
                .get(&r.provider)
                .copied()
                .unwrap_or(crate::fusion::DEFAULT_PROVIDER_WEIGHT)
                >= high_trust_weight
        })
        .count();

    MlFeatures {
        provider_agreement: fused.consensus.agreement,
        verdict_consistency,
        score_variance,
        avg_confidence: avg_c,
        max_confidence: max_c,
        min_confidence: min_c,
        metadata_completeness,
        related_count: fused.related_indicators.len() as f64,
        threat_count: fused.metadata.threats.len() as f64,
        tag_count: fused.tags.len() as f64,
        provider_count: n as f64,
        high_trust_count: high_trust_count as f64,
    }
}

/// Confidence model: fixed reliability floor plus a feature-weighted
/// confidence adjustment once trained
pub struct ConfidenceModel {
    config: RwLock<ScoringConfig>,
    samples: RwLock<Vec<TrainingSample>>,
    importances: RwLock<Option<HashMap<&'static str, f64>>>,
    weights: Arc<WeightTable>,
}

impl ConfidenceModel {
    pub fn new(config: ScoringConfig, weights: Arc<WeightTable>) -> Self {
        Self {
            config: RwLock::new(config),
            samples: RwLock::new(Vec::new()),
            importances: RwLock::new(None),
            weights,
        }
    }

    pub fn config(&self) -> ScoringConfig {
        self.config.read().clone()
    }

    pub fn update_config(&self, config: ScoringConfig) {
        *self.config.write() = config;
    }

    pub fn is_trained(&self) -> bool {
        self.importances.read().is_some()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.read().len()
    }

    /// Score a fused result; also returns the reasoning behind the
    /// recommended action for explainability
    pub fn score(&self, fused: &FusedResult) -> Assessment {
        let cfg = self.config();
        let weight_snapshot = self.weights.snapshot();
        let features = extract_features(fused, &weight_snapshot, cfg.high_trust_weight);

        // Reliability is a stability floor and is never learned
        let score_stability = 1.0 - (features.score_variance / 2500.0).min(1.0);
        let provider_factor = (features.provider_count / 5.0).min(1.0);
        let reliability_score = (0.3 * features.provider_agreement
            + 0.25 * features.verdict_consistency
            + 0.2 * score_stability
            + 0.15 * features.avg_confidence
            + 0.1 * provider_factor)
            .clamp(0.0, 1.0);

        let mut confidence_score = fused.consensus.confidence;
        if let Some(importances) = self.importances.read().as_ref() {
            let normalized = features.normalized();
            let total: f64 = importances.values().sum();
            if total > 0.0 {
                let weighted: f64 = normalized
                    .iter()
                    .map(|(name, value)| importances.get(name).copied().unwrap_or(0.0) * value)
                    .sum();
                let feature_score = weighted / total;
                confidence_score += (feature_score - 0.5) * cfg.learning_rate;
            }
        }
        let confidence_score = confidence_score.clamp(0.0, 1.0);

        let mut reasoning = Vec::new();
        let succeeded = fused.aggregation.providers_succeeded;

        // A lone provider is never trusted outright, whatever it scored
        let recommended_action = if succeeded <= 1 {
            reasoning.push("only one provider succeeded".to_string());
            RecommendedAction::ReEnrich
        } else if confidence_score >= 0.8 && reliability_score >= 0.8 {
            reasoning.push(format!(
                "confidence {:.2} and reliability {:.2} both clear the accept bar",
                confidence_score, reliability_score
            ));
            RecommendedAction::Accept
        } else if confidence_score < 0.4 || reliability_score < 0.4 {
            if confidence_score < 0.4 {
                reasoning.push(format!("confidence {:.2} is below 0.40", confidence_score));
            }
            if reliability_score < 0.4 {
                reasoning.push(format!("reliability {:.2} is below 0.40", reliability_score));
            }
            RecommendedAction::ReEnrich
        } else if features.provider_agreement < 0.5
            || features.verdict_consistency < 0.5
            || features.score_variance > 30.0
        {
            if features.provider_agreement < 0.5 {
                reasoning.push(format!(
                    "provider agreement {:.2} is below 0.50",
                    features.provider_agreement
                ));
            }
            if features.verdict_consistency < 0.5 {
                reasoning.push(format!(
                    "verdict consistency {:.2} is below 0.50",
                    features.verdict_consistency
                ));
            }
            if features.score_variance > 30.0 {
                reasoning.push(format!(
                    "score variance {:.1} exceeds 30",
                    features.score_variance
                ));
            }
            RecommendedAction::Review
        } else if confidence_score < cfg.review_threshold {
            reasoning.push(format!(
                "confidence {:.2} is below the review threshold {:.2}",
                confidence_score, cfg.review_threshold
            ));
            RecommendedAction::Review
        } else {
            reasoning.push("thresholds satisfied".to_string());
            RecommendedAction::Accept
        };

        Assessment {
            confidence_score,
            reliability_score,
            recommended_action,
            reasoning,
        }
    }

    /// Append a labeled sample; retrains once the accumulated samples
    /// reach the configured threshold
    pub fn add_training_data(&self, fused: &FusedResult, feedback: Feedback) {
        let cfg = self.config();
        let weight_snapshot = self.weights.snapshot();
        let sample = TrainingSample {
            features: extract_features(fused, &weight_snapshot, cfg.high_trust_weight),
            actual_verdict: fused.consensus.verdict,
            feedback,
            timestamp: Utc::now(),
        };
        let count = {
            let mut samples = self.samples.write();
            samples.push(sample);
            samples.len()
        };
        if count >= cfg.min_training_samples {
            self.retrain();
        }
    }

    /// Recompute feature importances as the normalized absolute gap
    /// between a feature's mean over correct vs incorrect samples.
    /// Skipped unless both label classes are present.
    fn retrain(&self) {
        let samples = self.samples.read();
        let correct: Vec<_> = samples
            .iter()
            .filter(|s| s.feedback == Feedback::Correct)
            .collect();
        let incorrect: Vec<_> = samples
            .iter()
            .filter(|s| s.feedback == Feedback::Incorrect)
            .collect();
        if correct.is_empty() || incorrect.is_empty() {
            tracing::debug!(
                correct = correct.len(),
                incorrect = incorrect.len(),
                "Retrain skipped, need both label classes"
            );
            return;
        }

        let mean_of = |set: &[&TrainingSample]| -> HashMap<&'static str, f64> {
            let mut sums: HashMap<&'static str, f64> = HashMap::new();
            for sample in set {
                for (name, value) in sample.features.normalized() {
                    *sums.entry(name).or_insert(0.0) += value;
                }
            }
            sums.into_iter()
                .map(|(name, sum)| (name, sum / set.len() as f64))
                .collect()
        };

        let correct_means = mean_of(&correct);
        let incorrect_means = mean_of(&incorrect);

        let mut gaps: HashMap<&'static str, f64> = HashMap::new();
        for (name, c_mean) in &correct_means {
            let i_mean = incorrect_means.get(name).copied().unwrap_or(0.0);
            gaps.insert(*name, (c_mean - i_mean).abs());
        }
        let total: f64 = gaps.values().sum();
        let importances = if total > 0.0 {
            gaps.into_iter().map(|(k, v)| (k, v / total)).collect()
        } else {
            // No separating signal; keep every feature equal
            let n = correct_means.len() as f64;
            correct_means.keys().map(|k| (*k, 1.0 / n)).collect()
        };

        tracing::info!(
            samples = samples.len(),
            "Confidence model retrained"
        );
        *self.importances.write() = Some(importances);
    }

    /// Current feature importances, if trained
    pub fn importances(&self) -> Option<HashMap<&'static str, f64>> {
        self.importances.read().clone()
    }
}
