//! Provider accuracy tracker. Accumulates (predicted, actual) verdict
//! pairs per provider, computes calibration and trend, and feeds a
//! smoothed recommended trust weight back into the shared weight table
//! consumed by the next aggregation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::fusion::WeightTable;
use crate::models::{FusedResult, Verdict};

/// Runtime-mutable tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccuracyConfig {
    /// Feedback rows required before a recommendation is emitted
    pub min_samples: usize,
    /// Rows per window when classifying the trend
    pub trend_window: usize,
    /// Maximum weight movement per recomputation
    pub weight_adjustment_rate: f64,
}

impl Default for AccuracyConfig {
    fn default() -> Self {
        Self {
            min_samples: 10,
            trend_window: 10,
            weight_adjustment_rate: 0.1,
        }
    }
}

/// Direction a provider's recent accuracy is moving
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
}

/// One recorded outcome for one provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRow {
    pub predicted: Verdict,
    pub actual: Verdict,
    pub confidence: f64,
    pub correct: bool,
    pub timestamp: DateTime<Utc>,
}

/// Accuracy within one predicted-verdict bucket
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VerdictAccuracy {
    pub predictions: u64,
    pub correct: u64,
}

impl VerdictAccuracy {
    pub fn accuracy(&self) -> f64 {
        if self.predictions == 0 {
            0.0
        } else {
            self.correct as f64 / self.predictions as f64
        }
    }
}

/// Computed accuracy profile for one provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderAccuracy {
    pub provider: String,
    pub total: u64,
    pub correct: u64,
    pub incorrect: u64,
    pub accuracy: f64,
    pub per_verdict: HashMap<Verdict, VerdictAccuracy>,
    pub avg_confidence: f64,
    /// 1.0 means stated confidence perfectly predicts correctness
    pub calibration: f64,
    pub trend: Trend,
    pub recommended_weight: f64,
    pub last_updated: DateTime<Utc>,
}

const CALIBRATION_BINS: usize = 5;
const TREND_THRESHOLD_POINTS: f64 = 5.0;

/// The tracker: per-provider feedback history plus computed records
pub struct AccuracyTracker {
    config: RwLock<AccuracyConfig>,
    history: RwLock<HashMap<String, Vec<FeedbackRow>>>,
    records: RwLock<HashMap<String, ProviderAccuracy>>,
    weights: Arc<WeightTable>,
}

impl AccuracyTracker {
    pub fn new(config: AccuracyConfig, weights: Arc<WeightTable>) -> Self {
        Self {
            config: RwLock::new(config),
            history: RwLock::new(HashMap::new()),
            records: RwLock::new(HashMap::new()),
            weights,
        }
    }

    pub fn config(&self) -> AccuracyConfig {
        self.config.read().clone()
    }

    pub fn update_config(&self, config: AccuracyConfig) {
        *self.config.write() = config;
    }

    /// Record ground truth for a fused result. Every provider that
    /// contributed a valid result gets a feedback row; providers over
    /// the sample threshold are recomputed.
    pub fn record_feedback(&self, fused: &FusedResult, actual: Verdict) {
        let now = Utc::now();
        let cfg = self.config();
        let mut due: Vec<String> = Vec::new();

        {
            let mut history = self.history.write();
            for result in fused.valid_results() {
                let Some(rep) = result.reputation.as_ref() else {
                    continue;
                };
                let rows = history.entry(result.provider.clone()).or_default();
                rows.push(FeedbackRow {
                    predicted: rep.verdict,
                    actual,
                    confidence: rep.confidence,
                    correct: rep.verdict == actual,
                    timestamp: now,
                });
                if rows.len() >= cfg.min_samples {
                    due.push(result.provider.clone());
                }
            }
        }

        for provider in due {
            self.recompute(&provider, &cfg);
        }
    }

    /// Computed profile for one provider, if enough feedback exists
    pub fn accuracy(&self, provider: &str) -> Option<ProviderAccuracy> {
        self.records.read().get(provider).cloned()
    }

    pub fn all_records(&self) -> HashMap<String, ProviderAccuracy> {
        self.records.read().clone()
    }

    pub fn feedback_count(&self, provider: &str) -> usize {
        self.history.read().get(provider).map_or(0, |r| r.len())
    }

    fn recompute(&self, provider: &str, cfg: &AccuracyConfig) {
        let history = self.history.read();
        let Some(rows) = history.get(provider) else {
            return;
        };

        let total = rows.len() as u64;
        let correct = rows.iter().filter(|r| r.correct).count() as u64;
        let accuracy = correct as f64 / total as f64;

        let mut per_verdict: HashMap<Verdict, VerdictAccuracy> = HashMap::new();
        for row in rows {
            let bucket = per_verdict.entry(row.predicted).or_default();
            bucket.predictions += 1;
            if row.correct {
                bucket.correct += 1;
            }
        }

        let avg_confidence = rows.iter().map(|r| r.confidence).sum::<f64>() / total as f64;
        let calibration = calibration_score(rows);
        let trend = classify_trend(rows, cfg.trend_window);

        // Accuracy adjusted for calibration quality and trend, then
        // smoothed so one bad batch cannot swing the weight
        let mut target = accuracy;
        if calibration >= 0.8 {
            target *= 1.1;
        } else if calibration < 0.5 {
            target *= 0.9;
        }
        match trend {
            Trend::Improving => target *= 1.05,
            Trend::Declining => target *= 0.95,
            Trend::Stable => {}
        }
        let target = target.clamp(0.0, 1.0);

        let previous = self
            .records
            .read()
            .get(provider)
            .map(|r| r.recommended_weight)
            .or_else(|| self.weights.get(provider))
            .unwrap_or(crate::fusion::DEFAULT_PROVIDER_WEIGHT);
        let step = (target - previous).clamp(
            -cfg.weight_adjustment_rate,
            cfg.weight_adjustment_rate,
        );
        let recommended_weight = (previous + step).clamp(0.0, 1.0);

        drop(history);

        tracing::debug!(
            provider,
            accuracy,
            calibration,
            ?trend,
            recommended_weight,
            "Provider accuracy recomputed"
        );

        self.weights.set(provider, recommended_weight);
        self.records.write().insert(
            provider.to_string(),
            ProviderAccuracy {
                provider: provider.to_string(),
                total,
                correct,
                incorrect: total - correct,
                accuracy,
                per_verdict,
                avg_confidence,
                calibration,
                trend,
                recommended_weight,
                last_updated: Utc::now(),
            },
        );
    }
}

/// Binned calibration: how well stated confidence predicts empirical
/// correctness. Lower binning error means better calibration.
fn calibration_score(rows: &[FeedbackRow]) -> f64 {
    let mut bins: Vec<(f64, u64, u64)> = vec![(0.0, 0, 0); CALIBRATION_BINS];
    for row in rows {
        let idx = ((row.confidence * CALIBRATION_BINS as f64) as usize)
            .min(CALIBRATION_BINS - 1);
        let bin = &mut bins[idx];
        bin.0 += row.confidence;
        bin.1 += 1;
        if row.correct {
            bin.2 += 1;
        }
    }

    let total = rows.len() as f64;
    let mut error = 0.0;
    for (conf_sum, count, correct) in bins {
        if count == 0 {
            continue;
        }
        let mean_conf = conf_sum / count as f64;
        let empirical = correct as f64 / count as f64;
        error += (count as f64 / total) * (mean_conf - empirical).abs();
    }
    (1.0 - error).clamp(0.0, 1.0)
}

/// Compare the latest window against the prior one; a swing of five
/// accuracy points or more flips the trend.
fn classify_trend(rows: &[FeedbackRow], window: usize) -> Trend {
    if window == 0 || rows.len() < window * 2 {
        return Trend::Stable;
    }
    let recent = &rows[rows.len() - window..];
    let prior = &rows[rows.len() - window * 2..rows.len() - window];
    let rate = |set: &[FeedbackRow]| {
        set.iter().filter(|r| r.correct).count() as f64 / set.len() as f64 * 100.0
    };
    let delta = rate(recent) - rate(prior);
    if delta >= TREND_THRESHOLD_POINTS {
        Trend::Improving
    } else if delta <= -TREND_THRESHOLD_POINTS {
        Trend::Declining
    } else {
        Trend::Stable
    }
}
