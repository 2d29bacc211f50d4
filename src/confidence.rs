// Confidence metering. The score is a weighted blend of evidence
// characteristics; weights live in a versioned config file and can be
// re-tuned offline from user feedback.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::query_metrics::QueryMetric;
use crate::types::FeedbackRating;

/// Citation count at which the citation factor saturates.
pub const CITATION_SATURATION: f32 = 3.0;

/// Weight floor and ceiling the tuner may never cross.
pub const WEIGHT_FLOOR: f32 = 0.05;
pub const WEIGHT_CEIL: f32 = 0.9;

/// Maximum per-adjustment delta scale.
const DELTA_SCALE: f32 = 0.1;

/// Auto-apply gate: overall tuning confidence and useful-sample minimum.
const AUTO_APPLY_CONFIDENCE: f32 = 0.8;
const AUTO_APPLY_MIN_USEFUL: usize = 10;

/// Sample count at which the tuner trusts its correlations fully.
const SAMPLE_SATURATION: f32 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfidenceWeights {
    pub semantic: f32,
    pub structural: f32,
    pub citation: f32,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            semantic: 0.7,
            structural: 0.1,
            citation: 0.2,
        }
    }
}

impl ConfidenceWeights {
    /// Scale so the weights sum to exactly 1.0.
    pub fn normalized(self) -> Self {
        let sum = self.semantic + self.structural + self.citation;
        if sum <= f32::EPSILON {
            return Self::default();
        }
        Self {
            semantic: self.semantic / sum,
            structural: self.structural / sum,
            citation: self.citation / sum,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfidenceThresholds {
    pub high: f32,
    pub medium: f32,
    pub low: f32,
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self {
            high: 0.8,
            medium: 0.5,
            low: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfidenceBehavior {
    /// Below `medium`, raw evidence accompanies the synthesized answer.
    pub include_raw_below_medium: bool,
    /// Below `low`, the response carries a low-confidence warning.
    pub warn_below_low: bool,
}

impl Default for ConfidenceBehavior {
    fn default() -> Self {
        Self {
            include_raw_below_medium: true,
            warn_below_low: true,
        }
    }
}

/// Versioned on-disk confidence configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfidenceConfig {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
    pub weights: ConfidenceWeights,
    pub thresholds: ConfidenceThresholds,
    pub behavior: ConfidenceBehavior,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            version: 1,
            updated_at: Utc::now(),
            updated_by: "default".to_string(),
            weights: ConfidenceWeights::default(),
            thresholds: ConfidenceThresholds::default(),
            behavior: ConfidenceBehavior::default(),
        }
    }
}

/// Computes per-response confidence from evidence characteristics.
pub struct ConfidenceMeter {
    config: RwLock<ConfidenceConfig>,
    path: Option<PathBuf>,
}

impl ConfidenceMeter {
    pub fn with_defaults() -> Self {
        Self {
            config: RwLock::new(ConfidenceConfig::default()),
            path: None,
        }
    }

    /// Load from the config file, falling back to defaults when it is absent.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let mut config: ConfidenceConfig =
                serde_json::from_str(&raw).context("confidence config is not valid JSON")?;
            config.weights = config.weights.normalized();
            config
        } else {
            ConfidenceConfig::default()
        };
        Ok(Self {
            config: RwLock::new(config),
            path: Some(path),
        })
    }

    pub fn config(&self) -> ConfidenceConfig {
        self.config.read().clone()
    }

    /// Weighted blend of the three evidence factors, clamped to [0,1].
    pub fn score(&self, semantic_mean: f32, has_structural: bool, citation_count: usize) -> f32 {
        let weights = self.config.read().weights;
        let semantic = semantic_mean.clamp(0.0, 1.0);
        let structural = if has_structural { 1.0 } else { 0.0 };
        let citation = (citation_count as f32 / CITATION_SATURATION).min(1.0);
        (weights.semantic * semantic + weights.structural * structural + weights.citation * citation)
            .clamp(0.0, 1.0)
    }

    pub fn thresholds(&self) -> ConfidenceThresholds {
        self.config.read().thresholds
    }

    pub fn behavior(&self) -> ConfidenceBehavior {
        self.config.read().behavior
    }

    /// Apply new weights, bump the version, and persist when file-backed.
    pub fn apply_weights(&self, weights: ConfidenceWeights, updated_by: &str) -> Result<u32> {
        let snapshot = {
            let mut config = self.config.write();
            config.weights = weights.normalized();
            config.version += 1;
            config.updated_at = Utc::now();
            config.updated_by = updated_by.to_string();
            config.clone()
        };
        if let Some(path) = &self.path {
            std::fs::write(path, serde_json::to_string_pretty(&snapshot)?)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        info!(
            version = snapshot.version,
            "confidence weights updated by {updated_by}"
        );
        Ok(snapshot.version)
    }
}

// ---------------------------------------------------------------------------
// Offline tuner
// ---------------------------------------------------------------------------

/// Per-factor correlation of evidence characteristics with useful outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactorCorrelations {
    pub semantic: f32,
    pub structural: f32,
    pub citation: f32,
}

/// Outcome of one tuning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TuningOutcome {
    pub sample_count: usize,
    pub useful_count: usize,
    pub correlations: FactorCorrelations,
    pub proposed: ConfidenceWeights,
    pub overall_confidence: f32,
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation_path: Option<String>,
}

fn factor_values(metric: &QueryMetric) -> (f32, f32, f32) {
    (
        metric.avg_semantic_score.clamp(0.0, 1.0),
        if metric.relationship_count > 0 { 1.0 } else { 0.0 },
        (metric.citation_count as f32 / CITATION_SATURATION).min(1.0),
    )
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

/// Difference of group means normalized by the larger mean, clipped to [-1,1].
fn correlate(useful: &[f32], not_useful: &[f32]) -> f32 {
    if useful.is_empty() || not_useful.is_empty() {
        return 0.0;
    }
    let mean_u = mean(useful);
    let mean_n = mean(not_useful);
    let denom = mean_u.max(mean_n);
    if denom <= f32::EPSILON {
        return 0.0;
    }
    ((mean_u - mean_n) / denom).clamp(-1.0, 1.0)
}

/// Consumes a feedback window and proposes (or applies) weight adjustments.
pub struct ConfidenceTuner<'a> {
    meter: &'a ConfidenceMeter,
    recommendation_dir: Option<PathBuf>,
}

impl<'a> ConfidenceTuner<'a> {
    pub fn new(meter: &'a ConfidenceMeter) -> Self {
        Self {
            meter,
            recommendation_dir: None,
        }
    }

    pub fn with_recommendation_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.recommendation_dir = Some(dir.into());
        self
    }

    /// Run one tuning pass over metrics that carry feedback.
    /// `partial` feedback is excluded from both groups; it signals neither a
    /// hit nor a miss.
    pub fn tune(&self, metrics: &[QueryMetric]) -> Result<TuningOutcome> {
        let mut useful: Vec<(f32, f32, f32)> = Vec::new();
        let mut not_useful: Vec<(f32, f32, f32)> = Vec::new();

        for metric in metrics {
            let Some(feedback) = &metric.feedback else {
                continue;
            };
            match feedback.rating {
                FeedbackRating::Useful => useful.push(factor_values(metric)),
                FeedbackRating::NotUseful => not_useful.push(factor_values(metric)),
                FeedbackRating::Partial => {}
            }
        }

        let sample_count = useful.len() + not_useful.len();
        let correlations = FactorCorrelations {
            semantic: correlate(
                &useful.iter().map(|v| v.0).collect::<Vec<_>>(),
                &not_useful.iter().map(|v| v.0).collect::<Vec<_>>(),
            ),
            structural: correlate(
                &useful.iter().map(|v| v.1).collect::<Vec<_>>(),
                &not_useful.iter().map(|v| v.1).collect::<Vec<_>>(),
            ),
            citation: correlate(
                &useful.iter().map(|v| v.2).collect::<Vec<_>>(),
                &not_useful.iter().map(|v| v.2).collect::<Vec<_>>(),
            ),
        };

        let current = self.meter.config().weights;
        let bounded = |weight: f32, correlation: f32| {
            (weight + correlation * DELTA_SCALE).clamp(WEIGHT_FLOOR, WEIGHT_CEIL)
        };
        let proposed = ConfidenceWeights {
            semantic: bounded(current.semantic, correlations.semantic),
            structural: bounded(current.structural, correlations.structural),
            citation: bounded(current.citation, correlations.citation),
        }
        .normalized();

        let mean_abs_correlation = (correlations.semantic.abs()
            + correlations.structural.abs()
            + correlations.citation.abs())
            / 3.0;
        let sample_confidence = (sample_count as f32 / SAMPLE_SATURATION).min(1.0);
        let overall_confidence = mean_abs_correlation * sample_confidence;

        let applied =
            overall_confidence >= AUTO_APPLY_CONFIDENCE && useful.len() >= AUTO_APPLY_MIN_USEFUL;

        let mut outcome = TuningOutcome {
            sample_count,
            useful_count: useful.len(),
            correlations,
            proposed,
            overall_confidence,
            applied,
            recommendation_path: None,
        };

        if applied {
            self.meter.apply_weights(proposed, "confidence-tuner")?;
        } else if let Some(dir) = &self.recommendation_dir {
            let path = dir.join(format!(
                "confidence-recommendation-{}.json",
                Utc::now().format("%Y%m%dT%H%M%SZ")
            ));
            std::fs::create_dir_all(dir)?;
            std::fs::write(&path, serde_json::to_string_pretty(&outcome)?)?;
            outcome.recommendation_path = Some(path.display().to_string());
            info!("confidence recommendation written to {}", path.display());
        } else {
            warn!(
                confidence = overall_confidence,
                samples = sample_count,
                "tuning below auto-apply gate and no recommendation dir configured"
            );
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_metrics::{hash_query, FeedbackRecord};

    fn meter() -> ConfidenceMeter {
        ConfidenceMeter::with_defaults()
    }

    #[test]
    fn test_score_matches_formula() {
        let meter = meter();
        // defaults: 0.7 semantic, 0.1 structural, 0.2 citation
        let score = meter.score(0.6, true, 2);
        let expected = 0.7 * 0.6 + 0.1 * 1.0 + 0.2 * (2.0 / 3.0);
        assert!((score - expected).abs() < 1e-6);
    }

    #[test]
    fn test_score_clamps_inputs_and_output() {
        let meter = meter();
        assert!(meter.score(2.0, true, 100) <= 1.0);
        assert!(meter.score(-1.0, false, 0) >= 0.0);
    }

    #[test]
    fn test_citation_factor_saturates_at_three() {
        let meter = meter();
        assert_eq!(meter.score(0.0, false, 3), meter.score(0.0, false, 30));
    }

    #[test]
    fn test_weights_normalize() {
        let weights = ConfidenceWeights {
            semantic: 2.0,
            structural: 1.0,
            citation: 1.0,
        }
        .normalized();
        assert!((weights.semantic + weights.structural + weights.citation - 1.0).abs() < 1e-6);
        assert!((weights.semantic - 0.5).abs() < 1e-6);
    }

    fn rated_metric(score: f32, relationships: usize, citations: usize, rating: FeedbackRating) -> QueryMetric {
        QueryMetric {
            request_id: "r".to_string(),
            timestamp: Utc::now(),
            query_hash: hash_query("q"),
            match_count: 5,
            relationship_count: relationships,
            avg_semantic_score: score,
            confidence: 0.5,
            answer_length: 100,
            citation_count: citations,
            total_latency_ms: 50,
            feedback: Some(FeedbackRecord {
                rating,
                timestamp: Utc::now(),
                comment: None,
            }),
        }
    }

    #[test]
    fn test_tuner_proposes_bounded_normalized_weights() {
        let meter = meter();
        let tuner = ConfidenceTuner::new(&meter);

        let mut metrics = Vec::new();
        for _ in 0..6 {
            metrics.push(rated_metric(0.9, 1, 3, FeedbackRating::Useful));
        }
        for _ in 0..6 {
            metrics.push(rated_metric(0.2, 0, 0, FeedbackRating::NotUseful));
        }

        let outcome = tuner.tune(&metrics).unwrap();
        assert_eq!(outcome.sample_count, 12);
        assert_eq!(outcome.useful_count, 6);
        assert!(outcome.correlations.semantic > 0.0);
        let sum = outcome.proposed.semantic + outcome.proposed.structural + outcome.proposed.citation;
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(outcome.proposed.semantic >= WEIGHT_FLOOR);
        assert!(outcome.proposed.semantic <= WEIGHT_CEIL);
    }

    #[test]
    fn test_tuner_ignores_partial_feedback() {
        let meter = meter();
        let tuner = ConfidenceTuner::new(&meter);
        let metrics = vec![rated_metric(0.5, 0, 0, FeedbackRating::Partial)];
        let outcome = tuner.tune(&metrics).unwrap();
        assert_eq!(outcome.sample_count, 0);
        assert!(!outcome.applied);
    }

    #[test]
    fn test_tuner_auto_applies_and_bumps_version() {
        let meter = meter();
        let before = meter.config().version;
        let tuner = ConfidenceTuner::new(&meter);

        // Strong, fully separated signal across 50+ samples.
        let mut metrics = Vec::new();
        for _ in 0..30 {
            metrics.push(rated_metric(1.0, 1, 3, FeedbackRating::Useful));
        }
        for _ in 0..30 {
            metrics.push(rated_metric(0.0, 0, 0, FeedbackRating::NotUseful));
        }

        let outcome = tuner.tune(&metrics).unwrap();
        assert!(outcome.overall_confidence >= 0.8);
        assert!(outcome.applied);
        assert_eq!(meter.config().version, before + 1);
    }

    #[test]
    fn test_tuner_writes_recommendation_when_below_gate() {
        let dir = tempfile::tempdir().unwrap();
        let meter = meter();
        let tuner = ConfidenceTuner::new(&meter).with_recommendation_dir(dir.path());

        let metrics = vec![
            rated_metric(0.6, 0, 1, FeedbackRating::Useful),
            rated_metric(0.5, 0, 1, FeedbackRating::NotUseful),
        ];
        let outcome = tuner.tune(&metrics).unwrap();
        assert!(!outcome.applied);
        let path = outcome.recommendation_path.unwrap();
        assert!(std::path::Path::new(&path).exists());
    }

    #[test]
    fn test_config_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("confidence.json");
        let meter = ConfidenceMeter::load(&path).unwrap();
        meter
            .apply_weights(
                ConfidenceWeights {
                    semantic: 0.6,
                    structural: 0.2,
                    citation: 0.2,
                },
                "test",
            )
            .unwrap();

        let reloaded = ConfidenceMeter::load(&path).unwrap();
        assert_eq!(reloaded.config().version, 2);
        assert!((reloaded.config().weights.semantic - 0.6).abs() < 1e-6);
        assert_eq!(reloaded.config().updated_by, "test");
    }
}
