// Per-query metrics. The orchestrator emits one record after each response;
// feedback arrives later through POST /feedback and is attached in place.
// The confidence tuner reads these records but never writes them.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::state_store::StateStore;
use crate::types::{FeedbackRating, RequestId};

pub const METRIC_KEY_PREFIX: &str = "metrics:query:";
pub const PENDING_FEEDBACK_SET: &str = "metrics:feedback:pending";

/// How long metric records are retained (default 7 days).
pub const METRIC_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Feedback attached to a recorded query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRecord {
    pub rating: FeedbackRating,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// One query's evidence and outcome characteristics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryMetric {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    /// SHA-256 of the query text; raw queries are never persisted here.
    pub query_hash: String,
    pub match_count: usize,
    pub relationship_count: usize,
    pub avg_semantic_score: f32,
    pub confidence: f32,
    pub answer_length: usize,
    pub citation_count: usize,
    pub total_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<FeedbackRecord>,
}

/// Hash a query for metric storage.
pub fn hash_query(query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    hex::encode(hasher.finalize())
}

fn metric_key(request_id: &str) -> String {
    format!("{METRIC_KEY_PREFIX}{request_id}")
}

/// Writes metrics through the shared state store.
pub struct MetricsRecorder {
    store: Arc<dyn StateStore>,
    ttl: Duration,
}

impl MetricsRecorder {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            ttl: METRIC_TTL,
        }
    }

    pub fn with_ttl(store: Arc<dyn StateStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Persist a metric and index it as awaiting feedback. Failures are
    /// logged, never surfaced; metric emission is fire-and-forget.
    pub async fn record(&self, metric: &QueryMetric) {
        let json = match serde_json::to_string(metric) {
            Ok(json) => json,
            Err(e) => {
                warn!("failed to encode query metric: {e}");
                return;
            }
        };
        if let Err(e) = self
            .store
            .put(&metric_key(&metric.request_id), json, Some(self.ttl))
            .await
        {
            warn!("failed to persist query metric: {e:#}");
            return;
        }
        let score = metric.timestamp.timestamp_millis() as f64;
        if let Err(e) = self
            .store
            .zadd(PENDING_FEEDBACK_SET, &metric.request_id, score)
            .await
        {
            warn!("failed to index pending feedback: {e:#}");
        }
    }

    /// Attach feedback to a prior request. Returns false when the request id
    /// is unknown or its metric has expired.
    pub async fn attach_feedback(
        &self,
        request_id: &RequestId,
        rating: FeedbackRating,
        comment: Option<String>,
    ) -> Result<bool> {
        let key = metric_key(request_id.as_str());
        let Some(json) = self.store.get(&key).await? else {
            return Ok(false);
        };
        let mut metric: QueryMetric =
            serde_json::from_str(&json).context("stored metric is not valid JSON")?;
        metric.feedback = Some(FeedbackRecord {
            rating,
            timestamp: Utc::now(),
            comment,
        });
        // Keep whatever TTL budget the record had; refreshing to the full
        // window here would let feedback extend retention indefinitely.
        let remaining = self.store.ttl(&key).await?.unwrap_or(self.ttl);
        self.store
            .put(&key, serde_json::to_string(&metric)?, Some(remaining))
            .await?;
        self.store
            .zrem(PENDING_FEEDBACK_SET, request_id.as_str())
            .await?;
        Ok(true)
    }

    /// Request ids still awaiting feedback, oldest first.
    pub async fn pending_feedback(&self) -> Result<Vec<String>> {
        self.store.zrange(PENDING_FEEDBACK_SET).await
    }

    /// Load all metrics recorded within the trailing window that carry
    /// feedback, for the offline tuner.
    pub async fn feedback_window(&self, window_days: i64) -> Result<Vec<QueryMetric>> {
        let cutoff = Utc::now() - ChronoDuration::days(window_days);
        let keys = self.store.keys_with_prefix(METRIC_KEY_PREFIX).await?;
        let mut metrics = Vec::new();
        for key in keys {
            let Some(json) = self.store.get(&key).await? else {
                continue;
            };
            let Ok(metric) = serde_json::from_str::<QueryMetric>(&json) else {
                warn!("skipping undecodable metric at {key}");
                continue;
            };
            if metric.feedback.is_some() && metric.timestamp >= cutoff {
                metrics.push(metric);
            }
        }
        metrics.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(metrics)
    }
}
