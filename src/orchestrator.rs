// Query Orchestrator - classifies intent, fans out to the vector and graph
// backends in parallel, assembles a deterministic evidence packet, and
// decides the degradation story when backends are down.
//
// Backend errors never escape this module as errors; they become availability
// outcomes (partial/unavailable) with human-readable warnings.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::confidence::ConfidenceMeter;
use crate::contracts::{
    AnswerSynthesizer, EmbeddingGenerator, SemanticSearcher, SemanticSearchSpec,
    StructuralSearcher, SynthesisInput,
};
use crate::http_types::{
    QueryMeta, QueryResponse, SemanticMatch, SemanticResult, StructuralRelationship,
    StructuralResult, SynthesizedAnswer, FALLBACK_MESSAGE,
};
use crate::query_metrics::{hash_query, MetricsRecorder, QueryMetric};
use crate::types::{ProjectScope, QueryIntent, QueryStatus, RequestId, SynthesisMode, ValidatedQuery};

/// Default per-backend deadline.
pub const BACKEND_DEADLINE: Duration = Duration::from_secs(30);

static RELATIONSHIP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(depends?\s+on|dependenc\w*|call(s|er|ers|ed)?|used\s+by|relationship\w*|related|reference\w*|extends|implements|imports?)\b",
    )
    .expect("static regex")
});
static CODE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(class|function|method|struct|trait|interface|implementation|module|endpoint|api|code|source)\b",
    )
    .expect("static regex")
});
static EXPLANATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(how|why|explain|works?|understand|describe|purpose|mean(s|ing)?)\b")
        .expect("static regex")
});
static LOCATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(where|located?|find|path|file|directory|folder)\b").expect("static regex")
});

/// Everything the orchestrator needs to answer one query.
#[derive(Debug, Clone)]
pub struct OrchestratorRequest {
    pub request_id: RequestId,
    pub query: ValidatedQuery,
    pub project: Option<ProjectScope>,
    /// Auxiliary caller-supplied hints, appended to the synthesis context.
    pub context: Vec<String>,
    pub synthesis_mode: SynthesisMode,
}

/// Tunable orchestration parameters.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub backend_deadline: Duration,
    pub search_limit: usize,
    pub min_score: f32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            backend_deadline: BACKEND_DEADLINE,
            search_limit: 10,
            min_score: 0.0,
        }
    }
}

struct BackendLeg<T> {
    outcome: Result<T, String>,
    latency_ms: u64,
    probe_ok: bool,
}

/// Coordinates one query across the embedding chain and both backends.
pub struct QueryOrchestrator {
    embedding: Arc<dyn EmbeddingGenerator>,
    vector: Arc<dyn SemanticSearcher>,
    graph: Arc<dyn StructuralSearcher>,
    synthesizer: Option<Arc<dyn AnswerSynthesizer>>,
    confidence: Arc<ConfidenceMeter>,
    metrics: Arc<MetricsRecorder>,
    config: OrchestratorConfig,
    queries_total: AtomicU64,
    synthesis_fallbacks: AtomicU64,
}

impl QueryOrchestrator {
    pub fn new(
        embedding: Arc<dyn EmbeddingGenerator>,
        vector: Arc<dyn SemanticSearcher>,
        graph: Arc<dyn StructuralSearcher>,
        synthesizer: Option<Arc<dyn AnswerSynthesizer>>,
        confidence: Arc<ConfidenceMeter>,
        metrics: Arc<MetricsRecorder>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            embedding,
            vector,
            graph,
            synthesizer,
            confidence,
            metrics,
            config,
            queries_total: AtomicU64::new(0),
            synthesis_fallbacks: AtomicU64::new(0),
        }
    }

    pub fn queries_total(&self) -> u64 {
        self.queries_total.load(Ordering::Relaxed)
    }

    pub fn synthesis_fallbacks_total(&self) -> u64 {
        self.synthesis_fallbacks.load(Ordering::Relaxed)
    }

    /// Keyword classification with fixed precedence:
    /// relationship > code > explanation > location > both.
    pub fn classify_intent(query: &str) -> QueryIntent {
        let lowered = query.to_lowercase();
        if lowered.trim().is_empty() {
            return QueryIntent::Unknown;
        }
        if RELATIONSHIP_RE.is_match(&lowered) {
            QueryIntent::Relationship
        } else if CODE_RE.is_match(&lowered) {
            QueryIntent::Code
        } else if EXPLANATION_RE.is_match(&lowered) {
            QueryIntent::Explanation
        } else if LOCATION_RE.is_match(&lowered) {
            QueryIntent::Location
        } else {
            QueryIntent::Both
        }
    }

    /// Answer one query. Never fails: full backend loss produces an
    /// `unavailable` response with empty result shells.
    pub async fn execute(&self, request: OrchestratorRequest) -> QueryResponse {
        let started = Instant::now();
        self.queries_total.fetch_add(1, Ordering::Relaxed);

        let intent = Self::classify_intent(request.query.as_str());
        debug!(request_id = %request.request_id, %intent, "query dispatch");

        let (semantic_leg, structural_leg) = tokio::join!(
            self.semantic_leg(&request),
            self.structural_leg(&request, intent),
        );

        let mut warnings: Vec<String> = Vec::new();

        let (mut semantic, qdrant_queried) = match semantic_leg.outcome {
            Ok((matches, embed_warnings)) => {
                warnings.extend(embed_warnings);
                let summary = if matches.is_empty() {
                    "No semantically similar content found".to_string()
                } else {
                    format!("Found {} semantically similar snippets", matches.len())
                };
                (
                    SemanticResult {
                        summary,
                        matches,
                    },
                    true,
                )
            }
            Err(reason) => {
                warnings.push(if semantic_leg.probe_ok {
                    format!("Vector backend error: {reason}")
                } else {
                    "Vector backend is unavailable; semantic matches were not retrieved"
                        .to_string()
                });
                (SemanticResult::empty(), false)
            }
        };

        let (mut structural, neo4j_queried) = match structural_leg.outcome {
            Ok(relationships) => {
                let summary = if relationships.is_empty() {
                    "No structural relationships found".to_string()
                } else {
                    format!("Found {} structural relationships", relationships.len())
                };
                (
                    StructuralResult {
                        summary,
                        relationships,
                    },
                    true,
                )
            }
            Err(reason) => {
                warnings.push(if structural_leg.probe_ok {
                    format!("Graph backend error: {reason}")
                } else {
                    "Graph backend is unavailable; structural relationships were not retrieved"
                        .to_string()
                });
                (StructuralResult::empty(), false)
            }
        };

        semantic.sort();
        structural.sort();

        let status = match (qdrant_queried, neo4j_queried) {
            (true, true) => QueryStatus::Success,
            (false, false) => QueryStatus::Unavailable,
            _ => QueryStatus::Partial,
        };

        let answer = if request.synthesis_mode == SynthesisMode::Synthesized
            && status != QueryStatus::Unavailable
        {
            self.synthesize(&request, intent, &semantic, &structural, &mut warnings)
                .await
        } else {
            None
        };

        let semantic_mean = if semantic.matches.is_empty() {
            0.0
        } else {
            semantic.matches.iter().map(|m| m.score).sum::<f32>() / semantic.matches.len() as f32
        };
        let citation_count = answer.as_ref().map(|a| a.citations.len()).unwrap_or(0);
        let confidence =
            self.confidence
                .score(semantic_mean, !structural.relationships.is_empty(), citation_count);

        let thresholds = self.confidence.thresholds();
        let behavior = self.confidence.behavior();
        if behavior.warn_below_low && confidence < thresholds.low && status != QueryStatus::Unavailable
        {
            warnings.push(format!(
                "Low confidence ({confidence:.2}); verify the evidence before relying on it"
            ));
        }

        let answer = answer.map(|mut a| {
            a.confidence = confidence;
            a
        });

        let total_latency_ms = started.elapsed().as_millis().max(1) as u64;
        let response = QueryResponse {
            request_id: request.request_id.to_string(),
            status,
            intent,
            timestamp: Utc::now(),
            semantic,
            structural,
            answer,
            meta: QueryMeta {
                qdrant_queried,
                neo4j_queried,
                qdrant_latency_ms: semantic_leg.latency_ms,
                neo4j_latency_ms: structural_leg.latency_ms,
                total_latency_ms,
                cache_hit: false,
            },
            warnings,
            fallback_message: (status == QueryStatus::Unavailable)
                .then(|| FALLBACK_MESSAGE.to_string()),
        };

        self.emit_metric(&request, &response, semantic_mean, confidence);

        info!(
            request_id = %response.request_id,
            status = ?response.status,
            matches = response.semantic.matches.len(),
            relationships = response.structural.relationships.len(),
            latency_ms = total_latency_ms,
            "query completed"
        );
        response
    }

    /// Embedding + vector search, with the availability probe issued
    /// concurrently. The probe shapes the warning text, not the outcome.
    async fn semantic_leg(
        &self,
        request: &OrchestratorRequest,
    ) -> BackendLeg<(Vec<SemanticMatch>, Vec<String>)> {
        let started = Instant::now();
        let deadline = self.config.backend_deadline;

        let substantive = async {
            let embedding = tokio::time::timeout(deadline, self.embedding.embed(request.query.as_str()))
                .await
                .map_err(|_| "embedding timed out".to_string())?
                .map_err(|e| format!("embedding failed: {e}"))?;

            let spec = SemanticSearchSpec {
                project: request.project.clone(),
                limit: self.config.search_limit,
                min_score: self.config.min_score,
            };
            let matches = tokio::time::timeout(deadline, self.vector.search(&embedding.vector, &spec))
                .await
                .map_err(|_| "vector search timed out".to_string())?
                .map_err(|e| format!("{e:#}"))?;
            Ok::<_, String>((matches, embedding.warnings))
        };

        let (outcome, probe_ok) = tokio::join!(substantive, self.vector.probe());
        BackendLeg {
            outcome,
            latency_ms: started.elapsed().as_millis() as u64,
            probe_ok,
        }
    }

    async fn structural_leg(
        &self,
        request: &OrchestratorRequest,
        intent: QueryIntent,
    ) -> BackendLeg<Vec<StructuralRelationship>> {
        let started = Instant::now();
        let deadline = self.config.backend_deadline;

        let substantive = async {
            tokio::time::timeout(
                deadline,
                self.graph
                    .search(request.query.as_str(), intent, request.project.as_ref()),
            )
            .await
            .map_err(|_| "graph search timed out".to_string())?
            .map_err(|e| format!("{e:#}"))
        };

        let (outcome, probe_ok) = tokio::join!(substantive, self.graph.probe());
        BackendLeg {
            outcome,
            latency_ms: started.elapsed().as_millis() as u64,
            probe_ok,
        }
    }

    /// Synthesis failure is not a backend failure: the response keeps its
    /// status and gains a warning instead.
    async fn synthesize(
        &self,
        request: &OrchestratorRequest,
        intent: QueryIntent,
        semantic: &SemanticResult,
        structural: &StructuralResult,
        warnings: &mut Vec<String>,
    ) -> Option<SynthesizedAnswer> {
        let synthesizer = self.synthesizer.as_ref()?;

        let mut query = request.query.as_str().to_string();
        for hint in &request.context {
            query.push_str(&format!(" Context: {hint}."));
        }

        let input = SynthesisInput {
            query,
            intent,
            matches: semantic.matches.clone(),
            relationships: structural.relationships.clone(),
        };

        match synthesizer.synthesize(&input).await {
            Ok(outcome) => {
                if !outcome.failed_providers.is_empty() {
                    warnings.push(format!(
                        "Synthesis used fallback provider '{}' after {} failed",
                        outcome.provider,
                        outcome.failed_providers.join(", ")
                    ));
                }
                Some(SynthesizedAnswer {
                    answer: outcome.answer,
                    confidence: 0.0,
                    citations: outcome.citations,
                })
            }
            Err(e) => {
                warn!("synthesis chain exhausted: {e:#}");
                self.synthesis_fallbacks.fetch_add(1, Ordering::Relaxed);
                warnings.push("Answer synthesis failed; returning raw evidence".to_string());
                None
            }
        }
    }

    fn emit_metric(
        &self,
        request: &OrchestratorRequest,
        response: &QueryResponse,
        semantic_mean: f32,
        confidence: f32,
    ) {
        let metric = QueryMetric {
            request_id: request.request_id.to_string(),
            timestamp: response.timestamp,
            query_hash: hash_query(request.query.as_str()),
            match_count: response.semantic.matches.len(),
            relationship_count: response.structural.relationships.len(),
            avg_semantic_score: semantic_mean,
            confidence,
            answer_length: response.answer.as_ref().map(|a| a.answer.len()).unwrap_or(0),
            citation_count: response.answer.as_ref().map(|a| a.citations.len()).unwrap_or(0),
            total_latency_ms: response.meta.total_latency_ms,
            feedback: None,
        };
        // Fire-and-forget after response assembly.
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            metrics.record(&metric).await;
        });
    }
}
