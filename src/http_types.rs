// Wire contract types for the gateway HTTP API.
// All payloads are camelCase JSON; shapes here are the schema-stable surface
// clients integrate against, so changes must stay backward compatible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{
    ContentKind, ConversationPhase, FeedbackRating, InteractionMode, QueryIntent, QueryStatus,
    SynthesisMode,
};

/// Fixed sentence returned when no backend can answer.
pub const FALLBACK_MESSAGE: &str = "SYSTEM IS UNAVAILABLE, USE WEB & CODEBASE RESEARCH";

/// Body of `POST /query` and `POST /conversation`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct QueryRequestBody {
    pub query: String,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub context: Vec<String>,
    #[serde(default)]
    pub mode: Option<InteractionMode>,
    #[serde(default)]
    pub synthesis_mode: Option<SynthesisMode>,
}

/// Body of `POST /conversation/{id}/continue`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ContinueRequestBody {
    pub answers: BTreeMap<String, String>,
}

/// Body of `POST /feedback`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FeedbackRequestBody {
    pub request_id: String,
    pub feedback: FeedbackRating,
    #[serde(default)]
    pub comment: Option<String>,
}

/// One evidence snippet from the vector backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticMatch {
    pub content: String,
    /// Similarity in [0,1].
    pub score: f32,
    pub source: String,
    pub kind: ContentKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_range: Option<LineRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Inclusive line range within a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
}

/// One directed relationship from the graph backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuralRelationship {
    pub source: String,
    pub relation: String,
    pub target: String,
    /// Alternating entity/relation tokens along the traversal.
    pub path: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

/// Semantic half of the evidence packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticResult {
    pub summary: String,
    pub matches: Vec<SemanticMatch>,
}

impl SemanticResult {
    pub fn empty() -> Self {
        Self {
            summary: String::new(),
            matches: Vec::new(),
        }
    }

    /// Sort matches by score desc, then source asc. Stable for equal keys.
    pub fn sort(&mut self) {
        self.matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.source.cmp(&b.source))
        });
    }
}

/// Structural half of the evidence packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuralResult {
    pub summary: String,
    pub relationships: Vec<StructuralRelationship>,
}

impl StructuralResult {
    pub fn empty() -> Self {
        Self {
            summary: String::new(),
            relationships: Vec::new(),
        }
    }

    /// Sort relationships by source asc, relation asc, target asc.
    pub fn sort(&mut self) {
        self.relationships.sort_by(|a, b| {
            a.source
                .cmp(&b.source)
                .then_with(|| a.relation.cmp(&b.relation))
                .then_with(|| a.target.cmp(&b.target))
        });
    }
}

/// A citation inside a synthesized answer. Always refers to returned evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_range: Option<LineRange>,
    pub relevance: f32,
    pub kind: ContentKind,
}

/// LLM-synthesized answer over the evidence packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizedAnswer {
    /// Markdown body.
    pub answer: String,
    /// Derived from evidence characteristics, never the model's self-report.
    pub confidence: f32,
    pub citations: Vec<Citation>,
}

/// Per-backend and end-to-end request accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryMeta {
    pub qdrant_queried: bool,
    pub neo4j_queried: bool,
    pub qdrant_latency_ms: u64,
    pub neo4j_latency_ms: u64,
    pub total_latency_ms: u64,
    pub cache_hit: bool,
}

/// Response of `POST /query` (and the terminal response of a conversation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub request_id: String,
    pub status: QueryStatus,
    pub intent: QueryIntent,
    pub timestamp: DateTime<Utc>,
    pub semantic: SemanticResult,
    pub structural: StructuralResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<SynthesizedAnswer>,
    pub meta: QueryMeta,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_message: Option<String>,
}

/// One clarification question within a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClarificationQuestion {
    /// Stable within a round; answers are keyed by this id.
    pub id: String,
    pub question: String,
    /// Empty options means free-text.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub options: Vec<String>,
    pub multi_select: bool,
    pub required: bool,
}

/// Response when the gateway needs clarification instead of answering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationResponse {
    pub conversation_id: String,
    pub phase: ConversationPhase,
    pub round: u32,
    pub max_rounds: u32,
    pub questions: Vec<ClarificationQuestion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Either shape a query-path endpoint can produce.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum GatewayReply {
    Clarify(ConversationResponse),
    Answered(Box<QueryResponse>),
}

/// Generic error body for 4xx/5xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// Response of `GET /projects`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectsResponse {
    pub projects: Vec<String>,
}

/// Response of `GET /queue/stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatsResponse {
    pub queries_total: u64,
    pub conversations_started: u64,
    pub conversations_active: u64,
    pub rate_limited_total: u64,
    pub synthesis_fallbacks_total: u64,
    pub store_mode: String,
    pub providers: Vec<crate::providers::ProviderHealth>,
}
