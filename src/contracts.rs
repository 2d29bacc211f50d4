// Contract-First Design
// Capability traits the orchestrator depends on. Backends and provider chains
// are swapped behind these seams (production adapters, in-process tool
// variants, and test stubs all implement the same contracts).

use anyhow::Result;
use async_trait::async_trait;

use crate::http_types::{Citation, SemanticMatch, StructuralRelationship};
use crate::types::{ProjectScope, QueryIntent};

/// Outcome of running the embedding fallback chain.
#[derive(Debug, Clone)]
pub struct EmbeddingOutcome {
    pub vector: Vec<f32>,
    /// Provider that produced the vector.
    pub provider: String,
    /// Total providers attempted, including the successful one.
    pub attempts: u32,
    /// Providers tried and failed before success, in order.
    pub failed_providers: Vec<String>,
    /// Non-fatal notes (e.g. a truncated overlong vector).
    pub warnings: Vec<String>,
}

/// Produces query embeddings.
///
/// # Postconditions
/// - Returned vector length equals `dimension()`
/// - Failure means every configured provider failed
#[async_trait]
pub trait EmbeddingGenerator: Send + Sync {
    async fn embed(&self, text: &str) -> Result<EmbeddingOutcome>;

    /// Target dimension every returned vector is normalized to.
    fn dimension(&self) -> usize;
}

/// Parameters of one semantic search call.
#[derive(Debug, Clone)]
pub struct SemanticSearchSpec {
    pub project: Option<ProjectScope>,
    pub limit: usize,
    pub min_score: f32,
}

impl Default for SemanticSearchSpec {
    fn default() -> Self {
        Self {
            project: None,
            limit: 10,
            min_score: 0.0,
        }
    }
}

/// Similarity search over the vector backend.
///
/// # Postconditions
/// - Every returned score is within [0,1]
/// - `probe` never errors; unreachable backends report `false`
#[async_trait]
pub trait SemanticSearcher: Send + Sync {
    async fn search(
        &self,
        embedding: &[f32],
        spec: &SemanticSearchSpec,
    ) -> Result<Vec<SemanticMatch>>;

    /// Cheap availability check, bounded by its own short deadline.
    async fn probe(&self) -> bool;

    /// Project scopes the backend has indexed.
    async fn list_projects(&self) -> Result<Vec<String>>;
}

/// Relationship search over the labeled property graph.
#[async_trait]
pub trait StructuralSearcher: Send + Sync {
    async fn search(
        &self,
        query: &str,
        intent: QueryIntent,
        project: Option<&ProjectScope>,
    ) -> Result<Vec<StructuralRelationship>>;

    /// Cheap availability check, bounded by its own short deadline.
    async fn probe(&self) -> bool;
}

/// Evidence packet handed to the synthesis chain.
#[derive(Debug, Clone)]
pub struct SynthesisInput {
    pub query: String,
    pub intent: QueryIntent,
    pub matches: Vec<SemanticMatch>,
    pub relationships: Vec<StructuralRelationship>,
}

/// Outcome of running the synthesis fallback chain.
#[derive(Debug, Clone)]
pub struct SynthesisOutcome {
    /// Markdown answer body.
    pub answer: String,
    /// Citations; always a subset of the evidence in the input.
    pub citations: Vec<Citation>,
    pub provider: String,
    pub attempts: u32,
    pub failed_providers: Vec<String>,
}

/// Synthesizes a markdown answer over an evidence packet.
///
/// # Postconditions
/// - Citations reference only sources present in the input evidence
#[async_trait]
pub trait AnswerSynthesizer: Send + Sync {
    async fn synthesize(&self, input: &SynthesisInput) -> Result<SynthesisOutcome>;
}
