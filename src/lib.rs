// Quarry - Request-coordination gateway for codebase intelligence
// Root library module

pub mod auth_middleware;
pub mod confidence;
pub mod config;
pub mod contracts;
pub mod conversation;
pub mod errors;
pub mod graph_adapter;
pub mod health_monitor;
pub mod http_server;
pub mod http_types;
pub mod observability;
pub mod orchestrator;
pub mod providers;
pub mod query_metrics;
pub mod state_store;
pub mod types;
pub mod vector_adapter;

// Re-export key types
pub use observability::{init_logging, init_logging_with_level, with_trace_id};

pub use contracts::{
    AnswerSynthesizer, EmbeddingGenerator, EmbeddingOutcome, SemanticSearcher, SemanticSearchSpec,
    StructuralSearcher, SynthesisInput, SynthesisOutcome,
};

// Re-export validated types
pub use types::{
    AmbiguityLevel, ContentKind, ConversationId, ConversationPhase, FeedbackRating,
    InteractionMode, ProjectScope, QueryIntent, QueryStatus, RequestId, SynthesisMode,
    ValidatedQuery,
};

// Re-export wire types
pub use http_types::{
    Citation, ClarificationQuestion, ConversationResponse, GatewayReply, QueryMeta, QueryRequestBody,
    QueryResponse, SemanticMatch, SemanticResult, StructuralRelationship, StructuralResult,
    SynthesizedAnswer, FALLBACK_MESSAGE,
};

// Re-export core subsystems
pub use config::GatewayConfig;
pub use conversation::{
    analyze_ambiguity, build_enriched_query, generate_clarifications, ContinueOutcome,
    ConversationController, ConversationState, ConversationStore,
};
pub use http_server::{create_router, start_server, AppState, Gateway};
pub use orchestrator::{OrchestratorConfig, OrchestratorRequest, QueryOrchestrator};
pub use providers::{
    EmbeddingChain, ProviderConfig, ProviderHealth, ProviderKind, SynthesisChain,
};
pub use state_store::{FallbackStore, MemoryStateStore, RedisStateStore, StateStore};
