// Conversation lifecycle: ambiguity diversion, clarification rounds, forced
// execution at the round bound, TTL refresh, and idempotent abort.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use quarry::confidence::ConfidenceMeter;
use quarry::contracts::{
    EmbeddingGenerator, EmbeddingOutcome, SemanticSearcher, SemanticSearchSpec, StructuralSearcher,
};
use quarry::conversation::{ContinueOutcome, ConversationController, ConversationStore};
use quarry::http_types::{QueryRequestBody, SemanticMatch, StructuralRelationship};
use quarry::orchestrator::{OrchestratorConfig, QueryOrchestrator};
use quarry::query_metrics::MetricsRecorder;
use quarry::state_store::{FallbackStore, StateStore, CONVERSATION_TTL};
use quarry::types::{
    ContentKind, ConversationId, ConversationPhase, ProjectScope, QueryIntent, QueryStatus,
    SynthesisMode, ValidatedQuery,
};
use quarry::{Gateway, GatewayReply};

/// Records every embedded query so tests can observe enrichment.
struct RecordingEmbedding {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl EmbeddingGenerator for RecordingEmbedding {
    async fn embed(&self, text: &str) -> Result<EmbeddingOutcome> {
        self.seen.lock().push(text.to_string());
        Ok(EmbeddingOutcome {
            vector: vec![0.5; 8],
            provider: "stub".to_string(),
            attempts: 1,
            failed_providers: Vec::new(),
            warnings: Vec::new(),
        })
    }

    fn dimension(&self) -> usize {
        8
    }
}

struct EchoVector;

#[async_trait]
impl SemanticSearcher for EchoVector {
    async fn search(
        &self,
        _embedding: &[f32],
        _spec: &SemanticSearchSpec,
    ) -> Result<Vec<SemanticMatch>> {
        Ok(vec![SemanticMatch {
            content: "fn authenticate()".to_string(),
            score: 0.88,
            source: "src/auth/service.rs".to_string(),
            kind: ContentKind::Code,
            line_range: None,
            language: Some("rust".to_string()),
        }])
    }

    async fn probe(&self) -> bool {
        true
    }

    async fn list_projects(&self) -> Result<Vec<String>> {
        Ok(vec![])
    }
}

struct EmptyGraph;

#[async_trait]
impl StructuralSearcher for EmptyGraph {
    async fn search(
        &self,
        _query: &str,
        _intent: QueryIntent,
        _project: Option<&ProjectScope>,
    ) -> Result<Vec<StructuralRelationship>> {
        Ok(vec![])
    }

    async fn probe(&self) -> bool {
        true
    }
}

struct Harness {
    gateway: Arc<Gateway>,
    embedding: Arc<RecordingEmbedding>,
    store: Arc<FallbackStore>,
}

fn harness() -> Harness {
    let embedding = Arc::new(RecordingEmbedding {
        seen: Mutex::new(Vec::new()),
    });
    let store = FallbackStore::in_memory();
    let orchestrator = Arc::new(QueryOrchestrator::new(
        embedding.clone(),
        Arc::new(EchoVector),
        Arc::new(EmptyGraph),
        None,
        Arc::new(ConfidenceMeter::with_defaults()),
        Arc::new(MetricsRecorder::new(
            Arc::clone(&store) as Arc<dyn StateStore>
        )),
        OrchestratorConfig::default(),
    ));
    let controller = Arc::new(ConversationController::new(
        Arc::clone(&store) as Arc<dyn StateStore>,
        Arc::clone(&orchestrator),
    ));
    Harness {
        gateway: Gateway::new(orchestrator, controller),
        embedding,
        store,
    }
}

fn ambiguous_body() -> QueryRequestBody {
    serde_json::from_value(serde_json::json!({ "query": "How does it work?" })).unwrap()
}

fn answers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn test_ambiguous_query_starts_conversation() -> Result<()> {
    let h = harness();
    let reply = h.gateway.handle_query(ambiguous_body(), false).await.unwrap();

    let GatewayReply::Clarify(conversation) = reply else {
        return Err(anyhow!("expected clarification, got an answer"));
    };
    assert_eq!(conversation.phase, ConversationPhase::Analyzing);
    assert_eq!(conversation.round, 1);
    assert_eq!(conversation.max_rounds, 3);
    assert!(conversation.questions.len() >= 2);
    assert!(conversation.questions.iter().any(|q| q.id == "scope"));
    // A fresh v4 UUID id.
    let id = ConversationId::parse(&conversation.conversation_id)?;
    assert_eq!(id.as_uuid().get_version_num(), 4);
    Ok(())
}

#[tokio::test]
async fn test_one_shot_mode_is_never_diverted() -> Result<()> {
    let h = harness();
    let body: QueryRequestBody =
        serde_json::from_value(serde_json::json!({ "query": "How does it work?", "mode": "one-shot" }))
            .unwrap();
    let reply = h.gateway.handle_query(body, false).await.unwrap();
    assert!(matches!(reply, GatewayReply::Answered(_)));
    Ok(())
}

#[tokio::test]
async fn test_clear_query_answers_directly() -> Result<()> {
    let h = harness();
    let body: QueryRequestBody = serde_json::from_value(
        serde_json::json!({ "query": "Show me the AuthService class", "synthesisMode": "raw" }),
    )
    .unwrap();
    let reply = h.gateway.handle_query(body, false).await.unwrap();
    let GatewayReply::Answered(response) = reply else {
        return Err(anyhow!("expected an answer"));
    };
    assert_eq!(response.status, QueryStatus::Success);
    Ok(())
}

#[tokio::test]
async fn test_three_continuations_reach_execution() -> Result<()> {
    let h = harness();
    let GatewayReply::Clarify(conversation) =
        h.gateway.handle_query(ambiguous_body(), false).await.unwrap()
    else {
        return Err(anyhow!("expected clarification"));
    };
    let id = ConversationId::parse(&conversation.conversation_id)?;
    let controller = h.gateway.controller();

    // Continuation 1: broad answers, more questions follow.
    let outcome = controller
        .continue_conversation(
            &id,
            &answers(&[("aspect", "Code implementation"), ("scope", "Entire system")]),
        )
        .await?;
    let ContinueOutcome::Clarify(step) = outcome else {
        return Err(anyhow!("expected round 2 questions"));
    };
    assert_eq!(step.round, 2);
    assert_eq!(step.phase, ConversationPhase::Clarifying);
    assert!(step.round >= 1 && step.round <= step.max_rounds);

    // Continuation 2: remaining broad question answered.
    let outcome = controller
        .continue_conversation(&id, &answers(&[("goal", "Understand how it works")]))
        .await?;
    let ContinueOutcome::Clarify(step) = outcome else {
        return Err(anyhow!("expected round 3 catch-all"));
    };
    assert_eq!(step.round, 3);
    assert_eq!(step.questions.len(), 1);
    assert!(step.questions[0].options.is_empty());

    // Continuation 3: round bound reached, execution is forced.
    let outcome = controller
        .continue_conversation(&id, &answers(&[("details", "the login path")]))
        .await?;
    let ContinueOutcome::Final(response) = outcome else {
        return Err(anyhow!("expected a terminal answer"));
    };
    assert_eq!(response.status, QueryStatus::Success);
    assert!(matches!(
        response.intent,
        QueryIntent::Code | QueryIntent::Both
    ));

    // The executed query carries the collected context.
    let seen = h.embedding.seen.lock();
    let executed = seen.last().expect("an executed query");
    assert!(executed.starts_with("How does it work?"));
    assert!(executed.contains("Focus: Code implementation."));
    assert!(executed.contains("Scope: Entire system."));
    assert!(executed.contains("Details: the login path."));

    // State is destroyed on completion.
    assert!(!ConversationStore::new(Arc::clone(&h.store) as Arc<dyn StateStore>)
        .exists(&id)
        .await?);
    Ok(())
}

#[tokio::test]
async fn test_unknown_conversation_gets_unavailable_shape() -> Result<()> {
    let h = harness();
    let outcome = h
        .gateway
        .controller()
        .continue_conversation(&ConversationId::new(), &answers(&[("aspect", "x")]))
        .await?;
    let ContinueOutcome::Final(response) = outcome else {
        return Err(anyhow!("expected a terminal response"));
    };
    assert_eq!(response.status, QueryStatus::Unavailable);
    assert!(response.fallback_message.is_some());
    assert!(!response.meta.qdrant_queried);
    assert!(!response.meta.neo4j_queried);
    Ok(())
}

#[tokio::test]
async fn test_abort_is_idempotent() -> Result<()> {
    let h = harness();
    let GatewayReply::Clarify(conversation) =
        h.gateway.handle_query(ambiguous_body(), false).await.unwrap()
    else {
        return Err(anyhow!("expected clarification"));
    };
    let id = ConversationId::parse(&conversation.conversation_id)?;
    let controller = h.gateway.controller();

    controller.abort(&id).await?;
    // Second abort of a missing conversation succeeds silently.
    controller.abort(&id).await?;
    // And an abort of a never-created id succeeds too.
    controller.abort(&ConversationId::new()).await?;

    let store = ConversationStore::new(Arc::clone(&h.store) as Arc<dyn StateStore>);
    assert!(!store.exists(&id).await?);
    assert!(store.get_all_active().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_every_mutation_refreshes_ttl() -> Result<()> {
    let h = harness();
    let GatewayReply::Clarify(conversation) =
        h.gateway.handle_query(ambiguous_body(), false).await.unwrap()
    else {
        return Err(anyhow!("expected clarification"));
    };
    let id = ConversationId::parse(&conversation.conversation_id)?;
    let controller = h.gateway.controller();

    let initial_ttl = controller.get_ttl(&id).await?.expect("ttl after create");
    assert!(initial_ttl <= CONVERSATION_TTL);
    assert!(initial_ttl > CONVERSATION_TTL - Duration::from_secs(60));

    tokio::time::sleep(Duration::from_millis(20)).await;
    controller
        .continue_conversation(&id, &answers(&[("aspect", "Code implementation")]))
        .await?;

    let refreshed_ttl = controller.get_ttl(&id).await?.expect("ttl after mutation");
    assert!(refreshed_ttl > CONVERSATION_TTL - Duration::from_secs(60));
    Ok(())
}

#[tokio::test]
async fn test_continuations_merge_context_across_rounds() -> Result<()> {
    let h = harness();
    let GatewayReply::Clarify(conversation) =
        h.gateway.handle_query(ambiguous_body(), false).await.unwrap()
    else {
        return Err(anyhow!("expected clarification"));
    };
    let id = ConversationId::parse(&conversation.conversation_id)?;
    let controller = h.gateway.controller();

    controller
        .continue_conversation(
            &id,
            &answers(&[("aspect", "Code implementation"), ("scope", "Specific component")]),
        )
        .await?;

    let store = ConversationStore::new(Arc::clone(&h.store) as Arc<dyn StateStore>);
    let state = store.load(&id).await?.expect("live conversation");
    assert_eq!(state.round, 2);
    assert_eq!(
        state.collected_context.get("scope").map(String::as_str),
        Some("Specific component")
    );
    // The follow-up for the chosen scope is now on the table.
    Ok(())
}
