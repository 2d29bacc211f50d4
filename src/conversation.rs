// Conversation Controller - ambiguity detection, clarification rounds, and
// multi-round state persisted through the shared state store. Continuations
// are serialized per conversation id; distinct conversations never contend.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::http_types::{
    ClarificationQuestion, ConversationResponse, QueryMeta, QueryResponse, SemanticResult,
    StructuralResult, FALLBACK_MESSAGE,
};
use crate::orchestrator::{OrchestratorRequest, QueryOrchestrator};
use crate::state_store::{conversation_key, StateStore, CONVERSATION_KEY_PREFIX, CONVERSATION_TTL};
use crate::types::{
    AmbiguityLevel, ConversationId, ConversationPhase, ProjectScope, QueryIntent, QueryStatus,
    RequestId, SynthesisMode, ValidatedQuery,
};

/// Clarification rounds are bounded; reaching the bound forces execution.
pub const MAX_ROUNDS: u32 = 3;

// Indicator classes scanned over the lowercased query.
const PRONOUN_INDICATORS: &[&str] = &["it", "they", "them", "that", "this", "those", "these"];
const VAGUE_INDICATORS: &[&str] = &[
    "something",
    "stuff",
    "things",
    "thing",
    "somehow",
    "whatever",
    "anything",
];
const BROAD_INDICATORS: &[&str] = &["all", "everything", "entire", "whole", "every", "overall"];

// Openers that signal the user already knows what they want.
const CLEAR_OPENERS: &[&str] = &[
    "show me", "what is", "what are", "explain", "where is", "where are", "how does", "list",
    "find",
];

/// What the ambiguity scan concluded about a query.
#[derive(Debug, Clone, PartialEq)]
pub struct AmbiguityAssessment {
    pub level: AmbiguityLevel,
    /// Indicator words that fired, in scan order.
    pub indicators: Vec<String>,
    pub clear_opener: bool,
}

impl AmbiguityAssessment {
    pub fn needs_clarification(&self) -> bool {
        self.level != AmbiguityLevel::Clear
    }
}

/// Scan a query for ambiguity indicators.
/// Zero hits is clear, one or two ambiguous, three or more requires-context.
pub fn analyze_ambiguity(query: &str) -> AmbiguityAssessment {
    let lowered = query.trim().to_lowercase();
    if lowered.is_empty() {
        return AmbiguityAssessment {
            level: AmbiguityLevel::RequiresContext,
            indicators: Vec::new(),
            clear_opener: false,
        };
    }

    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    let mut indicators = Vec::new();
    for class in [PRONOUN_INDICATORS, VAGUE_INDICATORS, BROAD_INDICATORS] {
        for indicator in class {
            if words.contains(indicator) {
                indicators.push((*indicator).to_string());
            }
        }
    }

    let clear_opener = CLEAR_OPENERS.iter().any(|o| lowered.starts_with(o));
    let level = match indicators.len() {
        0 => AmbiguityLevel::Clear,
        1 | 2 => AmbiguityLevel::Ambiguous,
        _ => AmbiguityLevel::RequiresContext,
    };

    AmbiguityAssessment {
        level,
        indicators,
        clear_opener,
    }
}

/// One message in the conversation transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Persisted state of one clarification conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub conversation_id: ConversationId,
    pub original_query: String,
    pub round: u32,
    pub max_rounds: u32,
    pub phase: ConversationPhase,
    /// Answers keyed by question id. BTreeMap keeps iteration deterministic.
    pub collected_context: BTreeMap<String, String>,
    pub messages: Vec<ConversationMessage>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<ProjectScope>,
    pub synthesis_mode: SynthesisMode,
}

impl ConversationState {
    fn new(
        query: &ValidatedQuery,
        project: Option<ProjectScope>,
        synthesis_mode: SynthesisMode,
    ) -> Self {
        Self {
            conversation_id: ConversationId::new(),
            original_query: query.as_str().to_string(),
            round: 1,
            max_rounds: MAX_ROUNDS,
            phase: ConversationPhase::Analyzing,
            collected_context: BTreeMap::new(),
            messages: Vec::new(),
            started_at: Utc::now(),
            project,
            synthesis_mode,
        }
    }
}

/// Spec-shaped persistence facade over the shared state store. Every save
/// refreshes the TTL, so active conversations never expire mid-exchange.
pub struct ConversationStore {
    store: Arc<dyn StateStore>,
}

impl ConversationStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub async fn save(&self, state: &ConversationState) -> Result<()> {
        let json = serde_json::to_string(state).context("failed to encode conversation state")?;
        self.store
            .put(
                &conversation_key(&state.conversation_id),
                json,
                Some(CONVERSATION_TTL),
            )
            .await
    }

    pub async fn load(&self, id: &ConversationId) -> Result<Option<ConversationState>> {
        let key = conversation_key(id);
        let Some(json) = self.store.get(&key).await? else {
            return Ok(None);
        };
        // The in-process fallback store does not expire keys on its own;
        // a zero remaining TTL means the conversation is gone either way.
        if self.store.ttl(&key).await? == Some(std::time::Duration::ZERO) {
            let _ = self.store.delete(&key).await;
            return Ok(None);
        }
        let state = serde_json::from_str(&json).context("stored conversation is not valid JSON")?;
        Ok(Some(state))
    }

    pub async fn delete(&self, id: &ConversationId) -> Result<bool> {
        self.store.delete(&conversation_key(id)).await
    }

    pub async fn exists(&self, id: &ConversationId) -> Result<bool> {
        self.store.exists(&conversation_key(id)).await
    }

    pub async fn get_all_active(&self) -> Result<Vec<ConversationState>> {
        let keys = self.store.keys_with_prefix(CONVERSATION_KEY_PREFIX).await?;
        let mut states = Vec::new();
        for key in keys {
            if let Some(json) = self.store.get(&key).await? {
                if let Ok(state) = serde_json::from_str::<ConversationState>(&json) {
                    states.push(state);
                }
            }
        }
        Ok(states)
    }

    pub async fn get_ttl(&self, id: &ConversationId) -> Result<Option<std::time::Duration>> {
        self.store.ttl(&conversation_key(id)).await
    }
}

// ---------------------------------------------------------------------------
// Clarification generation
// ---------------------------------------------------------------------------

fn aspect_question() -> ClarificationQuestion {
    ClarificationQuestion {
        id: "aspect".to_string(),
        question: "Which aspect are you most interested in?".to_string(),
        options: vec![
            "Code implementation".to_string(),
            "Architecture & design".to_string(),
            "Usage & examples".to_string(),
            "Configuration".to_string(),
        ],
        multi_select: false,
        required: true,
    }
}

fn scope_question() -> ClarificationQuestion {
    ClarificationQuestion {
        id: "scope".to_string(),
        question: "What scope should the answer cover?".to_string(),
        options: vec![
            "Entire system".to_string(),
            "Specific component".to_string(),
            "Specific file or function".to_string(),
        ],
        multi_select: false,
        required: true,
    }
}

fn goal_question() -> ClarificationQuestion {
    ClarificationQuestion {
        id: "goal".to_string(),
        question: "What is your goal?".to_string(),
        options: vec![
            "Understand how it works".to_string(),
            "Debug an issue".to_string(),
            "Make a change".to_string(),
            "Evaluate impact".to_string(),
        ],
        multi_select: false,
        required: false,
    }
}

fn component_question() -> ClarificationQuestion {
    ClarificationQuestion {
        id: "component".to_string(),
        question: "Which component or module should I focus on?".to_string(),
        options: Vec::new(),
        multi_select: false,
        required: true,
    }
}

fn symptom_question() -> ClarificationQuestion {
    ClarificationQuestion {
        id: "symptom".to_string(),
        question: "What symptom or error are you seeing?".to_string(),
        options: Vec::new(),
        multi_select: false,
        required: false,
    }
}

fn catch_all_question() -> ClarificationQuestion {
    ClarificationQuestion {
        id: "details".to_string(),
        question: "Anything else that would help narrow this down?".to_string(),
        options: Vec::new(),
        multi_select: false,
        required: false,
    }
}

/// Deterministic function of (query, classification, round, collected context).
/// Questions whose id is already answered are always suppressed.
pub fn generate_clarifications(
    _query: &str,
    intent: QueryIntent,
    round: u32,
    context: &BTreeMap<String, String>,
) -> Vec<ClarificationQuestion> {
    let mut questions: Vec<ClarificationQuestion> = Vec::new();

    let mut base = vec![aspect_question(), scope_question(), goal_question()];
    if intent == QueryIntent::Relationship {
        // Relationship queries already imply the aspect.
        base.retain(|q| q.id != "aspect");
    }

    match round {
        1 => questions.extend(base),
        _ => {
            // Unanswered broad questions carry over, then conditioned follow-ups.
            questions.extend(base);
            if context.get("scope").map(String::as_str) == Some("Specific component") {
                questions.push(component_question());
            }
            if context.get("goal").map(String::as_str) == Some("Debug an issue") {
                questions.push(symptom_question());
            }
        }
    }

    questions.retain(|q| !context.contains_key(&q.id));

    if round >= MAX_ROUNDS && questions.is_empty() {
        questions.push(catch_all_question());
    }

    questions
}

/// Append the collected context as explicit clauses the orchestrator can use.
pub fn build_enriched_query(
    original: &str,
    context: &BTreeMap<String, String>,
) -> String {
    let mut enriched = original.to_string();
    if let Some(aspect) = context.get("aspect") {
        enriched.push_str(&format!(" Focus: {aspect}."));
    }
    if let Some(scope) = context.get("scope") {
        enriched.push_str(&format!(" Scope: {scope}."));
    }
    if let Some(goal) = context.get("goal") {
        enriched.push_str(&format!(" Goal: {goal}."));
    }
    for (key, value) in context {
        if matches!(key.as_str(), "aspect" | "scope" | "goal") || value.trim().is_empty() {
            continue;
        }
        let mut label = key.clone();
        if let Some(first) = label.get_mut(0..1) {
            first.make_ascii_uppercase();
        }
        enriched.push_str(&format!(" {label}: {value}."));
    }
    enriched
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// What a continuation produced: more questions, or a terminal answer.
#[derive(Debug)]
pub enum ContinueOutcome {
    Clarify(ConversationResponse),
    Final(Box<QueryResponse>),
}

/// Owns every ConversationState mutation. The orchestrator is consumed only
/// through the enriched-query value object, never the other way around.
pub struct ConversationController {
    store: ConversationStore,
    orchestrator: Arc<QueryOrchestrator>,
    locks: DashMap<ConversationId, Arc<Mutex<()>>>,
    started: std::sync::atomic::AtomicU64,
}

impl ConversationController {
    pub fn new(store: Arc<dyn StateStore>, orchestrator: Arc<QueryOrchestrator>) -> Self {
        Self {
            store: ConversationStore::new(store),
            orchestrator,
            locks: DashMap::new(),
            started: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn started_count(&self) -> u64 {
        self.started.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub async fn active_count(&self) -> usize {
        self.store.get_all_active().await.map(|s| s.len()).unwrap_or(0)
    }

    fn lock_for(&self, id: ConversationId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Start a conversation for an ambiguous query.
    pub async fn start(
        &self,
        query: &ValidatedQuery,
        project: Option<ProjectScope>,
        synthesis_mode: SynthesisMode,
    ) -> Result<ConversationResponse> {
        let intent = QueryOrchestrator::classify_intent(query.as_str());
        let mut state = ConversationState::new(query, project, synthesis_mode);

        let questions =
            generate_clarifications(query.as_str(), intent, state.round, &state.collected_context);
        state.messages.push(ConversationMessage {
            role: "user".to_string(),
            content: query.as_str().to_string(),
            timestamp: Utc::now(),
        });
        state.messages.push(ConversationMessage {
            role: "assistant".to_string(),
            content: format!("asked {} clarification questions", questions.len()),
            timestamp: Utc::now(),
        });

        self.store.save(&state).await?;
        self.started
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        info!(
            conversation_id = %state.conversation_id,
            indicators = ?analyze_ambiguity(query.as_str()).indicators,
            "conversation started"
        );

        Ok(ConversationResponse {
            conversation_id: state.conversation_id.to_string(),
            phase: state.phase,
            round: state.round,
            max_rounds: state.max_rounds,
            questions,
            message: Some("Your query needs clarification before it can be answered.".to_string()),
        })
    }

    /// Merge answers and either ask the next round or execute the enriched query.
    pub async fn continue_conversation(
        &self,
        id: &ConversationId,
        answers: &BTreeMap<String, String>,
    ) -> Result<ContinueOutcome> {
        let lock = self.lock_for(*id);
        let _guard = lock.lock().await;

        let Some(mut state) = self.store.load(id).await? else {
            debug!(conversation_id = %id, "continuation for unknown or expired conversation");
            return Ok(ContinueOutcome::Final(Box::new(expired_response(id))));
        };

        for (key, value) in answers {
            if !value.trim().is_empty() {
                state
                    .collected_context
                    .insert(key.clone(), value.trim().to_string());
            }
        }
        state.messages.push(ConversationMessage {
            role: "user".to_string(),
            content: serde_json::to_string(answers).unwrap_or_default(),
            timestamp: Utc::now(),
        });

        if state.round >= state.max_rounds {
            return self.execute(state).await;
        }

        state.round = (state.round + 1).min(state.max_rounds);
        let intent = QueryOrchestrator::classify_intent(&state.original_query);
        let questions = generate_clarifications(
            &state.original_query,
            intent,
            state.round,
            &state.collected_context,
        );

        if questions.is_empty() {
            return self.execute(state).await;
        }

        state.phase = ConversationPhase::Clarifying;
        state.messages.push(ConversationMessage {
            role: "assistant".to_string(),
            content: format!("asked {} clarification questions", questions.len()),
            timestamp: Utc::now(),
        });
        self.store.save(&state).await?;

        Ok(ContinueOutcome::Clarify(ConversationResponse {
            conversation_id: state.conversation_id.to_string(),
            phase: state.phase,
            round: state.round,
            max_rounds: state.max_rounds,
            questions,
            message: None,
        }))
    }

    /// Abort and delete. Deleting a missing conversation succeeds silently.
    pub async fn abort(&self, id: &ConversationId) -> Result<()> {
        let lock = self.lock_for(*id);
        let _guard = lock.lock().await;
        let _ = self.store.delete(id).await?;
        self.locks.remove(id);
        debug!(conversation_id = %id, "conversation aborted");
        Ok(())
    }

    pub async fn get_ttl(&self, id: &ConversationId) -> Result<Option<std::time::Duration>> {
        self.store.get_ttl(id).await
    }

    async fn execute(&self, mut state: ConversationState) -> Result<ContinueOutcome> {
        state.phase = ConversationPhase::Executing;
        self.store.save(&state).await?;

        let enriched = build_enriched_query(&state.original_query, &state.collected_context);
        let query = ValidatedQuery::new(enriched)
            .context("enriched query construction produced an invalid query")?;

        let request = OrchestratorRequest {
            request_id: RequestId::generate(),
            query,
            project: state.project.clone(),
            context: Vec::new(),
            synthesis_mode: state.synthesis_mode,
        };
        let response = self.orchestrator.execute(request).await;

        // The conversation is done; its state is destroyed on completion.
        state.phase = ConversationPhase::Completed;
        let _ = self.store.delete(&state.conversation_id).await;
        self.locks.remove(&state.conversation_id);
        info!(conversation_id = %state.conversation_id, "conversation executed");

        Ok(ContinueOutcome::Final(Box::new(response)))
    }
}

/// Unavailable-shaped response for unknown or expired conversations.
fn expired_response(id: &ConversationId) -> QueryResponse {
    QueryResponse {
        request_id: RequestId::generate().to_string(),
        status: QueryStatus::Unavailable,
        intent: QueryIntent::Unknown,
        timestamp: Utc::now(),
        semantic: SemanticResult::empty(),
        structural: StructuralResult::empty(),
        answer: None,
        meta: QueryMeta {
            qdrant_queried: false,
            neo4j_queried: false,
            qdrant_latency_ms: 0,
            neo4j_latency_ms: 0,
            total_latency_ms: 0,
            cache_hit: false,
        },
        warnings: vec![format!("Conversation {id} was not found or has expired")],
        fallback_message: Some(FALLBACK_MESSAGE.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_query() {
        let assessment = analyze_ambiguity("Show me the AuthService class");
        assert_eq!(assessment.level, AmbiguityLevel::Clear);
        assert!(assessment.clear_opener);
    }

    #[test]
    fn test_ambiguous_query_one_or_two_indicators() {
        let assessment = analyze_ambiguity("How does it work?");
        assert_eq!(assessment.level, AmbiguityLevel::Ambiguous);
        assert_eq!(assessment.indicators, vec!["it"]);
    }

    #[test]
    fn test_requires_context_three_indicators() {
        let assessment = analyze_ambiguity("tell me everything about all that stuff");
        assert_eq!(assessment.level, AmbiguityLevel::RequiresContext);
        assert!(assessment.indicators.len() >= 3);
    }

    #[test]
    fn test_empty_query_requires_context() {
        let assessment = analyze_ambiguity("   ");
        assert_eq!(assessment.level, AmbiguityLevel::RequiresContext);
    }

    #[test]
    fn test_clear_opener_does_not_remove_ambiguity() {
        let assessment = analyze_ambiguity("explain how it works");
        assert!(assessment.clear_opener);
        assert_eq!(assessment.level, AmbiguityLevel::Ambiguous);
    }

    #[test]
    fn test_indicator_matching_is_word_bounded() {
        // "italic" contains "it" but must not fire the pronoun indicator.
        let assessment = analyze_ambiguity("find italic rendering in the markdown parser");
        assert_eq!(assessment.level, AmbiguityLevel::Clear);
    }

    #[test]
    fn test_round_one_questions_include_scope() {
        let questions =
            generate_clarifications("how does it work", QueryIntent::Both, 1, &BTreeMap::new());
        assert!(questions.len() >= 2);
        assert!(questions.iter().any(|q| q.id == "scope"));
        assert!(questions.iter().any(|q| q.id == "aspect"));
    }

    #[test]
    fn test_answered_questions_are_suppressed() {
        let mut context = BTreeMap::new();
        context.insert("aspect".to_string(), "Code implementation".to_string());
        let questions = generate_clarifications("q", QueryIntent::Both, 2, &context);
        assert!(questions.iter().all(|q| q.id != "aspect"));
    }

    #[test]
    fn test_component_follow_up_when_scope_is_specific() {
        let mut context = BTreeMap::new();
        context.insert("aspect".to_string(), "Code implementation".to_string());
        context.insert("scope".to_string(), "Specific component".to_string());
        let questions = generate_clarifications("q", QueryIntent::Both, 2, &context);
        assert!(questions.iter().any(|q| q.id == "component"));
    }

    #[test]
    fn test_round_three_catch_all_only_when_nothing_remains() {
        let mut context = BTreeMap::new();
        context.insert("aspect".to_string(), "a".to_string());
        context.insert("scope".to_string(), "Entire system".to_string());
        context.insert("goal".to_string(), "g".to_string());
        let questions = generate_clarifications("q", QueryIntent::Both, 3, &context);
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].id, "details");
        assert!(questions[0].options.is_empty());
    }

    #[test]
    fn test_generation_is_deterministic() {
        let context = BTreeMap::new();
        let a = generate_clarifications("how does it work", QueryIntent::Code, 1, &context);
        let b = generate_clarifications("how does it work", QueryIntent::Code, 1, &context);
        assert_eq!(a, b);
    }

    #[test]
    fn test_enriched_query_clauses() {
        let mut context = BTreeMap::new();
        context.insert("aspect".to_string(), "Code implementation".to_string());
        context.insert("scope".to_string(), "Entire system".to_string());
        context.insert("component".to_string(), "auth".to_string());
        let enriched = build_enriched_query("How does it work?", &context);
        assert!(enriched.starts_with("How does it work?"));
        assert!(enriched.contains("Focus: Code implementation."));
        assert!(enriched.contains("Scope: Entire system."));
        assert!(enriched.contains("Component: auth."));
    }
}
