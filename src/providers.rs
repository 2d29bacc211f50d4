// Provider Fallback Engine - ordered multi-provider chains for embedding and
// synthesis with per-provider circuit breakers and health tracking.
//
// Breaker discipline: a provider is skipped while it has accumulated three or
// more consecutive failures inside the cooldown window. Once the cooldown
// elapses the provider is retried exactly once; success closes the breaker.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::contracts::{
    AnswerSynthesizer, EmbeddingGenerator, EmbeddingOutcome, SynthesisInput, SynthesisOutcome,
};
use crate::http_types::Citation;

/// Consecutive failures at which a provider's breaker opens.
pub const BREAKER_FAILURE_THRESHOLD: u32 = 3;

/// How long an open breaker suppresses calls before a half-open retry.
pub const BREAKER_COOLDOWN: Duration = Duration::from_secs(60);

/// Upper bound on cached query embeddings.
const EMBEDDING_CACHE_CAPACITY: usize = 1024;

/// Supported provider wire protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    OpenaiCompatible,
    AnthropicCompatible,
    Local,
}

/// Configuration of one provider in a chain.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub name: String,
    pub kind: ProviderKind,
    pub base_url: String,
    pub model: String,
    #[serde(skip_serializing, default)]
    pub api_key: Option<String>,
    pub timeout: Duration,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    /// Declared output dimension; embedding chains require this to match the
    /// chain target at construction.
    pub dimensions: Option<usize>,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .field("dimensions", &self.dimensions)
            .finish()
    }
}

/// Health record for one configured provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealth {
    pub provider_id: String,
    pub name: String,
    pub available: bool,
    pub last_checked: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

struct BreakerState {
    health: ProviderHealth,
    last_attempt: Option<Instant>,
}

impl BreakerState {
    fn new(config: &ProviderConfig) -> Self {
        Self {
            health: ProviderHealth {
                provider_id: config.id.clone(),
                name: config.name.clone(),
                available: true,
                last_checked: Utc::now(),
                last_error: None,
                consecutive_failures: 0,
            },
            last_attempt: None,
        }
    }

    fn breaker_open(&self) -> bool {
        if self.health.consecutive_failures < BREAKER_FAILURE_THRESHOLD {
            return false;
        }
        match self.last_attempt {
            Some(at) => at.elapsed() < BREAKER_COOLDOWN,
            None => false,
        }
    }
}

/// Aggregated failure after every provider in a chain was tried.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("no {label} providers are configured")]
    Empty { label: &'static str },

    #[error("all {label} providers failed: {}", format_attempts(.attempts))]
    Exhausted {
        label: &'static str,
        attempts: Vec<(String, String)>,
    },
}

fn format_attempts(attempts: &[(String, String)]) -> String {
    attempts
        .iter()
        .map(|(provider, error)| format!("{provider}: {error}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result of one successful chain invocation.
struct ChainSuccess<T> {
    value: T,
    provider: String,
    attempts: u32,
    failed_providers: Vec<String>,
}

/// Shared chain machinery: ordered provider iteration, breaker bookkeeping,
/// health snapshots. Both chains delegate here so the breaker semantics
/// cannot drift between them.
struct ChainCore {
    label: &'static str,
    providers: Vec<ProviderConfig>,
    states: RwLock<HashMap<String, BreakerState>>,
    client: reqwest::Client,
}

impl ChainCore {
    fn new(label: &'static str, providers: Vec<ProviderConfig>) -> Result<Self> {
        let states = providers
            .iter()
            .map(|p| (p.id.clone(), BreakerState::new(p)))
            .collect();
        let client = reqwest::Client::builder()
            .build()
            .context("failed to build provider HTTP client")?;
        Ok(Self {
            label,
            providers,
            states: RwLock::new(states),
            client,
        })
    }

    fn is_open(&self, id: &str) -> bool {
        self.states
            .read()
            .get(id)
            .map(BreakerState::breaker_open)
            .unwrap_or(false)
    }

    fn record_success(&self, id: &str) {
        let mut states = self.states.write();
        if let Some(state) = states.get_mut(id) {
            state.health.available = true;
            state.health.consecutive_failures = 0;
            state.health.last_error = None;
            state.health.last_checked = Utc::now();
            state.last_attempt = Some(Instant::now());
        }
    }

    fn record_failure(&self, id: &str, error: &str) {
        let mut states = self.states.write();
        if let Some(state) = states.get_mut(id) {
            state.health.consecutive_failures += 1;
            state.health.last_error = Some(error.to_string());
            state.health.last_checked = Utc::now();
            state.last_attempt = Some(Instant::now());
            if state.health.consecutive_failures >= BREAKER_FAILURE_THRESHOLD {
                state.health.available = false;
                warn!(
                    "{} provider '{}' marked unavailable after {} consecutive failures",
                    self.label, id, state.health.consecutive_failures
                );
            }
        }
    }

    fn health_snapshot(&self) -> Vec<ProviderHealth> {
        let states = self.states.read();
        self.providers
            .iter()
            .filter_map(|p| states.get(&p.id).map(|s| s.health.clone()))
            .collect()
    }

    /// Try providers in configured order until one succeeds.
    async fn run<'a, T, F, Fut>(&'a self, call: F) -> Result<ChainSuccess<T>, ChainError>
    where
        F: Fn(&'a ProviderConfig, &'a reqwest::Client) -> Fut,
        Fut: std::future::Future<Output = Result<T>> + 'a,
    {
        if self.providers.is_empty() {
            return Err(ChainError::Empty { label: self.label });
        }

        let mut attempts = 0u32;
        let mut failures: Vec<(String, String)> = Vec::new();

        for provider in &self.providers {
            if self.is_open(&provider.id) {
                debug!(
                    "{} provider '{}' skipped, circuit breaker open",
                    self.label, provider.id
                );
                continue;
            }

            attempts += 1;
            let outcome = tokio::time::timeout(provider.timeout, call(provider, &self.client)).await;

            match outcome {
                Ok(Ok(value)) => {
                    self.record_success(&provider.id);
                    return Ok(ChainSuccess {
                        value,
                        provider: provider.id.clone(),
                        attempts,
                        failed_providers: failures.into_iter().map(|(id, _)| id).collect(),
                    });
                }
                Ok(Err(e)) => {
                    let message = e.to_string();
                    self.record_failure(&provider.id, &message);
                    failures.push((provider.id.clone(), message));
                }
                Err(_) => {
                    let message = format!("timed out after {:?}", provider.timeout);
                    self.record_failure(&provider.id, &message);
                    failures.push((provider.id.clone(), message));
                }
            }
        }

        Err(ChainError::Exhausted {
            label: self.label,
            attempts: failures,
        })
    }
}

// ---------------------------------------------------------------------------
// Embedding chain
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct OpenAiEmbeddingRequest<'a> {
    input: Vec<&'a str>,
    model: &'a str,
    encoding_format: &'static str,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingData>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Ordered embedding providers behind one `EmbeddingGenerator` seam.
pub struct EmbeddingChain {
    core: ChainCore,
    target_dimension: usize,
    cache: Mutex<HashMap<String, Vec<f32>>>,
}

impl EmbeddingChain {
    /// Build the chain, failing fast when any provider's declared dimension
    /// disagrees with the chain target.
    pub fn new(providers: Vec<ProviderConfig>, target_dimension: usize) -> Result<Self> {
        for provider in &providers {
            if let Some(dims) = provider.dimensions {
                if dims != target_dimension {
                    return Err(anyhow!(
                        "embedding provider '{}' declares {} dimensions but the chain target is {}",
                        provider.id,
                        dims,
                        target_dimension
                    ));
                }
            }
        }
        Ok(Self {
            core: ChainCore::new("embedding", providers)?,
            target_dimension,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn provider_count(&self) -> usize {
        self.core.providers.len()
    }

    pub fn health(&self) -> Vec<ProviderHealth> {
        self.core.health_snapshot()
    }

    /// Re-probe every provider and close breakers for the ones that recovered.
    pub async fn refresh(&self) -> Vec<ProviderHealth> {
        for provider in &self.core.providers {
            let result = tokio::time::timeout(
                provider.timeout,
                embed_with_provider(provider, &self.core.client, "ping"),
            )
            .await;
            match result {
                Ok(Ok(_)) => self.core.record_success(&provider.id),
                Ok(Err(e)) => self.core.record_failure(&provider.id, &e.to_string()),
                Err(_) => self
                    .core
                    .record_failure(&provider.id, &format!("timed out after {:?}", provider.timeout)),
            }
        }
        self.core.health_snapshot()
    }

    /// One diagnostic call against a single provider, used by `check-providers`.
    pub async fn check_provider(&self, provider_id: &str) -> Result<()> {
        let provider = self
            .core
            .providers
            .iter()
            .find(|p| p.id == provider_id)
            .ok_or_else(|| anyhow!("unknown embedding provider '{provider_id}'"))?;
        let vector = tokio::time::timeout(
            provider.timeout,
            embed_with_provider(provider, &self.core.client, "ping"),
        )
        .await
        .map_err(|_| anyhow!("timed out after {:?}", provider.timeout))??;
        if vector.len() < self.target_dimension {
            return Err(anyhow!(
                "provider returned {} dimensions, expected {}",
                vector.len(),
                self.target_dimension
            ));
        }
        Ok(())
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.core.providers.iter().map(|p| p.id.clone()).collect()
    }

    fn cache_get(&self, text: &str) -> Option<Vec<f32>> {
        self.cache.lock().get(text).cloned()
    }

    fn cache_put(&self, text: &str, vector: &[f32]) {
        let mut cache = self.cache.lock();
        if cache.len() >= EMBEDDING_CACHE_CAPACITY {
            cache.clear();
        }
        cache.insert(text.to_string(), vector.to_vec());
    }
}

async fn embed_with_provider(
    provider: &ProviderConfig,
    client: &reqwest::Client,
    text: &str,
) -> Result<Vec<f32>> {
    match provider.kind {
        ProviderKind::OpenaiCompatible | ProviderKind::AnthropicCompatible => {
            let url = format!("{}/embeddings", provider.base_url.trim_end_matches('/'));
            let mut request = client.post(&url).json(&OpenAiEmbeddingRequest {
                input: vec![text],
                model: &provider.model,
                encoding_format: "float",
            });
            if let Some(key) = &provider.api_key {
                request = match provider.kind {
                    ProviderKind::AnthropicCompatible => request.header("x-api-key", key),
                    _ => request.bearer_auth(key),
                };
            }
            for (name, value) in &provider.extra_headers {
                request = request.header(name, value);
            }
            let response = request.send().await?;
            if !response.status().is_success() {
                let status = response.status();
                return Err(anyhow!("embedding request failed with HTTP {status}"));
            }
            let mut body: OpenAiEmbeddingResponse = response.json().await?;
            body.data.sort_by_key(|d| d.index);
            body.data
                .into_iter()
                .next()
                .map(|d| d.embedding)
                .ok_or_else(|| anyhow!("embedding response contained no vectors"))
        }
        ProviderKind::Local => {
            let url = format!("{}/api/embed", provider.base_url.trim_end_matches('/'));
            let mut request = client.post(&url).json(&OllamaEmbedRequest {
                model: &provider.model,
                input: text,
            });
            for (name, value) in &provider.extra_headers {
                request = request.header(name, value);
            }
            let response = request.send().await?;
            if !response.status().is_success() {
                let status = response.status();
                return Err(anyhow!("embedding request failed with HTTP {status}"));
            }
            let body: OllamaEmbedResponse = response.json().await?;
            body.embeddings
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("embedding response contained no vectors"))
        }
    }
}

#[async_trait]
impl EmbeddingGenerator for EmbeddingChain {
    async fn embed(&self, text: &str) -> Result<EmbeddingOutcome> {
        if let Some(vector) = self.cache_get(text) {
            return Ok(EmbeddingOutcome {
                vector,
                provider: "cache".to_string(),
                attempts: 0,
                failed_providers: Vec::new(),
                warnings: Vec::new(),
            });
        }

        let target = self.target_dimension;
        let success = self
            .core
            .run(|provider, client| async move {
                let vector = embed_with_provider(provider, client, text).await?;
                // A short vector cannot be padded honestly; treat it as a
                // provider failure so the chain moves on.
                if vector.len() < target {
                    return Err(anyhow!(
                        "provider returned {} dimensions, expected {}",
                        vector.len(),
                        target
                    ));
                }
                Ok(vector)
            })
            .await
            .map_err(anyhow::Error::from)?;

        let mut vector = success.value;
        let mut warnings = Vec::new();
        if vector.len() > target {
            warnings.push(format!(
                "embedding truncated from {} to {} dimensions",
                vector.len(),
                target
            ));
            warn!(
                "provider '{}' returned {} dimensions, truncating to {}",
                success.provider,
                vector.len(),
                target
            );
            vector.truncate(target);
        }

        self.cache_put(text, &vector);

        Ok(EmbeddingOutcome {
            vector,
            provider: success.provider,
            attempts: success.attempts,
            failed_providers: success.failed_providers,
            warnings,
        })
    }

    fn dimension(&self) -> usize {
        self.target_dimension
    }
}

// ---------------------------------------------------------------------------
// Synthesis chain
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct OpenAiChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChatChoice>,
}

#[derive(Deserialize)]
struct OpenAiChatChoice {
    message: OpenAiChatMessageBody,
}

#[derive(Deserialize)]
struct OpenAiChatMessageBody {
    content: String,
}

#[derive(Serialize)]
struct AnthropicMessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Deserialize)]
struct AnthropicMessagesResponse {
    content: Vec<AnthropicContentBlock>,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: OllamaChatMessageBody,
}

#[derive(Deserialize)]
struct OllamaChatMessageBody {
    content: String,
}

const SYNTHESIS_SYSTEM_PROMPT: &str = "You are a codebase analyst. Answer strictly from the \
evidence snippets and relationships provided. Reference sources by their file path. If the \
evidence is insufficient, say so rather than inventing details.";

const SYNTHESIS_MAX_TOKENS: u32 = 2048;

/// Ordered synthesis providers behind one `AnswerSynthesizer` seam.
pub struct SynthesisChain {
    core: ChainCore,
}

impl SynthesisChain {
    pub fn new(providers: Vec<ProviderConfig>) -> Result<Self> {
        Ok(Self {
            core: ChainCore::new("synthesis", providers)?,
        })
    }

    pub fn provider_count(&self) -> usize {
        self.core.providers.len()
    }

    pub fn health(&self) -> Vec<ProviderHealth> {
        self.core.health_snapshot()
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.core.providers.iter().map(|p| p.id.clone()).collect()
    }

    /// One diagnostic completion against a single provider.
    pub async fn check_provider(&self, provider_id: &str) -> Result<()> {
        let provider = self
            .core
            .providers
            .iter()
            .find(|p| p.id == provider_id)
            .ok_or_else(|| anyhow!("unknown synthesis provider '{provider_id}'"))?;
        let answer = tokio::time::timeout(
            provider.timeout,
            complete_with_provider(provider, &self.core.client, "Reply with the word ready."),
        )
        .await
        .map_err(|_| anyhow!("timed out after {:?}", provider.timeout))??;
        if answer.trim().is_empty() {
            return Err(anyhow!("provider returned an empty completion"));
        }
        Ok(())
    }

    /// Re-probe every provider and close breakers for the ones that recovered.
    pub async fn refresh(&self) -> Vec<ProviderHealth> {
        for provider in &self.core.providers {
            let result = tokio::time::timeout(
                provider.timeout,
                complete_with_provider(provider, &self.core.client, "Reply with the word ready."),
            )
            .await;
            match result {
                Ok(Ok(_)) => self.core.record_success(&provider.id),
                Ok(Err(e)) => self.core.record_failure(&provider.id, &e.to_string()),
                Err(_) => self
                    .core
                    .record_failure(&provider.id, &format!("timed out after {:?}", provider.timeout)),
            }
        }
        self.core.health_snapshot()
    }

    fn build_prompt(input: &SynthesisInput) -> String {
        let mut prompt = String::with_capacity(4096);
        prompt.push_str("Question: ");
        prompt.push_str(&input.query);
        prompt.push_str("\n\nCode evidence:\n");
        if input.matches.is_empty() {
            prompt.push_str("(none)\n");
        }
        for m in &input.matches {
            prompt.push_str(&format!(
                "--- {} (similarity {:.2})\n{}\n",
                m.source, m.score, m.content
            ));
        }
        prompt.push_str("\nRelationships:\n");
        if input.relationships.is_empty() {
            prompt.push_str("(none)\n");
        }
        for r in &input.relationships {
            prompt.push_str(&format!("- {} {} {}\n", r.source, r.relation, r.target));
        }
        prompt.push_str("\nAnswer in markdown, citing file paths from the evidence above.");
        prompt
    }

    /// Citations come from evidence the answer actually references; the model
    /// cannot introduce sources that were not part of the input.
    fn extract_citations(input: &SynthesisInput, answer: &str) -> Vec<Citation> {
        let mut citations: Vec<Citation> = input
            .matches
            .iter()
            .filter(|m| answer.contains(m.source.as_str()))
            .map(|m| Citation {
                source: m.source.clone(),
                line_range: m.line_range,
                relevance: m.score,
                kind: m.kind,
            })
            .collect();

        if citations.is_empty() {
            // Nothing referenced by path; fall back to the strongest evidence.
            citations = input
                .matches
                .iter()
                .take(3)
                .map(|m| Citation {
                    source: m.source.clone(),
                    line_range: m.line_range,
                    relevance: m.score,
                    kind: m.kind,
                })
                .collect();
        }

        citations.dedup_by(|a, b| a.source == b.source);
        citations
    }
}

async fn complete_with_provider(
    provider: &ProviderConfig,
    client: &reqwest::Client,
    prompt: &str,
) -> Result<String> {
    match provider.kind {
        ProviderKind::OpenaiCompatible => {
            let url = format!("{}/chat/completions", provider.base_url.trim_end_matches('/'));
            let mut request = client.post(&url).json(&OpenAiChatRequest {
                model: &provider.model,
                messages: vec![
                    ChatMessage {
                        role: "system",
                        content: SYNTHESIS_SYSTEM_PROMPT,
                    },
                    ChatMessage {
                        role: "user",
                        content: prompt,
                    },
                ],
                temperature: 0.0,
            });
            if let Some(key) = &provider.api_key {
                request = request.bearer_auth(key);
            }
            for (name, value) in &provider.extra_headers {
                request = request.header(name, value);
            }
            let response = request.send().await?;
            if !response.status().is_success() {
                let status = response.status();
                return Err(anyhow!("synthesis request failed with HTTP {status}"));
            }
            let body: OpenAiChatResponse = response.json().await?;
            body.choices
                .into_iter()
                .next()
                .map(|c| c.message.content)
                .ok_or_else(|| anyhow!("synthesis response contained no choices"))
        }
        ProviderKind::AnthropicCompatible => {
            let url = format!("{}/v1/messages", provider.base_url.trim_end_matches('/'));
            let mut request = client
                .post(&url)
                .header("anthropic-version", "2023-06-01")
                .json(&AnthropicMessagesRequest {
                    model: &provider.model,
                    max_tokens: SYNTHESIS_MAX_TOKENS,
                    system: SYNTHESIS_SYSTEM_PROMPT,
                    messages: vec![ChatMessage {
                        role: "user",
                        content: prompt,
                    }],
                });
            if let Some(key) = &provider.api_key {
                request = request.header("x-api-key", key);
            }
            for (name, value) in &provider.extra_headers {
                request = request.header(name, value);
            }
            let response = request.send().await?;
            if !response.status().is_success() {
                let status = response.status();
                return Err(anyhow!("synthesis request failed with HTTP {status}"));
            }
            let body: AnthropicMessagesResponse = response.json().await?;
            let text = body
                .content
                .into_iter()
                .map(|block| block.text)
                .collect::<Vec<_>>()
                .join("");
            if text.is_empty() {
                return Err(anyhow!("synthesis response contained no text"));
            }
            Ok(text)
        }
        ProviderKind::Local => {
            let url = format!("{}/api/chat", provider.base_url.trim_end_matches('/'));
            let mut request = client.post(&url).json(&OllamaChatRequest {
                model: &provider.model,
                messages: vec![
                    ChatMessage {
                        role: "system",
                        content: SYNTHESIS_SYSTEM_PROMPT,
                    },
                    ChatMessage {
                        role: "user",
                        content: prompt,
                    },
                ],
                stream: false,
            });
            for (name, value) in &provider.extra_headers {
                request = request.header(name, value);
            }
            let response = request.send().await?;
            if !response.status().is_success() {
                let status = response.status();
                return Err(anyhow!("synthesis request failed with HTTP {status}"));
            }
            let body: OllamaChatResponse = response.json().await?;
            Ok(body.message.content)
        }
    }
}

#[async_trait]
impl AnswerSynthesizer for SynthesisChain {
    async fn synthesize(&self, input: &SynthesisInput) -> Result<SynthesisOutcome> {
        let prompt = Self::build_prompt(input);
        let prompt_ref = prompt.as_str();
        let success = self
            .core
            .run(|provider, client| async move {
                let answer = complete_with_provider(provider, client, prompt_ref).await?;
                if answer.trim().is_empty() {
                    return Err(anyhow!("provider returned an empty completion"));
                }
                Ok(answer)
            })
            .await
            .map_err(anyhow::Error::from)?;

        let citations = Self::extract_citations(input, &success.value);
        info!(
            provider = %success.provider,
            attempts = success.attempts,
            "synthesis completed"
        );

        Ok(SynthesisOutcome {
            answer: success.value,
            citations,
            provider: success.provider,
            attempts: success.attempts,
            failed_providers: success.failed_providers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_types::SemanticMatch;
    use crate::types::{ContentKind, QueryIntent};

    fn test_provider(id: &str) -> ProviderConfig {
        ProviderConfig {
            id: id.to_string(),
            name: id.to_string(),
            kind: ProviderKind::OpenaiCompatible,
            base_url: "http://127.0.0.1:1".to_string(),
            model: "test-model".to_string(),
            api_key: None,
            timeout: Duration::from_millis(200),
            extra_headers: HashMap::new(),
            dimensions: Some(8),
        }
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let mut provider = test_provider("a");
        provider.api_key = Some("sk-super-secret".to_string());
        let rendered = format!("{provider:?}");
        assert!(!rendered.contains("sk-super-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_embedding_chain_rejects_dimension_mismatch() {
        let mut provider = test_provider("a");
        provider.dimensions = Some(16);
        let result = EmbeddingChain::new(vec![provider], 8);
        assert!(result.is_err());
    }

    #[test]
    fn test_breaker_opens_after_threshold() {
        let core = ChainCore::new("embedding", vec![test_provider("a")]).unwrap();
        assert!(!core.is_open("a"));
        for _ in 0..BREAKER_FAILURE_THRESHOLD {
            core.record_failure("a", "connection refused");
        }
        assert!(core.is_open("a"));

        let health = core.health_snapshot();
        assert_eq!(health[0].consecutive_failures, BREAKER_FAILURE_THRESHOLD);
        assert!(!health[0].available);
        assert_eq!(health[0].last_error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_breaker_closes_on_success() {
        let core = ChainCore::new("synthesis", vec![test_provider("a")]).unwrap();
        for _ in 0..5 {
            core.record_failure("a", "boom");
        }
        assert!(core.is_open("a"));
        core.record_success("a");
        assert!(!core.is_open("a"));
        assert!(core.health_snapshot()[0].available);
    }

    #[tokio::test]
    async fn test_chain_exhaustion_aggregates_errors() {
        let core = ChainCore::new("embedding", vec![test_provider("a"), test_provider("b")]).unwrap();
        let result: Result<ChainSuccess<()>, ChainError> = core
            .run(|provider, _client| {
                let id = provider.id.clone();
                async move { Err(anyhow!("{} is down", id)) }
            })
            .await;

        let err = result.err().unwrap();
        let rendered = err.to_string();
        assert!(rendered.contains("a is down"));
        assert!(rendered.contains("b is down"));
    }

    #[tokio::test]
    async fn test_chain_skips_open_breaker() {
        let core = ChainCore::new("embedding", vec![test_provider("a"), test_provider("b")]).unwrap();
        for _ in 0..BREAKER_FAILURE_THRESHOLD {
            core.record_failure("a", "down");
        }

        let success = core
            .run(|provider, _client| {
                let id = provider.id.clone();
                async move {
                    if id == "a" {
                        panic!("breaker-open provider must not be called");
                    }
                    Ok(id)
                }
            })
            .await
            .unwrap();

        assert_eq!(success.value, "b");
        assert_eq!(success.attempts, 1);
        assert!(success.failed_providers.is_empty());
    }

    #[test]
    fn test_citations_are_a_subset_of_evidence() {
        let input = SynthesisInput {
            query: "how does auth work".to_string(),
            intent: QueryIntent::Explanation,
            matches: vec![
                SemanticMatch {
                    content: "fn login()".to_string(),
                    score: 0.9,
                    source: "src/auth.rs".to_string(),
                    kind: ContentKind::Code,
                    line_range: None,
                    language: Some("rust".to_string()),
                },
                SemanticMatch {
                    content: "# auth docs".to_string(),
                    score: 0.7,
                    source: "docs/auth.md".to_string(),
                    kind: ContentKind::Document,
                    line_range: None,
                    language: None,
                },
            ],
            relationships: vec![],
        };

        let answer = "Authentication lives in src/auth.rs and also src/invented.rs.";
        let citations = SynthesisChain::extract_citations(&input, answer);
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].source, "src/auth.rs");
    }

    #[test]
    fn test_citations_fall_back_to_top_matches() {
        let input = SynthesisInput {
            query: "q".to_string(),
            intent: QueryIntent::Code,
            matches: vec![SemanticMatch {
                content: "x".to_string(),
                score: 0.5,
                source: "src/a.rs".to_string(),
                kind: ContentKind::Code,
                line_range: None,
                language: None,
            }],
            relationships: vec![],
        };
        let citations = SynthesisChain::extract_citations(&input, "No paths mentioned.");
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].source, "src/a.rs");
    }
}
