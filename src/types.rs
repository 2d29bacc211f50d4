// Validated Types - strongly-typed wrappers that enforce invariants at construction.
// These types cannot be built with invalid data, so downstream code never re-checks.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Maximum accepted query length in bytes. Longer bodies are rejected at the edge.
pub const MAX_QUERY_BYTES: usize = 8192;

/// Inferred intent of a natural-language query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryIntent {
    Code,
    Explanation,
    Both,
    Location,
    Relationship,
    Unknown,
}

impl fmt::Display for QueryIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueryIntent::Code => "code",
            QueryIntent::Explanation => "explanation",
            QueryIntent::Both => "both",
            QueryIntent::Location => "location",
            QueryIntent::Relationship => "relationship",
            QueryIntent::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Terminal status of a query response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Success,
    Partial,
    Unavailable,
}

/// How the caller wants the query handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InteractionMode {
    #[serde(rename = "one-shot")]
    OneShot,
    #[serde(rename = "conversational")]
    Conversational,
}

/// Whether the caller wants raw evidence or a synthesized answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynthesisMode {
    Raw,
    Synthesized,
}

/// Content kind tag on a semantic match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Code,
    Document,
    Comment,
}

/// User feedback rating attached to a prior query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackRating {
    Useful,
    NotUseful,
    Partial,
}

/// Lifecycle phase of a clarification conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationPhase {
    Analyzing,
    Clarifying,
    Executing,
    Completed,
}

/// How ambiguous a query reads before any clarification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AmbiguityLevel {
    Clear,
    Ambiguous,
    RequiresContext,
}

/// A query string that is guaranteed non-empty, trimmed, and within size limits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedQuery {
    inner: String,
}

impl ValidatedQuery {
    /// Create a validated query.
    ///
    /// # Invariants
    /// - Non-empty after trimming
    /// - No null bytes
    /// - At most `MAX_QUERY_BYTES` bytes
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        ensure!(!trimmed.is_empty(), "Query cannot be empty");
        ensure!(!trimmed.contains('\0'), "Query cannot contain null bytes");
        ensure!(
            trimmed.len() <= MAX_QUERY_BYTES,
            "Query exceeds maximum length of {} bytes",
            MAX_QUERY_BYTES
        );
        Ok(Self {
            inner: trimmed.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    pub fn into_inner(self) -> String {
        self.inner
    }
}

impl fmt::Display for ValidatedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// Client-assigned (or server-generated) request identifier. Opaque, non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId {
    inner: String,
}

impl RequestId {
    /// Wrap an externally supplied id after validation.
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        ensure!(!raw.trim().is_empty(), "Request id cannot be empty");
        ensure!(raw.len() <= 128, "Request id exceeds 128 characters");
        Ok(Self { inner: raw })
    }

    /// Generate a fresh server-side id.
    pub fn generate() -> Self {
        Self {
            inner: format!("req_{}", Uuid::new_v4().simple()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// Conversation identifier. Always a version-4 random UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId {
    inner: Uuid,
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationId {
    pub fn new() -> Self {
        Self {
            inner: Uuid::new_v4(),
        }
    }

    /// Parse from string, rejecting nil UUIDs.
    pub fn parse(s: &str) -> Result<Self> {
        let uuid = Uuid::parse_str(s)?;
        ensure!(!uuid.is_nil(), "Conversation id cannot be nil UUID");
        Ok(Self { inner: uuid })
    }

    pub fn as_uuid(&self) -> Uuid {
        self.inner
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// Project scope filter. Non-empty, path-safe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectScope {
    inner: String,
}

impl ProjectScope {
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        ensure!(!trimmed.is_empty(), "Project scope cannot be empty");
        ensure!(
            trimmed
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'/')),
            "Project scope contains unsupported characters"
        );
        Ok(Self {
            inner: trimmed.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for ProjectScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}
