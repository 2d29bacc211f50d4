// Qdrant vector-store adapter. Talks plain REST via reqwest and normalizes
// the two historical indexer payload schemas into one internal shape before
// anything leaves this module.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use crate::contracts::{SemanticSearcher, SemanticSearchSpec};
use crate::http_types::{LineRange, SemanticMatch};
use crate::types::ContentKind;

/// Default deadline for substantive search calls.
pub const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Short deadline for availability probes.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Payload written by the current indexer.
#[derive(Debug, Deserialize)]
struct CurrentPayload {
    content: String,
    file_path: String,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    start_line: Option<u32>,
    #[serde(default)]
    end_line: Option<u32>,
}

/// Payload written by the legacy chunking indexer.
#[derive(Debug, Deserialize)]
struct LegacyPayload {
    text: String,
    path: String,
    #[serde(default)]
    chunk_type: Option<String>,
    #[serde(default)]
    metadata: Option<LegacyMetadata>,
}

#[derive(Debug, Deserialize)]
struct LegacyMetadata {
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    lines: Option<[u32; 2]>,
}

/// The two payload schemas that coexist in production collections.
/// Disambiguation is by field presence: the current schema carries
/// `content`/`file_path`, the legacy one `text`/`path`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IndexedPayload {
    Current(CurrentPayload),
    Legacy(LegacyPayload),
}

fn parse_kind(raw: Option<&str>) -> ContentKind {
    match raw {
        Some("document") | Some("doc") | Some("markdown") => ContentKind::Document,
        Some("comment") => ContentKind::Comment,
        _ => ContentKind::Code,
    }
}

impl IndexedPayload {
    fn into_match(self, score: f32) -> SemanticMatch {
        match self {
            IndexedPayload::Current(p) => SemanticMatch {
                content: p.content,
                score,
                source: p.file_path,
                kind: parse_kind(p.kind.as_deref()),
                line_range: match (p.start_line, p.end_line) {
                    (Some(start), Some(end)) => Some(LineRange { start, end }),
                    _ => None,
                },
                language: p.language,
            },
            IndexedPayload::Legacy(p) => {
                let metadata = p.metadata.unwrap_or(LegacyMetadata {
                    language: None,
                    lines: None,
                });
                SemanticMatch {
                    content: p.text,
                    score,
                    source: p.path,
                    kind: parse_kind(p.chunk_type.as_deref()),
                    line_range: metadata.lines.map(|[start, end]| LineRange { start, end }),
                    language: metadata.language,
                }
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    vector: &'a [f32],
    limit: usize,
    with_payload: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    score_threshold: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    result: Vec<ScoredPoint>,
}

#[derive(Debug, Deserialize)]
struct ScoredPoint {
    score: f32,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct CollectionsResponse {
    result: CollectionsResult,
}

#[derive(Debug, Deserialize)]
struct CollectionsResult {
    collections: Vec<CollectionDescriptor>,
}

#[derive(Debug, Deserialize)]
struct CollectionDescriptor {
    name: String,
}

/// REST client for one Qdrant collection.
pub struct QdrantAdapter {
    client: reqwest::Client,
    base_url: String,
    collection: String,
    api_key: Option<String>,
}

impl QdrantAdapter {
    pub fn new(base_url: &str, collection: &str, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(SEARCH_TIMEOUT)
            .build()
            .context("failed to build Qdrant HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            collection: collection.to_string(),
            api_key,
        })
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }
}

#[async_trait]
impl SemanticSearcher for QdrantAdapter {
    async fn search(
        &self,
        embedding: &[f32],
        spec: &SemanticSearchSpec,
    ) -> Result<Vec<SemanticMatch>> {
        let url = format!(
            "{}/collections/{}/points/search",
            self.base_url, self.collection
        );

        let filter = spec.project.as_ref().map(|project| {
            json!({
                "must": [{ "key": "project", "match": { "value": project.as_str() } }]
            })
        });

        let request = SearchRequest {
            vector: embedding,
            limit: spec.limit,
            with_payload: true,
            score_threshold: (spec.min_score > 0.0).then_some(spec.min_score),
            filter,
        };

        let response = self
            .request(self.client.post(&url))
            .json(&request)
            .send()
            .await
            .context("vector search request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(anyhow!("vector backend returned HTTP {status}"));
        }

        let body: SearchResponse = response
            .json()
            .await
            .context("vector search response was not valid JSON")?;

        let mut matches = Vec::with_capacity(body.result.len());
        for point in body.result {
            let Some(payload) = point.payload else {
                continue;
            };
            match serde_json::from_value::<IndexedPayload>(payload) {
                Ok(parsed) => matches.push(parsed.into_match(point.score.clamp(0.0, 1.0))),
                Err(e) => {
                    // An unrecognized payload means a third schema appeared;
                    // skip the point rather than fail the whole search.
                    warn!("skipping point with unrecognized payload: {e}");
                }
            }
        }

        debug!(
            collection = %self.collection,
            matches = matches.len(),
            "vector search completed"
        );
        Ok(matches)
    }

    async fn probe(&self) -> bool {
        let url = format!("{}/collections/{}", self.base_url, self.collection);
        let result = tokio::time::timeout(
            PROBE_TIMEOUT,
            self.request(self.client.get(&url)).send(),
        )
        .await;
        matches!(result, Ok(Ok(response)) if response.status().is_success())
    }

    async fn list_projects(&self) -> Result<Vec<String>> {
        let url = format!("{}/collections", self.base_url);
        let response = self
            .request(self.client.get(&url))
            .send()
            .await
            .context("collections request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(anyhow!("vector backend returned HTTP {status}"));
        }

        let body: CollectionsResponse = response.json().await?;
        let mut names: Vec<String> = body
            .result
            .collections
            .into_iter()
            .map(|c| c.name)
            .collect();
        names.sort();
        Ok(names)
    }
}
