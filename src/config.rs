// Gateway configuration. Everything is loaded from the environment; secrets
// never leave this module except inside redacting config types.
//
// Provider chains are composed from numbered env groups:
//   EMBEDDING_1_TYPE, EMBEDDING_1_URL, EMBEDDING_1_MODEL, EMBEDDING_1_API_KEY,
//   EMBEDDING_1_TIMEOUT_MS, EMBEDDING_2_TYPE, ... and likewise SYNTHESIS_n_*.
// Numbering stops at the first missing _TYPE.

use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::providers::{ProviderConfig, ProviderKind};

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_KV_PORT: u16 = 6379;
const DEFAULT_RATE_WINDOW_MS: u64 = 60_000;
const DEFAULT_QUERY_RATE_MAX: u32 = 100;
const DEFAULT_EMBEDDING_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SYNTHESIS_TIMEOUT: Duration = Duration::from_secs(90);

/// Vector backend connection parameters.
#[derive(Debug, Clone)]
pub struct VectorConfig {
    pub url: String,
    pub collection: String,
    pub api_key: Option<String>,
}

/// Graph backend connection parameters.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
}

/// Persistent KV connection parameters.
#[derive(Debug, Clone)]
pub struct KvConfig {
    pub host: String,
    pub port: u16,
}

/// Edge rate limiting parameters.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub query_max: u32,
    pub conversation_max: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(DEFAULT_RATE_WINDOW_MS),
            query_max: DEFAULT_QUERY_RATE_MAX,
            conversation_max: DEFAULT_QUERY_RATE_MAX / 2,
        }
    }
}

/// Full gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub production: bool,
    pub vector: VectorConfig,
    pub graph: GraphConfig,
    pub kv: KvConfig,
    pub embedding_providers: Vec<ProviderConfig>,
    pub synthesis_providers: Vec<ProviderConfig>,
    pub embedding_dimensions: usize,
    pub rate_limit: RateLimitConfig,
    pub confidence_config_path: Option<PathBuf>,
}

fn parse_kind(raw: &str) -> Result<ProviderKind> {
    match raw {
        "openai-compatible" | "openai" => Ok(ProviderKind::OpenaiCompatible),
        "anthropic-compatible" | "anthropic" => Ok(ProviderKind::AnthropicCompatible),
        "local" | "ollama" => Ok(ProviderKind::Local),
        other => Err(anyhow!("unknown provider type '{other}'")),
    }
}

fn parse_headers(raw: &str) -> HashMap<String, String> {
    // "Name: value; Other: value" pairs.
    raw.split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once(':')?;
            let name = name.trim();
            let value = value.trim();
            (!name.is_empty() && !value.is_empty())
                .then(|| (name.to_string(), value.to_string()))
        })
        .collect()
}

impl GatewayConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup, so tests can inject environments.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let production = matches!(
            lookup("NODE_ENV").or_else(|| lookup("GATEWAY_ENV")).as_deref(),
            Some("production")
        );

        let api_key = lookup("API_KEY").filter(|k| !k.is_empty());
        if production && api_key.is_none() {
            bail!("API_KEY is required when NODE_ENV=production");
        }

        let vector = VectorConfig {
            url: lookup("VECTOR_URL").context("VECTOR_URL is required")?,
            collection: lookup("VECTOR_COLLECTION").context("VECTOR_COLLECTION is required")?,
            api_key: lookup("VECTOR_API_KEY").filter(|k| !k.is_empty()),
        };

        let graph = GraphConfig {
            uri: lookup("GRAPH_URI").context("GRAPH_URI is required")?,
            user: lookup("GRAPH_USER").context("GRAPH_USER is required")?,
            password: lookup("GRAPH_PASSWORD").context("GRAPH_PASSWORD is required")?,
        };

        let kv = KvConfig {
            host: lookup("KV_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: match lookup("KV_PORT") {
                Some(raw) => raw.parse().context("KV_PORT is not a valid port")?,
                None => DEFAULT_KV_PORT,
            },
        };

        let embedding_dimensions: usize = lookup("EMBEDDING_DIMENSIONS")
            .context("EMBEDDING_DIMENSIONS is required")?
            .parse()
            .context("EMBEDDING_DIMENSIONS is not a number")?;
        if embedding_dimensions == 0 {
            bail!("EMBEDDING_DIMENSIONS must be positive");
        }

        let embedding_providers = read_chain(
            &lookup,
            "EMBEDDING",
            DEFAULT_EMBEDDING_TIMEOUT,
            Some(embedding_dimensions),
        )?;
        if embedding_providers.is_empty() {
            bail!("at least one EMBEDDING_n_* provider is required");
        }
        let synthesis_providers =
            read_chain(&lookup, "SYNTHESIS", DEFAULT_SYNTHESIS_TIMEOUT, None)?;

        // Declared provider dimensions must agree with the vector backend's
        // expected dimension; this is a configuration error, not a runtime
        // degradation, so the process refuses to start.
        for provider in &embedding_providers {
            if let Some(dims) = provider.dimensions {
                if dims != embedding_dimensions {
                    bail!(
                        "embedding provider '{}' declares {} dimensions but EMBEDDING_DIMENSIONS={}",
                        provider.id,
                        dims,
                        embedding_dimensions
                    );
                }
            }
        }

        let rate_limit = RateLimitConfig {
            window: match lookup("RATE_LIMIT_WINDOW_MS") {
                Some(raw) => Duration::from_millis(
                    raw.parse().context("RATE_LIMIT_WINDOW_MS is not a number")?,
                ),
                None => Duration::from_millis(DEFAULT_RATE_WINDOW_MS),
            },
            query_max: match lookup("RATE_LIMIT_MAX_REQUESTS") {
                Some(raw) => raw
                    .parse()
                    .context("RATE_LIMIT_MAX_REQUESTS is not a number")?,
                None => DEFAULT_QUERY_RATE_MAX,
            },
            conversation_max: match lookup("RATE_LIMIT_MAX_CONVERSATIONS") {
                Some(raw) => raw
                    .parse()
                    .context("RATE_LIMIT_MAX_CONVERSATIONS is not a number")?,
                None => DEFAULT_QUERY_RATE_MAX / 2,
            },
        };

        Ok(Self {
            host: lookup("GATEWAY_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: match lookup("GATEWAY_PORT").or_else(|| lookup("PORT")) {
                Some(raw) => raw.parse().context("GATEWAY_PORT is not a valid port")?,
                None => DEFAULT_PORT,
            },
            api_key,
            production,
            vector,
            graph,
            kv,
            embedding_providers,
            synthesis_providers,
            embedding_dimensions,
            rate_limit,
            confidence_config_path: lookup("CONFIDENCE_CONFIG_PATH").map(PathBuf::from),
        })
    }
}

fn read_chain(
    lookup: &impl Fn(&str) -> Option<String>,
    prefix: &str,
    default_timeout: Duration,
    default_dimensions: Option<usize>,
) -> Result<Vec<ProviderConfig>> {
    let mut providers = Vec::new();
    for index in 1.. {
        let Some(kind_raw) = lookup(&format!("{prefix}_{index}_TYPE")) else {
            break;
        };
        let kind = parse_kind(&kind_raw)
            .with_context(|| format!("{prefix}_{index}_TYPE is invalid"))?;
        let base_url = lookup(&format!("{prefix}_{index}_URL"))
            .with_context(|| format!("{prefix}_{index}_URL is required"))?;
        let model = lookup(&format!("{prefix}_{index}_MODEL"))
            .with_context(|| format!("{prefix}_{index}_MODEL is required"))?;
        let api_key = lookup(&format!("{prefix}_{index}_API_KEY")).filter(|k| !k.is_empty());
        if api_key.is_none() && kind != ProviderKind::Local {
            // Remote providers normally need credentials; a deliberate
            // keyless deployment can set the variable to "none".
            tracing::debug!("{prefix}_{index} has no API key configured");
        }
        let timeout = match lookup(&format!("{prefix}_{index}_TIMEOUT_MS")) {
            Some(raw) => Duration::from_millis(
                raw.parse()
                    .with_context(|| format!("{prefix}_{index}_TIMEOUT_MS is not a number"))?,
            ),
            None => default_timeout,
        };
        let extra_headers = lookup(&format!("{prefix}_{index}_HEADERS"))
            .map(|raw| parse_headers(&raw))
            .unwrap_or_default();
        let dimensions = match lookup(&format!("{prefix}_{index}_DIMENSIONS")) {
            Some(raw) => Some(
                raw.parse()
                    .with_context(|| format!("{prefix}_{index}_DIMENSIONS is not a number"))?,
            ),
            None => default_dimensions,
        };

        let id = format!("{}-{}", prefix.to_lowercase(), index);
        providers.push(ProviderConfig {
            id,
            name: format!("{model} @ {base_url}"),
            kind,
            base_url,
            model,
            api_key: api_key.filter(|k| k != "none"),
            timeout,
            extra_headers,
            dimensions,
        });
    }
    Ok(providers)
}
