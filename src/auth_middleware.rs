//! Edge middleware: shared API key validation and per-IP rate limiting.
//!
//! The API key comparison is constant-time so response timing reveals nothing
//! about how much of a guessed key matched. Rate limiting is a token bucket
//! per client IP, with separate budgets for query and conversation routes.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::errors::ApiError;

/// Header name for API key
const API_KEY_HEADER: &str = "X-API-Key";

/// Bearer token prefix
const BEARER_PREFIX: &str = "Bearer ";

/// Routes that never require auth or rate limiting.
const PUBLIC_PATHS: &[&str] = &["/", "/health"];

/// Extract API key from request headers.
fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(API_KEY_HEADER) {
        if let Ok(key) = value.to_str() {
            return Some(key.to_string());
        }
    }

    if let Some(value) = headers.get(header::AUTHORIZATION) {
        if let Ok(auth) = value.to_str() {
            if let Some(key) = auth.strip_prefix(BEARER_PREFIX) {
                return Some(key.to_string());
            }
        }
    }

    None
}

/// Extract client IP, preferring the reverse proxy's forwarded header.
fn extract_ip_address(headers: &HeaderMap, remote_addr: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers.get("X-Forwarded-For") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(ip) = value.split(',').next() {
                let trimmed = ip.trim();
                if !trimmed.is_empty() {
                    return trimmed.to_string();
                }
            }
        }
    }

    remote_addr
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Constant-time equality over the full key material.
fn keys_match(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Which rate budget a route draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteClass {
    Query,
    Conversation,
}

fn classify_route(path: &str) -> RouteClass {
    if path.starts_with("/conversation") {
        RouteClass::Conversation
    } else {
        RouteClass::Query
    }
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Shared edge state: the configured key and the per-client buckets.
pub struct EdgeState {
    api_key: Option<String>,
    rate_limit: RateLimitConfig,
    buckets: DashMap<String, TokenBucket>,
    rate_limited_total: AtomicU64,
}

impl EdgeState {
    pub fn new(api_key: Option<String>, rate_limit: RateLimitConfig) -> Arc<Self> {
        Arc::new(Self {
            api_key,
            rate_limit,
            buckets: DashMap::new(),
            rate_limited_total: AtomicU64::new(0),
        })
    }

    pub fn rate_limited_total(&self) -> u64 {
        self.rate_limited_total.load(Ordering::Relaxed)
    }

    /// Take one token from the caller's bucket; Err carries a retry hint.
    fn check_rate(&self, client: &str, class: RouteClass) -> Result<(), u64> {
        let capacity = match class {
            RouteClass::Query => self.rate_limit.query_max,
            RouteClass::Conversation => self.rate_limit.conversation_max,
        } as f64;
        let window_secs = self.rate_limit.window.as_secs_f64();
        if capacity <= 0.0 || window_secs <= 0.0 {
            return Ok(());
        }
        let refill_per_sec = capacity / window_secs;

        let key = format!("{client}:{class:?}");
        let mut bucket = self.buckets.entry(key).or_insert_with(|| TokenBucket {
            tokens: capacity,
            last_refill: Instant::now(),
        });

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_per_sec).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - bucket.tokens;
            let retry_after_ms = ((deficit / refill_per_sec) * 1000.0).ceil() as u64;
            self.rate_limited_total.fetch_add(1, Ordering::Relaxed);
            Err(retry_after_ms.max(1))
        }
    }
}

/// Auth + rate-limit middleware applied to every route.
pub async fn edge_middleware(
    State(edge): State<Arc<EdgeState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let path = request.uri().path().to_string();
    if PUBLIC_PATHS.contains(&path.as_str()) {
        return Ok(next.run(request).await);
    }

    let headers = request.headers();
    let client_ip = extract_ip_address(headers, Some(addr));

    if let Some(expected) = &edge.api_key {
        let provided = extract_api_key(headers).ok_or_else(|| {
            debug!("missing API key for {path}");
            ApiError::MissingApiKey
        })?;
        if !keys_match(&provided, expected) {
            warn!(client = %client_ip, "rejected invalid API key for {path}");
            return Err(ApiError::InvalidApiKey);
        }
    }

    if let Err(retry_after_ms) = edge.check_rate(&client_ip, classify_route(&path)) {
        debug!(client = %client_ip, retry_after_ms, "rate limited");
        return Err(ApiError::RateLimited { retry_after_ms });
    }

    Ok(next.run(request).await)
}
