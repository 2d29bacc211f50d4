// HTTP edge behavior: auth, rate limiting, body validation, and status-code
// mapping, exercised through the real router with stub backends.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{header, Request, StatusCode};
use pretty_assertions::assert_eq;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use quarry::auth_middleware::EdgeState;
use quarry::confidence::ConfidenceMeter;
use quarry::config::RateLimitConfig;
use quarry::contracts::{
    EmbeddingGenerator, EmbeddingOutcome, SemanticSearcher, SemanticSearchSpec, StructuralSearcher,
};
use quarry::conversation::ConversationController;
use quarry::health_monitor::HealthMonitor;
use quarry::http_types::{SemanticMatch, StructuralRelationship};
use quarry::orchestrator::{OrchestratorConfig, QueryOrchestrator};
use quarry::query_metrics::MetricsRecorder;
use quarry::state_store::{FallbackStore, StateStore};
use quarry::types::{ContentKind, ProjectScope, QueryIntent};
use quarry::{create_router, AppState, Gateway};

struct StubEmbedding;

#[async_trait]
impl EmbeddingGenerator for StubEmbedding {
    async fn embed(&self, _text: &str) -> Result<EmbeddingOutcome> {
        Ok(EmbeddingOutcome {
            vector: vec![0.2; 8],
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

struct StubVector {
    available: bool,
}

#[async_trait]
impl SemanticSearcher for StubVector {
    async fn search(
        &self,
        _embedding: &[f32],
        _spec: &SemanticSearchSpec,
    ) -> Result<Vec<SemanticMatch>> {
        if !self.available {
            return Err(anyhow!("connection refused"));
        }
        Ok(vec![SemanticMatch {
            content: "class AuthService {}".to_string(),
            score: 0.9,
            source: "src/AuthService.ts".to_string(),
            kind: ContentKind::Code,
            line_range: None,
            language: Some("typescript".to_string()),
        }])
    }

    async fn probe(&self) -> bool {
        self.available
    }

    async fn list_projects(&self) -> Result<Vec<String>> {
        if !self.available {
            return Err(anyhow!("connection refused"));
        }
        Ok(vec!["kb".to_string(), "docs".to_string()])
    }
}

struct StubGraph {
    available: bool,
}

#[async_trait]
impl StructuralSearcher for StubGraph {
    async fn search(
        &self,
        _query: &str,
        _intent: QueryIntent,
        _project: Option<&ProjectScope>,
    ) -> Result<Vec<StructuralRelationship>> {
        if !self.available {
            return Err(anyhow!("connection refused"));
        }
        Ok(vec![])
    }

    async fn probe(&self) -> bool {
        self.available
    }
}

fn app(api_key: Option<&str>, query_max: u32, backends_up: bool) -> axum::Router {
    let store = FallbackStore::in_memory();
    let metrics = Arc::new(MetricsRecorder::new(
        Arc::clone(&store) as Arc<dyn StateStore>
    ));
    let vector = Arc::new(StubVector {
        available: backends_up,
    });
    let orchestrator = Arc::new(QueryOrchestrator::new(
        Arc::new(StubEmbedding),
        vector.clone(),
        Arc::new(StubGraph {
            available: backends_up,
        }),
        None,
        Arc::new(ConfidenceMeter::with_defaults()),
        Arc::clone(&metrics),
        OrchestratorConfig::default(),
    ));
    let controller = Arc::new(ConversationController::new(
        Arc::clone(&store) as Arc<dyn StateStore>,
        Arc::clone(&orchestrator),
    ));

    let state = AppState {
        gateway: Gateway::new(orchestrator, controller),
        edge: EdgeState::new(
            api_key.map(String::from),
            RateLimitConfig {
                window: Duration::from_secs(60),
                query_max,
                conversation_max: query_max,
            },
        ),
        monitor: HealthMonitor::new(vec![]),
        metrics,
        vector,
        store,
        provider_health: Arc::new(|| Vec::new()),
    };
    create_router(state)
}

fn request(method: &str, path: &str, api_key: Option<&str>, body: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(key) = api_key {
        builder = builder.header("X-API-Key", key);
    }
    let body = match body {
        Some(json) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let mut request = builder.body(body).unwrap();
    let addr: SocketAddr = "127.0.0.1:54321".parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

const QUERY_BODY: &str = r#"{"query":"Show me the AuthService class","synthesisMode":"raw"}"#;

#[tokio::test]
async fn test_query_without_key_is_401() {
    let app = app(Some("secret"), 100, true);
    let response = app
        .oneshot(request("POST", "/query", None, Some(QUERY_BODY)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_query_with_wrong_key_is_403() {
    let app = app(Some("secret"), 100, true);
    let response = app
        .oneshot(request("POST", "/query", Some("guess"), Some(QUERY_BODY)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_query_with_key_succeeds() {
    let app = app(Some("secret"), 100, true);
    let response = app
        .oneshot(request("POST", "/query", Some("secret"), Some(QUERY_BODY)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "success");
    assert_eq!(json["intent"], "code");
    assert_eq!(json["meta"]["qdrantQueried"], true);
    assert_eq!(json["meta"]["neo4jQueried"], true);
}

#[tokio::test]
async fn test_health_and_root_are_public() {
    let app = app(Some("secret"), 100, true);
    let response = app
        .clone()
        .oneshot(request("GET", "/health", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(request("GET", "/", None, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_rate_limit_returns_429_with_retry_hint() {
    let app = app(None, 2, true);
    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(request("POST", "/query", None, Some(QUERY_BODY)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .oneshot(request("POST", "/query", None, Some(QUERY_BODY)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key(header::RETRY_AFTER));
    let json = body_json(response).await;
    assert!(json["retryAfterMs"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn test_malformed_body_is_400_and_never_reaches_backends() {
    let app = app(None, 100, true);
    let response = app
        .clone()
        .oneshot(request("POST", "/query", None, Some(r#"{"q":"oops"}"#)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(request("POST", "/query", None, Some(r#"{"query":"   "}"#)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"], "bad_request");
}

#[tokio::test]
async fn test_partial_maps_to_207() {
    // Vector up, graph down.
    let store = FallbackStore::in_memory();
    let metrics = Arc::new(MetricsRecorder::new(
        Arc::clone(&store) as Arc<dyn StateStore>
    ));
    let vector = Arc::new(StubVector { available: true });
    let orchestrator = Arc::new(QueryOrchestrator::new(
        Arc::new(StubEmbedding),
        vector.clone(),
        Arc::new(StubGraph { available: false }),
        None,
        Arc::new(ConfidenceMeter::with_defaults()),
        Arc::clone(&metrics),
        OrchestratorConfig::default(),
    ));
    let controller = Arc::new(ConversationController::new(
        Arc::clone(&store) as Arc<dyn StateStore>,
        Arc::clone(&orchestrator),
    ));
    let app = create_router(AppState {
        gateway: Gateway::new(orchestrator, controller),
        edge: EdgeState::new(None, RateLimitConfig::default()),
        monitor: HealthMonitor::new(vec![]),
        metrics,
        vector,
        store,
        provider_health: Arc::new(|| Vec::new()),
    });

    let response = app
        .oneshot(request("POST", "/query", None, Some(QUERY_BODY)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::MULTI_STATUS);
    let json = body_json(response).await;
    assert_eq!(json["status"], "partial");
    assert!(json["warnings"].as_array().unwrap().len() >= 1);
}

#[tokio::test]
async fn test_unavailable_maps_to_503() {
    let app = app(None, 100, false);
    let response = app
        .oneshot(request("POST", "/query", None, Some(QUERY_BODY)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = body_json(response).await;
    assert_eq!(json["status"], "unavailable");
    assert_eq!(
        json["fallbackMessage"],
        "SYSTEM IS UNAVAILABLE, USE WEB & CODEBASE RESEARCH"
    );
}

#[tokio::test]
async fn test_conversation_roundtrip_over_http() {
    let app = app(None, 100, true);

    let response = app
        .clone()
        .oneshot(request(
            "POST",
            "/conversation",
            None,
            Some(r#"{"query":"How does it work?"}"#),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["phase"], "analyzing");
    assert_eq!(json["round"], 1);
    assert_eq!(json["maxRounds"], 3);
    let id = json["conversationId"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(request(
            "POST",
            &format!("/conversation/{id}/continue"),
            None,
            Some(r#"{"answers":{"aspect":"Code implementation","scope":"Entire system"}}"#),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["round"], 2);

    let response = app
        .oneshot(request(
            "DELETE",
            &format!("/conversation/{id}"),
            None,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_feedback_for_unknown_request_is_404() {
    let app = app(None, 100, true);
    let response = app
        .oneshot(request(
            "POST",
            "/feedback",
            None,
            Some(r#"{"requestId":"nope","feedback":"useful"}"#),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_feedback_roundtrip() {
    let app = app(None, 100, true);

    let response = app
        .clone()
        .oneshot(request(
            "POST",
            "/query",
            None,
            Some(r#"{"query":"Show me the AuthService class","requestId":"req-fb-1","synthesisMode":"raw"}"#),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Metric emission is fire-and-forget; give the spawned task a beat.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let response = app
        .oneshot(request(
            "POST",
            "/feedback",
            None,
            Some(r#"{"requestId":"req-fb-1","feedback":"useful","comment":"good"}"#),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["recorded"], true);
}

#[tokio::test]
async fn test_projects_endpoint() {
    let app = app(None, 100, true);
    let response = app
        .oneshot(request("GET", "/projects", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["projects"], serde_json::json!(["kb", "docs"]));
}

#[tokio::test]
async fn test_queue_stats_endpoint() {
    let app = app(None, 100, true);

    let response = app
        .clone()
        .oneshot(request("POST", "/query", None, Some(QUERY_BODY)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(request("GET", "/queue/stats", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["queriesTotal"], 1);
    assert_eq!(json["storeMode"], "memory");
}
