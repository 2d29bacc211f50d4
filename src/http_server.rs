// HTTP edge for the gateway. Routes requests, enforces auth and rate limits,
// validates bodies, and maps query status onto HTTP codes
// (success 200, partial 207, unavailable 503).

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    auth_middleware::{edge_middleware, EdgeState},
    config::GatewayConfig,
    confidence::ConfidenceMeter,
    contracts::SemanticSearcher,
    conversation::{analyze_ambiguity, ContinueOutcome, ConversationController},
    errors::ApiError,
    graph_adapter::Neo4jAdapter,
    health_monitor::{HealthMonitor, OverallStatus, ProbeOutcome, ServiceSpec, ServiceStatus},
    http_types::{
        ContinueRequestBody, FeedbackRequestBody, GatewayReply, ProjectsResponse, QueryRequestBody,
        QueueStatsResponse,
    },
    orchestrator::{OrchestratorConfig, OrchestratorRequest, QueryOrchestrator},
    providers::{EmbeddingChain, ProviderHealth, SynthesisChain},
    query_metrics::MetricsRecorder,
    state_store::{FallbackStore, StateStore},
    types::{
        ConversationId, InteractionMode, ProjectScope, QueryStatus, RequestId, SynthesisMode,
        ValidatedQuery,
    },
    vector_adapter::QdrantAdapter,
};

/// Front door over the orchestrator and the conversation controller. The
/// ambiguity check decides which one a query reaches.
pub struct Gateway {
    orchestrator: Arc<QueryOrchestrator>,
    controller: Arc<ConversationController>,
}

impl Gateway {
    pub fn new(
        orchestrator: Arc<QueryOrchestrator>,
        controller: Arc<ConversationController>,
    ) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            controller,
        })
    }

    pub fn orchestrator(&self) -> &Arc<QueryOrchestrator> {
        &self.orchestrator
    }

    pub fn controller(&self) -> &Arc<ConversationController> {
        &self.controller
    }

    /// Handle a query body from either query route. `force_conversational`
    /// is set for POST /conversation.
    pub async fn handle_query(
        &self,
        body: QueryRequestBody,
        force_conversational: bool,
    ) -> Result<GatewayReply, ApiError> {
        let query = ValidatedQuery::new(body.query.clone())
            .map_err(|e| ApiError::bad_request("query", e.to_string()))?;
        let request_id = match &body.request_id {
            Some(raw) => RequestId::new(raw.clone())
                .map_err(|e| ApiError::bad_request("requestId", e.to_string()))?,
            None => RequestId::generate(),
        };
        let project = body
            .project
            .as_deref()
            .map(ProjectScope::new)
            .transpose()
            .map_err(|e| ApiError::bad_request("project", e.to_string()))?;
        let synthesis_mode = body.synthesis_mode.unwrap_or(SynthesisMode::Synthesized);

        let assessment = analyze_ambiguity(query.as_str());
        let conversational = force_conversational
            || match body.mode {
                Some(InteractionMode::OneShot) => false,
                Some(InteractionMode::Conversational) => true,
                // Auto-detect: ambiguous queries become conversations.
                None => assessment.needs_clarification(),
            };

        if conversational && assessment.needs_clarification() {
            let response = self
                .controller
                .start(&query, project, synthesis_mode)
                .await
                .map_err(ApiError::Internal)?;
            return Ok(GatewayReply::Clarify(response));
        }

        let response = self
            .orchestrator
            .execute(OrchestratorRequest {
                request_id,
                query,
                project,
                context: body.context,
                synthesis_mode,
            })
            .await;
        Ok(GatewayReply::Answered(Box::new(response)))
    }
}

/// Shared application state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub edge: Arc<EdgeState>,
    pub monitor: Arc<HealthMonitor>,
    pub metrics: Arc<MetricsRecorder>,
    pub vector: Arc<dyn SemanticSearcher>,
    pub store: Arc<FallbackStore>,
    pub provider_health: Arc<dyn Fn() -> Vec<ProviderHealth> + Send + Sync>,
}

fn status_code_for(status: QueryStatus) -> StatusCode {
    match status {
        QueryStatus::Success => StatusCode::OK,
        QueryStatus::Partial => StatusCode::MULTI_STATUS,
        QueryStatus::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn reply_response(reply: GatewayReply) -> Response {
    match reply {
        GatewayReply::Clarify(conversation) => (StatusCode::OK, Json(conversation)).into_response(),
        GatewayReply::Answered(response) => {
            (status_code_for(response.status), Json(*response)).into_response()
        }
    }
}

fn body_or_400<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    match payload {
        Ok(Json(body)) => Ok(body),
        Err(rejection) => Err(ApiError::bad_request("body", rejection.body_text())),
    }
}

async fn root_handler() -> impl IntoResponse {
    Json(json!({
        "service": "quarry",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let snapshot = state.monitor.snapshot();
    let code = match snapshot.status {
        OverallStatus::Healthy => StatusCode::OK,
        OverallStatus::Degraded => StatusCode::MULTI_STATUS,
        OverallStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(snapshot)).into_response()
}

async fn query_handler(
    State(state): State<AppState>,
    payload: Result<Json<QueryRequestBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let body = body_or_400(payload)?;
    let reply = state.gateway.handle_query(body, false).await?;
    Ok(reply_response(reply))
}

async fn conversation_start_handler(
    State(state): State<AppState>,
    payload: Result<Json<QueryRequestBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let body = body_or_400(payload)?;
    let reply = state.gateway.handle_query(body, true).await?;
    Ok(reply_response(reply))
}

async fn conversation_continue_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ContinueRequestBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let id = ConversationId::parse(&id)
        .map_err(|e| ApiError::bad_request("conversationId", e.to_string()))?;
    let body = body_or_400(payload)?;

    let outcome = state
        .gateway
        .controller()
        .continue_conversation(&id, &body.answers)
        .await
        .map_err(ApiError::Internal)?;

    Ok(match outcome {
        ContinueOutcome::Clarify(conversation) => {
            (StatusCode::OK, Json(conversation)).into_response()
        }
        ContinueOutcome::Final(response) => {
            (status_code_for(response.status), Json(*response)).into_response()
        }
    })
}

async fn conversation_abort_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = ConversationId::parse(&id)
        .map_err(|e| ApiError::bad_request("conversationId", e.to_string()))?;
    state
        .gateway
        .controller()
        .abort(&id)
        .await
        .map_err(ApiError::Internal)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn feedback_handler(
    State(state): State<AppState>,
    payload: Result<Json<FeedbackRequestBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let body = body_or_400(payload)?;
    let request_id = RequestId::new(body.request_id)
        .map_err(|e| ApiError::bad_request("requestId", e.to_string()))?;

    let recorded = state
        .metrics
        .attach_feedback(&request_id, body.feedback, body.comment)
        .await
        .map_err(ApiError::Internal)?;

    Ok(if recorded {
        (StatusCode::OK, Json(json!({ "recorded": true }))).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({
                "recorded": false,
                "message": "request id is unknown or its metric has expired",
            })),
        )
            .into_response()
    })
}

async fn projects_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
    match state.vector.list_projects().await {
        Ok(projects) => Ok(Json(ProjectsResponse { projects }).into_response()),
        Err(e) => {
            tracing::warn!("project listing failed: {e:#}");
            Ok((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "error": "projects_unavailable",
                    "message": "The vector backend is not reachable",
                })),
            )
                .into_response())
        }
    }
}

async fn queue_stats_handler(State(state): State<AppState>) -> Json<QueueStatsResponse> {
    let gateway = &state.gateway;
    Json(QueueStatsResponse {
        queries_total: gateway.orchestrator().queries_total(),
        conversations_started: gateway.controller().started_count(),
        conversations_active: gateway.controller().active_count().await as u64,
        rate_limited_total: state.edge.rate_limited_total(),
        synthesis_fallbacks_total: gateway.orchestrator().synthesis_fallbacks_total(),
        store_mode: state.store.mode().to_string(),
        providers: (state.provider_health)(),
    })
}

/// Build the router with all middleware layers applied.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/query", post(query_handler))
        .route("/conversation", post(conversation_start_handler))
        .route("/conversation/:id/continue", post(conversation_continue_handler))
        .route("/conversation/:id", delete(conversation_abort_handler))
        .route("/feedback", post(feedback_handler))
        .route("/projects", get(projects_handler))
        .route("/queue/stats", get(queue_stats_handler))
        .layer(middleware::from_fn_with_state(
            state.edge.clone(),
            edge_middleware,
        ))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Wire every subsystem from config and serve until ctrl-c.
pub async fn start_server(config: GatewayConfig) -> Result<()> {
    let store = FallbackStore::connect(&config.kv.host, config.kv.port).await;

    let embedding_chain = Arc::new(EmbeddingChain::new(
        config.embedding_providers.clone(),
        config.embedding_dimensions,
    )?);
    let synthesis_chain = if config.synthesis_providers.is_empty() {
        None
    } else {
        Some(Arc::new(SynthesisChain::new(
            config.synthesis_providers.clone(),
        )?))
    };

    let vector: Arc<QdrantAdapter> = Arc::new(QdrantAdapter::new(
        &config.vector.url,
        &config.vector.collection,
        config.vector.api_key.clone(),
    )?);
    let graph = Arc::new(
        Neo4jAdapter::connect(&config.graph.uri, &config.graph.user, &config.graph.password)
            .await?,
    );

    let confidence = Arc::new(match &config.confidence_config_path {
        Some(path) => ConfidenceMeter::load(path)?,
        None => ConfidenceMeter::with_defaults(),
    });
    let metrics = Arc::new(MetricsRecorder::new(
        Arc::clone(&store) as Arc<dyn StateStore>
    ));

    let orchestrator = Arc::new(QueryOrchestrator::new(
        embedding_chain.clone(),
        vector.clone(),
        graph.clone(),
        synthesis_chain
            .clone()
            .map(|chain| chain as Arc<dyn crate::contracts::AnswerSynthesizer>),
        confidence,
        Arc::clone(&metrics),
        OrchestratorConfig::default(),
    ));
    let controller = Arc::new(ConversationController::new(
        Arc::clone(&store) as Arc<dyn StateStore>,
        Arc::clone(&orchestrator),
    ));
    let gateway = Gateway::new(orchestrator, controller);

    let monitor = build_monitor(&store, vector.clone(), graph.clone());
    monitor.start();

    let embedding_for_stats = embedding_chain.clone();
    let synthesis_for_stats = synthesis_chain.clone();
    let provider_health: Arc<dyn Fn() -> Vec<ProviderHealth> + Send + Sync> =
        Arc::new(move || {
            let mut health = embedding_for_stats.health();
            if let Some(chain) = &synthesis_for_stats {
                health.extend(chain.health());
            }
            health
        });

    let state = AppState {
        gateway,
        edge: EdgeState::new(config.api_key.clone(), config.rate_limit.clone()),
        monitor: Arc::clone(&monitor),
        metrics,
        vector,
        store: Arc::clone(&store),
        provider_health,
    };

    let app = create_router(state);
    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?;

    info!("Quarry gateway listening on {}:{}", config.host, config.port);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await?;

    // Drain: stop probes, then flush the KV client.
    monitor.stop();
    store.close().await?;
    info!("Quarry gateway stopped");
    Ok(())
}

fn build_monitor(
    store: &Arc<FallbackStore>,
    vector: Arc<QdrantAdapter>,
    graph: Arc<Neo4jAdapter>,
) -> Arc<HealthMonitor> {
    use crate::contracts::StructuralSearcher;

    let vector_probe = ServiceSpec::custom("vector", {
        let vector = Arc::clone(&vector);
        Arc::new(move || {
            let vector = Arc::clone(&vector);
            Box::pin(async move {
                Ok(ProbeOutcome {
                    status: if SemanticSearcher::probe(vector.as_ref()).await {
                        ServiceStatus::Healthy
                    } else {
                        ServiceStatus::Unhealthy
                    },
                    detail: None,
                })
            })
        })
    });

    let graph_probe = ServiceSpec::custom("graph", {
        let graph = Arc::clone(&graph);
        Arc::new(move || {
            let graph = Arc::clone(&graph);
            Box::pin(async move {
                Ok(ProbeOutcome {
                    status: if StructuralSearcher::probe(graph.as_ref()).await {
                        ServiceStatus::Healthy
                    } else {
                        ServiceStatus::Unhealthy
                    },
                    detail: None,
                })
            })
        })
    });

    let kv_probe = ServiceSpec::custom("kv", {
        let store = Arc::clone(store);
        Arc::new(move || {
            let store = Arc::clone(&store);
            Box::pin(async move {
                let status = match store.exists("monitoring:ping").await {
                    Ok(_) if store.mode() == "redis" => ServiceStatus::Healthy,
                    Ok(_) => ServiceStatus::Degraded,
                    Err(_) => ServiceStatus::Unhealthy,
                };
                Ok(ProbeOutcome {
                    status,
                    detail: (status == ServiceStatus::Degraded)
                        .then(|| "running on in-process fallback store".to_string()),
                })
            })
        })
    });

    HealthMonitor::with_options(
        vec![vector_probe, graph_probe, kv_probe],
        crate::health_monitor::PROBE_INTERVAL,
        Some(Arc::clone(store) as Arc<dyn StateStore>),
        None,
        None,
    )
}
