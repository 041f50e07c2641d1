//! HTTP boundary for the UI.
//!
//! A thin axum adapter over the engine's three end-user operations plus
//! health and stats. Handlers run the blocking pipeline on the blocking
//! pool; request aborts propagate as cancellation into in-flight searches.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::ai::{CancelToken, SearchAnswer, SearchQueryPlan};
use crate::engine::{Engine, EngineStats, HealthCheck};
use crate::error::{MnemoraError, Result};
use crate::search::SearchFilters;
use crate::store::ScreenshotEvidence;
use crate::types::{ContextNode, NodeId};

/// Search request body.
#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    /// Free-text query.
    pub query: String,
    /// Optional filters.
    #[serde(default)]
    pub filters: Option<SearchFilters>,
}

/// Evidence request body.
#[derive(Debug, Deserialize)]
pub struct EvidenceRequest {
    /// Nodes whose backing screenshots are wanted.
    pub node_ids: Vec<NodeId>,
}

/// Wire form of a context node.
#[derive(Debug, Serialize)]
pub struct NodeDto {
    /// Node row id.
    pub id: NodeId,
    /// Node kind label.
    pub kind: &'static str,
    /// Owning thread, when assigned.
    pub thread_id: Option<String>,
    /// Title.
    pub title: String,
    /// Summary.
    pub summary: String,
    /// Canonical app context.
    pub app_context: String,
    /// Keywords.
    pub keywords: Vec<String>,
    /// Entity names.
    pub entities: Vec<String>,
    /// Importance with issue promotion applied.
    pub importance: u8,
    /// Model confidence.
    pub confidence: u8,
    /// Event time, epoch ms.
    pub event_time: i64,
    /// Event time rendered as RFC3339 UTC.
    pub event_time_rfc3339: String,
    /// Backing screenshot.
    pub screenshot_id: i64,
}

impl From<ContextNode> for NodeDto {
    fn from(node: ContextNode) -> Self {
        Self {
            id: node.id,
            kind: node.kind.as_str(),
            thread_id: node.thread_id.clone(),
            title: node.title.clone(),
            summary: node.summary.clone(),
            app_context: node.app_context.clone(),
            keywords: node.keywords.clone(),
            entities: node.entities.iter().map(|e| e.name.clone()).collect(),
            importance: node.effective_importance(),
            confidence: node.confidence,
            event_time: node.event_time,
            event_time_rfc3339: rfc3339(node.event_time),
            screenshot_id: node.screenshot_id,
        }
    }
}

fn rfc3339(epoch_ms: i64) -> String {
    time::OffsetDateTime::from_unix_timestamp_nanos(i128::from(epoch_ms) * 1_000_000)
        .ok()
        .and_then(|dt| dt.format(&time::format_description::well_known::Rfc3339).ok())
        .unwrap_or_default()
}

/// Wire form of a search result.
#[derive(Debug, Serialize)]
pub struct SearchResponse {
    /// Non-event nodes, ranked.
    pub nodes: Vec<NodeDto>,
    /// Event nodes, ranked.
    pub related_events: Vec<NodeDto>,
    /// Evidence, newest first.
    pub evidence: Vec<ScreenshotEvidence>,
    /// Planner output, when planning ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_plan: Option<QueryPlanDto>,
    /// Synthesized answer, when synthesis ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<SearchAnswer>,
}

/// Wire form of the query plan.
#[derive(Debug, Serialize)]
pub struct QueryPlanDto {
    /// Text the semantic leg embedded.
    pub embedding_text: String,
    /// Planner confidence.
    pub confidence: f64,
}

impl From<SearchQueryPlan> for QueryPlanDto {
    fn from(plan: SearchQueryPlan) -> Self {
        Self {
            embedding_text: plan.embedding_text,
            confidence: plan.confidence,
        }
    }
}

struct RpcError(MnemoraError);

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let (status, tag) = match &self.0 {
            MnemoraError::Cancelled => (StatusCode::REQUEST_TIMEOUT, "CANCELLED"),
            MnemoraError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            MnemoraError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "INVALID_ARGUMENT"),
            MnemoraError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        };
        let body = Json(serde_json::json!({
            "error": tag,
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

impl From<MnemoraError> for RpcError {
    fn from(err: MnemoraError) -> Self {
        Self(err)
    }
}

/// Builds the API router.
pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/api/search", post(search_handler))
        .route("/api/threads/:thread_id", get(thread_handler))
        .route("/api/evidence", post(evidence_handler))
        .route("/api/health", get(health_handler))
        .route("/api/stats", get(stats_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(engine)
}

/// Serves the API until the process is interrupted.
pub async fn serve(engine: Arc<Engine>, addr: SocketAddr) -> Result<()> {
    let app = router(engine);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "rpc.listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn search_handler(
    State(engine): State<Arc<Engine>>,
    Json(request): Json<SearchRequest>,
) -> std::result::Result<Json<SearchResponse>, RpcError> {
    let cancel = CancelToken::new();
    let abort_guard = cancel.clone();
    let result = tokio::task::spawn_blocking(move || {
        engine.search_with_cancel(&request.query, request.filters, cancel)
    })
    .await
    .map_err(|_| {
        abort_guard.cancel();
        MnemoraError::Cancelled
    })??;

    Ok(Json(SearchResponse {
        nodes: result.nodes.into_iter().map(NodeDto::from).collect(),
        related_events: result
            .related_events
            .into_iter()
            .map(NodeDto::from)
            .collect(),
        evidence: result.evidence,
        query_plan: result.query_plan.map(QueryPlanDto::from),
        answer: result.answer,
    }))
}

async fn thread_handler(
    State(engine): State<Arc<Engine>>,
    Path(thread_id): Path<String>,
) -> std::result::Result<Json<Vec<NodeDto>>, RpcError> {
    let nodes = tokio::task::spawn_blocking(move || engine.get_thread(&thread_id))
        .await
        .map_err(|_| MnemoraError::Cancelled)??;
    Ok(Json(nodes.into_iter().map(NodeDto::from).collect()))
}

async fn evidence_handler(
    State(engine): State<Arc<Engine>>,
    Json(request): Json<EvidenceRequest>,
) -> std::result::Result<Json<Vec<ScreenshotEvidence>>, RpcError> {
    let evidence = tokio::task::spawn_blocking(move || engine.get_evidence(&request.node_ids))
        .await
        .map_err(|_| MnemoraError::Cancelled)??;
    Ok(Json(evidence))
}

async fn health_handler(State(engine): State<Arc<Engine>>) -> Json<HealthCheck> {
    Json(engine.health())
}

async fn stats_handler(
    State(engine): State<Arc<Engine>>,
) -> std::result::Result<Json<EngineStats>, RpcError> {
    let stats = tokio::task::spawn_blocking(move || engine.stats())
        .await
        .map_err(|_| MnemoraError::Cancelled)??;
    Ok(Json(stats))
}
