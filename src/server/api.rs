//! HTTP API over the cache.
//!
//! - GET|PUT|DELETE /v1/cache/{key}
//! - GET /v1/cache/{key}/exists
//! - POST /v1/cache/warmup
//! - POST /v1/cache/clear
//! - GET /v1/cache/stats, GET /v1/cache/stats/stream
//! - GET /v1/cache/patterns
//! - GET /metrics
//! - GET /health

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::patterns::Pattern;
use crate::cache::store::{AnalyticsReport, CacheError, SetOptions, SharedCache};
use crate::server::metrics::CacheMetrics;
use crate::server::streaming::analytics_to_sse_stream;

/// Application state shared across handlers.
pub struct AppState {
    pub cache: SharedCache,
    pub metrics: CacheMetrics,
    pub start_time: Instant,
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/v1/cache/{key}",
            get(get_item).put(put_item).delete(delete_item),
        )
        .route("/v1/cache/{key}/exists", get(item_exists))
        .route("/v1/cache/warmup", post(warm_up))
        .route("/v1/cache/clear", post(clear))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/v1/cache/stats/stream", get(stats_stream))
        .route("/v1/cache/patterns", get(list_patterns))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ContextQuery {
    pub context: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ItemResponse {
    pub key: String,
    pub value: Value,
}

/// Body of `PUT /v1/cache/{key}`.
#[derive(Debug, Deserialize)]
pub struct PutRequest {
    pub value: Value,
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    #[serde(default)]
    pub priority: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub dependency_chain: Vec<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub pinned: bool,
}

impl PutRequest {
    pub fn into_parts(self) -> (Value, SetOptions) {
        let options = SetOptions {
            ttl: self.ttl_ms.map(Duration::from_millis),
            priority: self.priority,
            tags: self.tags,
            dependency_chain: self.dependency_chain,
            context: self.context,
            pinned: self.pinned,
        };
        (self.value, options)
    }
}

#[derive(Debug, Serialize)]
pub struct ExistsResponse {
    pub key: String,
    pub exists: bool,
}

#[derive(Debug, Deserialize)]
pub struct WarmupRequest {
    pub keys: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct WarmupResponse {
    pub requested: usize,
    pub loaded: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub items: usize,
    pub bytes_in_use: usize,
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn get_item(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(query): Query<ContextQuery>,
) -> Result<Json<ItemResponse>, StatusCode> {
    match state.cache.get(&key, query.context.as_deref()) {
        Some(value) => Ok(Json(ItemResponse { key, value })),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn put_item(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(req): Json<PutRequest>,
) -> impl IntoResponse {
    let request_id = Uuid::new_v4().to_string();
    let (value, options) = req.into_parts();

    match state.cache.set(&key, &value, options) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            let status = match &err {
                CacheError::Rejected { .. } | CacheError::CapacityExceeded { .. } => {
                    warn!(request_id, key, error = %err, "Set rejected");
                    StatusCode::INSUFFICIENT_STORAGE
                }
                CacheError::Serialization(_) => {
                    warn!(request_id, key, error = %err, "Set failed");
                    StatusCode::BAD_REQUEST
                }
                CacheError::Compression(_) => {
                    error!(request_id, key, error = %err, "Set failed");
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            (
                status,
                Json(ErrorResponse {
                    error: err.to_string(),
                }),
            )
                .into_response()
        }
    }
}

async fn delete_item(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> StatusCode {
    if state.cache.delete(&key) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn item_exists(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Json<ExistsResponse> {
    let exists = state.cache.has(&key);
    Json(ExistsResponse { key, exists })
}

async fn warm_up(
    State(state): State<Arc<AppState>>,
    Json(req): Json<WarmupRequest>,
) -> Json<WarmupResponse> {
    let request_id = Uuid::new_v4().to_string();
    info!(request_id, keys = req.keys.len(), "Warm-up request");

    let loaded = state.cache.warm_up(&req.keys).await;
    Json(WarmupResponse {
        requested: req.keys.len(),
        loaded,
    })
}

async fn clear(State(state): State<Arc<AppState>>) -> StatusCode {
    state.cache.clear();
    StatusCode::NO_CONTENT
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<AnalyticsReport> {
    Json(state.cache.get_analytics())
}

async fn stats_stream(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stream = analytics_to_sse_stream(state.cache.subscribe_analytics());
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn list_patterns(State(state): State<Arc<AppState>>) -> Json<Vec<Pattern>> {
    Json(state.cache.get_patterns())
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, StatusCode> {
    state.metrics.update(&state.cache.get_analytics());
    match state.metrics.render() {
        Ok(body) => Ok((
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )),
        Err(err) => {
            error!(error = %err, "Metrics encoding failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        items: state.cache.size(),
        bytes_in_use: state.cache.bytes_in_use(),
    })
}
