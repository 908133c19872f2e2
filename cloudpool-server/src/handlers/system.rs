use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::info;

use super::storage_error_response;
use crate::state::AppState;

// ── GET /health ──

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime_secs = state.started_at.elapsed().as_secs();
    if state.streamer.union().is_available().await {
        (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ok", "uptime_secs": uptime_secs })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "degraded", "uptime_secs": uptime_secs })),
        )
    }
}

// ── GET /api/cache/stats ──

pub async fn cache_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.streamer.cache().stats())
}

// ── DELETE /api/cache ──

pub async fn clear_cache(State(state): State<Arc<AppState>>) -> Response {
    match state.streamer.cache().clear() {
        Ok(removed) => {
            info!(removed, "Cache cleared");
            Json(serde_json::json!({ "removed": removed })).into_response()
        }
        Err(e) => storage_error_response(&e),
    }
}

// ── GET /api/backends ──

pub async fn list_backends(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({ "backends": state.streamer.union().backends() }))
}
