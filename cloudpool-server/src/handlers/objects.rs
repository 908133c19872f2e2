use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::TryStreamExt;
use serde::Deserialize;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::warn;

use cloudpool_common::ByteRange;

use super::{error_json, storage_error_response};
use crate::state::AppState;

/// Request header naming the caller for quota accounting.
pub const IDENTITY_HEADER: &str = "x-cloudpool-identity";
/// Response header reporting whether the body came from the cache.
pub const CACHE_STATUS_HEADER: &str = "x-cache";

const ANONYMOUS: &str = "anonymous";

// ── GET /api/objects/{*key} ──

pub async fn get_object(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Response {
    // An unparseable Range header is ignored and the full object is sent.
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(ByteRange::parse);

    match range {
        Some(range) => match state.streamer.get_byte_range(&key, range).await {
            Ok(stream) => Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, stream.content_type)
                .header(header::CONTENT_LENGTH, stream.range.len())
                .header(header::CONTENT_RANGE, stream.range.content_range())
                .header(header::ACCEPT_RANGES, "bytes")
                .header(CACHE_STATUS_HEADER, stream.cache_status.as_str())
                .body(Body::from_stream(ReaderStream::new(stream.reader)))
                .unwrap_or_else(|e| build_failed(&e)),
            Err(e) => storage_error_response(&e),
        },
        None => match state.streamer.get(&key).await {
            Ok(stream) => Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, stream.content_type)
                .header(header::CONTENT_LENGTH, stream.size)
                .header(header::ACCEPT_RANGES, "bytes")
                .header(CACHE_STATUS_HEADER, stream.cache_status.as_str())
                .body(Body::from_stream(ReaderStream::new(stream.reader)))
                .unwrap_or_else(|e| build_failed(&e)),
            Err(e) => storage_error_response(&e),
        },
    }
}

fn build_failed(e: &axum::http::Error) -> Response {
    warn!(error = %e, "Failed to build response");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(error_json("internal", "failed to build response")),
    )
        .into_response()
}

// ── PUT /api/objects/{*key} ──

pub async fn put_object(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let Some(size) = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    else {
        return (
            StatusCode::LENGTH_REQUIRED,
            Json(error_json("length_required", "Content-Length is required")),
        )
            .into_response();
    };
    let identity = headers
        .get(IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS);

    let stream = body
        .into_data_stream()
        .map_err(|e| io::Error::new(io::ErrorKind::ConnectionAborted, e));
    let reader = StreamReader::new(stream);

    match state.streamer.put(identity, &key, Box::new(reader), size).await {
        Ok(desc) => (StatusCode::CREATED, Json(desc)).into_response(),
        Err(e) => storage_error_response(&e),
    }
}

// ── DELETE /api/objects/{*key} ──

pub async fn delete_object(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Response {
    let identity = headers
        .get(IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS);

    match state.streamer.delete(identity, &key).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => storage_error_response(&e),
    }
}

// ── GET /api/objects?prefix= ──

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub prefix: String,
}

pub async fn list_objects(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    match state.streamer.list_prefix(&query.prefix).await {
        Ok(objects) => Json(serde_json::json!({ "objects": objects })).into_response(),
        Err(e) => storage_error_response(&e),
    }
}
