pub mod objects;
pub mod system;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{error, warn};

use cloudpool_common::StorageError;

fn error_json(code: &str, message: &str) -> serde_json::Value {
    serde_json::json!({ "error": { "code": code, "message": message } })
}

/// Map a storage failure onto the HTTP status and JSON error body.
pub(crate) fn storage_error_response(err: &StorageError) -> Response {
    let (status, code) = match err {
        StorageError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        StorageError::RangeNotSatisfiable { .. } => {
            (StatusCode::RANGE_NOT_SATISFIABLE, "range_not_satisfiable")
        }
        StorageError::BackendUnavailable(_) | StorageError::NoBackendAvailable => {
            (StatusCode::SERVICE_UNAVAILABLE, "backend_unavailable")
        }
        StorageError::Timeout { .. } => (StatusCode::SERVICE_UNAVAILABLE, "timeout"),
        StorageError::CacheExhausted { .. } => (StatusCode::INSUFFICIENT_STORAGE, "cache_exhausted"),
        StorageError::QuotaExceeded { .. } => (StatusCode::FORBIDDEN, "quota_exceeded"),
        StorageError::InvalidKey(_) => (StatusCode::BAD_REQUEST, "invalid_key"),
        StorageError::Backend { .. } => (StatusCode::BAD_GATEWAY, "backend_error"),
        StorageError::Unsupported(_) => (StatusCode::NOT_IMPLEMENTED, "unsupported"),
        StorageError::Cancelled => (StatusCode::INTERNAL_SERVER_ERROR, "cancelled"),
        StorageError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "io_error"),
    };

    if status.is_server_error() {
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err, "Request failed");
        } else {
            warn!(error = %err, "Request failed");
        }
    }

    let mut response = (status, Json(error_json(code, &err.to_string()))).into_response();
    if let StorageError::RangeNotSatisfiable { size, .. } = err {
        if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", size)) {
            response.headers_mut().insert(header::CONTENT_RANGE, value);
        }
    }
    response
}
