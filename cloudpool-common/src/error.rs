use std::time::Duration;

/// Failure taxonomy shared by the cache, the backends and the union.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    /// Every configured backend failed or timed out for this request.
    #[error("no backend could serve the request: {0}")]
    BackendUnavailable(String),
    #[error("no backend is available to accept writes")]
    NoBackendAvailable,
    #[error("cache exhausted: {required} bytes required, {evictable} bytes evictable")]
    CacheExhausted { required: u64, evictable: u64 },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request cancelled")]
    Cancelled,
    /// The remote utility exited non-zero without delivering data.
    #[error("backend {backend} failed: {message}")]
    Backend { backend: String, message: String },
    #[error("backend {backend} timed out after {timeout:?}")]
    Timeout { backend: String, timeout: Duration },
    #[error("range starting at {start} not satisfiable for object of {size} bytes")]
    RangeNotSatisfiable { start: u64, size: u64 },
    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),
    #[error("quota exceeded for {identity}: {size} bytes requested")]
    QuotaExceeded { identity: String, size: u64 },
    #[error("invalid object key: {0}")]
    InvalidKey(String),
}

impl StorageError {
    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        StorageError::Backend {
            backend: backend.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    /// Errors that say something about the backend's health rather than
    /// about the object being asked for.
    pub fn is_backend_fault(&self) -> bool {
        matches!(
            self,
            StorageError::Backend { .. } | StorageError::Timeout { .. } | StorageError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
