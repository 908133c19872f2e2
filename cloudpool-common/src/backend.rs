use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::error::{Result, StorageError};

/// A sequential, non-seekable byte stream produced by a backend read.
///
/// Dropping the reader releases whatever produced it; for subprocess
/// adapters that means the process is killed and reaped.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// Typed result of a list or stat call. Adapters decode their raw
/// responses into this once; nothing above the adapter sees the raw form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    /// Logical path inside the union namespace (no leading slash).
    pub path: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    /// Name of the backend that answered for this object.
    pub backend: String,
}

/// Trait implemented by every remote storage location.
///
/// Each adapter handles raw I/O for one configured remote. Selection,
/// failover and listing merge live in the union coordinator; the adapter
/// only moves bytes and reports typed metadata.
#[async_trait::async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Configured name of this backend, unique within a union.
    fn name(&self) -> &str;

    /// Store `reader` at `path`. `size` is advisory; adapters that need it
    /// up front may reject `None`.
    async fn upload(
        &self,
        path: &str,
        reader: ObjectReader,
        size: Option<u64>,
    ) -> Result<ObjectDescriptor>;

    /// Open a stream of the object's bytes from the beginning.
    async fn download(&self, path: &str) -> Result<ObjectReader>;

    /// List all objects under `prefix`, recursively.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectDescriptor>>;

    async fn delete(&self, path: &str) -> Result<()>;

    async fn stat(&self, path: &str) -> Result<ObjectDescriptor>;

    /// Public link to the object, where the remote supports one.
    async fn signed_url(&self, _path: &str, _expires: Duration) -> Result<String> {
        Err(StorageError::Unsupported("signed urls"))
    }

    /// Cheap reachability check. Callers bound it with their own timeout.
    async fn is_available(&self) -> bool;
}

/// Normalize a logical object key: strip leading slashes and reject keys
/// that are empty or try to climb out of the namespace.
pub fn normalize_key(key: &str) -> Result<String> {
    let trimmed = key.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    if trimmed
        .split('/')
        .any(|segment| segment == ".." || segment == "." || segment.is_empty())
    {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Normalize a listing prefix. Unlike keys, an empty prefix is valid and
/// means the whole namespace.
pub fn normalize_prefix(prefix: &str) -> Result<String> {
    let trimmed = prefix.trim_start_matches('/');
    if trimmed.split('/').any(|segment| segment == "..") {
        return Err(StorageError::InvalidKey(prefix.to_string()));
    }
    Ok(trimmed.to_string())
}
