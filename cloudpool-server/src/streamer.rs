//! Request-facing read/write orchestration.
//!
//! Full-object reads are served from the cache when possible; a miss streams
//! from the union and copies into the cache in the background. Range reads
//! always go to a backend and use skip-and-copy, since backend streams can
//! only start at byte zero.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use cloudpool_backends::UnionCoordinator;
use cloudpool_cache::CacheStore;
use cloudpool_common::backend::{normalize_key, normalize_prefix};
use cloudpool_common::{ByteRange, ObjectDescriptor, ObjectReader, RangeRequest, Result, StorageError};

use crate::quota::QuotaHook;
use crate::tee::tee;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }
}

/// A full object ready to be streamed to a client.
pub struct ObjectStream {
    pub reader: ObjectReader,
    pub size: u64,
    pub content_type: String,
    pub cache_status: CacheStatus,
}

/// One byte range of an object. `range.len()` is the content length.
pub struct RangeStream {
    pub reader: ObjectReader,
    pub range: RangeRequest,
    pub content_type: String,
    pub cache_status: CacheStatus,
}

/// MIME type from the key's extension.
pub fn content_type(key: &str) -> String {
    mime_guess::from_path(key)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

pub struct RangeStreamer {
    union: Arc<UnionCoordinator>,
    cache: Arc<CacheStore>,
    quota: Arc<dyn QuotaHook>,
}

impl RangeStreamer {
    pub fn new(
        union: Arc<UnionCoordinator>,
        cache: Arc<CacheStore>,
        quota: Arc<dyn QuotaHook>,
    ) -> Self {
        Self {
            union,
            cache,
            quota,
        }
    }

    pub fn union(&self) -> &UnionCoordinator {
        &self.union
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Stream a whole object, from the cache if it is there.
    pub async fn get(&self, key: &str) -> Result<ObjectStream> {
        let key = normalize_key(key)?;
        let content_type = content_type(&key);

        match self.cache.get(&key).await {
            Ok(Some(hit)) => {
                debug!(key = %key, size = hit.entry.size_bytes, "Cache hit");
                return Ok(ObjectStream {
                    reader: Box::new(hit.file),
                    size: hit.entry.size_bytes,
                    content_type,
                    cache_status: CacheStatus::Hit,
                });
            }
            Ok(None) => debug!(key = %key, "Cache miss"),
            Err(e) => warn!(key = %key, error = %e, "Cache lookup failed, treating as miss"),
        }

        // Read before touching the backend: a write or delete landing while
        // this copy is in flight makes the cache discard it.
        let generation = self.cache.generation(&key);
        let desc = self.union.stat(&key).await?;
        let reader = self.union.download(&key, None).await?;
        let reader = self.populate_cache(&key, reader, desc.size, generation);
        Ok(ObjectStream {
            reader,
            size: desc.size,
            content_type,
            cache_status: CacheStatus::Miss,
        })
    }

    /// Stream bytes `start..=end` of an object. `end` defaults to the last
    /// byte and is clamped to it.
    pub async fn get_range(&self, key: &str, start: u64, end: Option<u64>) -> Result<RangeStream> {
        self.get_byte_range(key, ByteRange::From { start, end }).await
    }

    /// Like [`get_range`](Self::get_range) for any parsed `Range` form,
    /// including suffix ranges.
    pub async fn get_byte_range(&self, key: &str, range: ByteRange) -> Result<RangeStream> {
        let key = normalize_key(key)?;
        let desc = self.union.stat(&key).await?;
        let range = range.resolve(desc.size)?;

        debug!(key = %key, start = range.start, end = range.end, size = desc.size, "Serving range");
        let reader = self.union.download(&key, Some(range)).await?;
        Ok(RangeStream {
            reader,
            range,
            content_type: content_type(&key),
            cache_status: CacheStatus::Miss,
        })
    }

    /// Store an object on one backend after the quota check.
    pub async fn put(
        &self,
        identity: &str,
        key: &str,
        reader: ObjectReader,
        size: u64,
    ) -> Result<ObjectDescriptor> {
        let key = normalize_key(key)?;
        if !self.quota.has_quota(identity, size).await {
            return Err(StorageError::QuotaExceeded {
                identity: identity.to_string(),
                size,
            });
        }

        let desc = self.union.upload(&key, reader, Some(size)).await?;
        self.quota.charge(identity, desc.size).await;
        self.invalidate(&key);
        info!(key = %key, backend = %desc.backend, size = desc.size, identity, "Object stored");
        Ok(desc)
    }

    pub async fn delete(&self, identity: &str, key: &str) -> Result<()> {
        let key = normalize_key(key)?;
        // Size is only needed to credit the quota; a failed stat does not
        // stop the delete.
        let size = self.union.stat(&key).await.ok().map(|d| d.size);

        self.union.delete(&key).await?;
        self.invalidate(&key);
        if let Some(size) = size {
            self.quota.credit(identity, size).await;
        }
        Ok(())
    }

    pub async fn list_prefix(&self, prefix: &str) -> Result<Vec<ObjectDescriptor>> {
        let prefix = normalize_prefix(prefix)?;
        self.union.list(&prefix).await
    }

    fn invalidate(&self, key: &str) {
        match self.cache.delete(key) {
            Ok(true) => debug!(key, "Dropped stale cache entry"),
            Ok(false) => {}
            Err(e) => warn!(key, error = %e, "Failed to drop stale cache entry"),
        }
    }

    /// Copy a full-object stream into the cache while the client reads it.
    fn populate_cache(
        &self,
        key: &str,
        reader: ObjectReader,
        size: u64,
        generation: u64,
    ) -> ObjectReader {
        if size > self.cache.capacity() {
            debug!(key, size, "Object larger than cache, not caching");
            return reader;
        }

        let (client, cache_side) = tee(reader, size);
        let cache = Arc::clone(&self.cache);
        let key = key.to_string();
        tokio::spawn(async move {
            match cache.put_if_generation(&key, cache_side, size, generation).await {
                Ok(Some(entry)) => debug!(key = %key, size = entry.size_bytes, "Cached after miss"),
                Ok(None) => debug!(key = %key, "Object changed while caching, copy discarded"),
                Err(StorageError::Cancelled) => {
                    debug!(key = %key, "Cache population abandoned with the client stream")
                }
                Err(e) => warn!(key = %key, error = %e, "Background cache population failed"),
            }
        });
        Box::new(client)
    }
}
