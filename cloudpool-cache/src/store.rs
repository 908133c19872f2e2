//! Disk-backed object cache bounded by total size and entry age.
//!
//! Cache root layout:
//! `files/{fingerprint}` finished blobs,
//! `temp/{fingerprint}.{uuid}.tmp` in-flight writes (atomic rename into `files/`),
//! `index.json` metadata checkpoint written on graceful shutdown.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use cloudpool_common::{Result, StorageError};

use crate::index;

const FILES_DIR: &str = "files";
const TEMP_DIR: &str = "temp";
const INDEX_FILE: &str = "index.json";
/// Per-key invalidations remembered before they collapse into one
/// cache-wide generation.
const MAX_TRACKED_GENERATIONS: usize = 4096;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub root: PathBuf,
    pub capacity_bytes: u64,
    pub ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Fresh,
    Expired,
}

/// A single cached object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub source_key: String,
    pub local_path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
    pub access_count: u64,
    /// Position in the recency order; larger is more recent.
    #[serde(default)]
    access_seq: u64,
}

impl CacheEntry {
    pub fn state(&self, ttl: Duration, now: DateTime<Utc>) -> EntryState {
        let expired = (now - self.created_at)
            .to_std()
            .map(|age| age > ttl)
            .unwrap_or(false);
        if expired {
            EntryState::Expired
        } else {
            EntryState::Fresh
        }
    }
}

/// A full-object cache hit: an open handle on the blob plus its metadata.
pub struct CacheHit {
    pub file: tokio::fs::File,
    pub entry: CacheEntry,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub current_bytes: u64,
    pub reserved_bytes: u64,
    pub capacity_bytes: u64,
    pub usage_percent: f64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub expirations: u64,
    pub total_accesses: u64,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
    pub ttl_secs: u64,
    pub cache_dir: PathBuf,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// access_seq -> fingerprint, oldest first.
    lru: BTreeMap<u64, String>,
    current_bytes: u64,
    /// Bytes promised to writes that are still copying into temp/.
    reserved_bytes: u64,
    next_seq: u64,
    /// fingerprint -> generation of its last invalidation.
    generations: HashMap<String, u64>,
    /// Generation of the last `clear`; applies to every key.
    generation_floor: u64,
    next_generation: u64,
}

impl CacheState {
    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn insert(&mut self, mut entry: CacheEntry) -> CacheEntry {
        let seq = self.bump_seq();
        entry.access_seq = seq;
        self.lru.insert(seq, entry.fingerprint.clone());
        self.current_bytes += entry.size_bytes;
        self.entries.insert(entry.fingerprint.clone(), entry.clone());
        entry
    }

    /// Drop the metadata for `fingerprint`. The caller unlinks the blob.
    fn remove(&mut self, fingerprint: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(fingerprint)?;
        self.lru.remove(&entry.access_seq);
        self.current_bytes -= entry.size_bytes;
        Some(entry)
    }

    fn touch(&mut self, fingerprint: &str) -> Option<CacheEntry> {
        let seq = self.bump_seq();
        let entry = self.entries.get_mut(fingerprint)?;
        self.lru.remove(&entry.access_seq);
        entry.access_seq = seq;
        entry.last_access_at = Utc::now();
        entry.access_count += 1;
        self.lru.insert(seq, fingerprint.to_string());
        Some(entry.clone())
    }

    fn generation(&self, fingerprint: &str) -> u64 {
        self.generations
            .get(fingerprint)
            .copied()
            .unwrap_or(0)
            .max(self.generation_floor)
    }

    fn invalidate(&mut self, fingerprint: &str) {
        self.next_generation += 1;
        if self.generations.len() >= MAX_TRACKED_GENERATIONS {
            // Collapse into the floor; every in-flight write is discarded.
            self.generations.clear();
            self.generation_floor = self.next_generation;
            return;
        }
        self.generations
            .insert(fingerprint.to_string(), self.next_generation);
    }
}

/// TTL- and size-bounded local store keyed by the fingerprint of the
/// logical object key.
///
/// One lock guards the metadata map and the size counters. Copying bytes
/// into `temp/` happens outside it. The commit rename and unlinks run under
/// it as plain blocking syscalls: both are single metadata operations on
/// the cache's own filesystem, and the rename has to be atomic with the
/// generation check and the map update.
pub struct CacheStore {
    root: PathBuf,
    files_dir: PathBuf,
    temp_dir: PathBuf,
    capacity: u64,
    ttl: Duration,
    state: RwLock<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Stable fingerprint of a logical key; also the blob's file name.
pub fn fingerprint(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

impl CacheStore {
    /// Open or create the cache at `config.root`, recovering whatever a
    /// previous run checkpointed.
    pub fn open(config: CacheConfig) -> Result<Self> {
        let files_dir = config.root.join(FILES_DIR);
        let temp_dir = config.root.join(TEMP_DIR);
        std::fs::create_dir_all(&files_dir)?;
        // Anything left in temp/ belongs to a write that never finished.
        if temp_dir.exists() {
            std::fs::remove_dir_all(&temp_dir)?;
        }
        std::fs::create_dir_all(&temp_dir)?;

        let store = Self {
            root: config.root.clone(),
            files_dir,
            temp_dir,
            capacity: config.capacity_bytes,
            ttl: config.ttl,
            state: RwLock::new(CacheState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        };
        store.recover()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Path a key's blob lives at once materialized.
    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.files_dir.join(fingerprint(key))
    }

    fn read_state(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Rebuild metadata from the checkpoint and drop blobs nobody owns.
    fn recover(&self) -> Result<()> {
        let index_path = self.root.join(INDEX_FILE);
        let mut recovered = match index::load(&index_path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, path = %index_path.display(), "Ignoring unreadable cache index");
                Vec::new()
            }
        };
        recovered.sort_by_key(|e| (e.last_access_at, e.access_seq));

        let now = Utc::now();
        let mut state = self.write_state();
        for mut entry in recovered {
            let path = self.files_dir.join(&entry.fingerprint);
            let on_disk = std::fs::metadata(&path).ok().filter(|m| m.is_file());
            match on_disk {
                Some(meta)
                    if meta.len() == entry.size_bytes
                        && entry.state(self.ttl, now) == EntryState::Fresh =>
                {
                    entry.local_path = path;
                    state.insert(entry);
                }
                _ => {}
            }
        }

        for dirent in walkdir::WalkDir::new(&self.files_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let name = dirent.file_name().to_string_lossy();
            if !state.entries.contains_key(name.as_ref()) {
                debug!(file = %dirent.path().display(), "Removing orphan cache blob");
                unlink(dirent.path());
            }
        }

        if state.current_bytes > self.capacity {
            let required = state.current_bytes - self.capacity;
            self.evict_locked(&mut state, required, None);
        }

        info!(
            entries = state.entries.len(),
            bytes = state.current_bytes,
            capacity = self.capacity,
            "Cache opened"
        );
        Ok(())
    }

    /// Look up a key. A miss never reaches out to any backend.
    pub async fn get(&self, key: &str) -> Result<Option<CacheHit>> {
        let fp = fingerprint(key);
        let entry = {
            let mut state = self.write_state();
            let now = Utc::now();
            match state.entries.get(&fp) {
                None => None,
                Some(entry) if entry.state(self.ttl, now) == EntryState::Expired => {
                    if let Some(expired) = state.remove(&fp) {
                        unlink(&expired.local_path);
                        self.expirations.fetch_add(1, Ordering::Relaxed);
                        debug!(key, "Cache entry expired on lookup");
                    }
                    None
                }
                Some(_) => state.touch(&fp),
            }
        };

        let Some(entry) = entry else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        match tokio::fs::File::open(&entry.local_path).await {
            Ok(file) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(CacheHit { file, entry }))
            }
            // Evicted between the metadata check and the open, or the blob
            // was removed behind our back.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let mut state = self.write_state();
                if state.entries.get(&fp).map(|e| e.access_seq) == Some(entry.access_seq) {
                    warn!(key, path = %entry.local_path.display(), "Cached blob vanished");
                    state.remove(&fp);
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Materialize `size` bytes from `reader` under `key`.
    ///
    /// Space is reserved (evicting LRU entries if needed) before any byte is
    /// copied. The entry becomes visible only after the temp file has been
    /// fsynced and renamed into `files/`; any earlier failure leaves nothing
    /// behind.
    pub async fn put<R>(&self, key: &str, reader: R, size: u64) -> Result<CacheEntry>
    where
        R: AsyncRead + Unpin + Send,
    {
        let entry = self.commit(key, reader, size, None).await?;
        entry.ok_or(StorageError::Cancelled)
    }

    /// Invalidation generation of `key`, to be handed to
    /// [`put_if_generation`](Self::put_if_generation).
    pub fn generation(&self, key: &str) -> u64 {
        self.read_state().generation(&fingerprint(key))
    }

    /// Like [`put`](Self::put), but the write is discarded (`Ok(None)`) if
    /// `key` was deleted or the cache cleared after `generation` was read.
    /// Populating from a backend read that may since have gone stale uses
    /// this.
    pub async fn put_if_generation<R>(
        &self,
        key: &str,
        reader: R,
        size: u64,
        generation: u64,
    ) -> Result<Option<CacheEntry>>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.commit(key, reader, size, Some(generation)).await
    }

    async fn commit<R>(
        &self,
        key: &str,
        reader: R,
        size: u64,
        generation: Option<u64>,
    ) -> Result<Option<CacheEntry>>
    where
        R: AsyncRead + Unpin + Send,
    {
        let fp = fingerprint(key);
        let mut reservation = self.reserve(&fp, size)?;

        let mut staged = StagedFile::new(
            self.temp_dir
                .join(format!("{}.{}.tmp", fp, uuid::Uuid::new_v4())),
        );
        write_exact(staged.path(), reader, size).await?;

        let dest = self.files_dir.join(&fp);
        let now = Utc::now();
        let entry = {
            let mut state = self.write_state();
            if let Some(expected) = generation {
                let current = state.generation(&fp);
                if current != expected {
                    drop(state);
                    debug!(key, expected, current, "Key invalidated during cache write, discarding");
                    return Ok(None);
                }
            }
            std::fs::rename(staged.path(), &dest)?;
            staged.persisted();

            if let Some(previous) = state.remove(&fp) {
                debug!(key, previous_size = previous.size_bytes, "Cache entry superseded");
            }
            state.reserved_bytes -= size;
            reservation.disarm();
            state.insert(CacheEntry {
                fingerprint: fp,
                source_key: key.to_string(),
                local_path: dest,
                size_bytes: size,
                created_at: now,
                last_access_at: now,
                access_count: 0,
                access_seq: 0,
            })
        };

        info!(key, size, "Cached object");
        Ok(Some(entry))
    }

    /// Make room for `size` more bytes and hold it for an in-flight write.
    /// An existing entry for `fp` is replaced at commit, so its bytes count
    /// as already available and it is never evicted to make room.
    fn reserve(&self, fp: &str, size: u64) -> Result<Reservation<'_>> {
        let mut state = self.write_state();
        let replaced = state.entries.get(fp).map_or(0, |e| e.size_bytes);
        let needed = (state.current_bytes + state.reserved_bytes + size).saturating_sub(replaced);
        if needed > self.capacity {
            let required = needed - self.capacity;
            let evictable = state.current_bytes - replaced;
            if evictable < required {
                return Err(StorageError::CacheExhausted {
                    required,
                    evictable,
                });
            }
            self.evict_locked(&mut state, required, Some(fp));
        }
        state.reserved_bytes += size;
        Ok(Reservation {
            state: &self.state,
            bytes: size,
            armed: true,
        })
    }

    /// Remove least-recently-used entries, other than `keep`, until
    /// `required` bytes are freed or nothing is left. Returns the bytes freed.
    fn evict_locked(&self, state: &mut CacheState, required: u64, keep: Option<&str>) -> u64 {
        let mut victims = Vec::new();
        let mut planned = 0u64;
        for fp in state.lru.values() {
            if planned >= required {
                break;
            }
            if keep == Some(fp.as_str()) {
                continue;
            }
            if let Some(entry) = state.entries.get(fp) {
                planned += entry.size_bytes;
                victims.push(fp.clone());
            }
        }

        let mut freed = 0u64;
        for fp in victims {
            if let Some(entry) = state.remove(&fp) {
                unlink(&entry.local_path);
                freed += entry.size_bytes;
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(
                    key = %entry.source_key,
                    size = entry.size_bytes,
                    last_access = %entry.last_access_at,
                    "Evicted cache entry"
                );
            }
        }
        if freed > 0 {
            info!(freed, required, "Cache eviction completed");
        }
        freed
    }

    /// Remove a key's entry and blob. Returns whether anything was cached.
    ///
    /// Also invalidates the key, so a write of its previous content that is
    /// still in flight will not commit.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let fp = fingerprint(key);
        let mut state = self.write_state();
        state.invalidate(&fp);
        let Some(entry) = state.remove(&fp) else {
            return Ok(false);
        };
        match std::fs::remove_file(&entry.local_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(key, "Cache entry removed");
        Ok(true)
    }

    /// Drop every entry. Returns how many were removed.
    pub fn clear(&self) -> Result<usize> {
        let mut state = self.write_state();
        let count = state.entries.len();
        for entry in state.entries.values() {
            unlink(&entry.local_path);
        }
        state.entries.clear();
        state.lru.clear();
        state.current_bytes = 0;
        state.next_generation += 1;
        state.generation_floor = state.next_generation;
        state.generations.clear();
        info!(removed = count, "Cache cleared");
        Ok(count)
    }

    /// One bounded pass over all entries removing those older than the TTL,
    /// however recently they were read.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut state = self.write_state();
        let expired: Vec<String> = state
            .entries
            .values()
            .filter(|e| e.state(self.ttl, now) == EntryState::Expired)
            .map(|e| e.fingerprint.clone())
            .collect();
        for fp in &expired {
            if let Some(entry) = state.remove(fp) {
                unlink(&entry.local_path);
                debug!(key = %entry.source_key, "Removed expired cache entry");
            }
        }
        self.expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.read_state();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            entries: state.entries.len(),
            current_bytes: state.current_bytes,
            reserved_bytes: state.reserved_bytes,
            capacity_bytes: self.capacity,
            usage_percent: if self.capacity == 0 {
                0.0
            } else {
                state.current_bytes as f64 / self.capacity as f64 * 100.0
            },
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            total_accesses: state.entries.values().map(|e| e.access_count).sum(),
            oldest_entry: state.entries.values().map(|e| e.created_at).min(),
            newest_entry: state.entries.values().map(|e| e.created_at).max(),
            ttl_secs: self.ttl.as_secs(),
            cache_dir: self.root.clone(),
        }
    }

    /// Entries ordered least- to most-recently used.
    pub fn list_lru(&self) -> Vec<CacheEntry> {
        let state = self.read_state();
        state
            .lru
            .values()
            .filter_map(|fp| state.entries.get(fp).cloned())
            .collect()
    }

    /// Persist the metadata index so the next `open` can reuse the blobs.
    pub fn checkpoint(&self) -> Result<()> {
        let entries: Vec<CacheEntry> = self.read_state().entries.values().cloned().collect();
        index::save(&self.root.join(INDEX_FILE), &entries)?;
        info!(entries = entries.len(), "Cache index checkpointed");
        Ok(())
    }
}

/// Releases reserved bytes if the write never commits.
struct Reservation<'a> {
    state: &'a RwLock<CacheState>,
    bytes: u64,
    armed: bool,
}

impl Reservation<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state.reserved_bytes -= self.bytes;
        }
    }
}

/// Temp file that is removed on drop unless it was renamed into place.
struct StagedFile {
    path: PathBuf,
    persisted: bool,
}

impl StagedFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            persisted: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn persisted(&mut self) {
        self.persisted = true;
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.persisted {
            unlink(&self.path);
        }
    }
}

/// Copy exactly `size` bytes into a new file at `path` and fsync it.
async fn write_exact<R>(path: &Path, reader: R, size: u64) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    let mut file = tokio::fs::File::create(path).await?;
    // One extra byte lets an oversized source be told apart from an exact one.
    let mut limited = reader.take(size + 1);
    let written = tokio::io::copy(&mut limited, &mut file)
        .await
        .map_err(|e| match e.kind() {
            io::ErrorKind::ConnectionAborted => StorageError::Cancelled,
            _ => StorageError::Io(e),
        })?;
    if written != size {
        return Err(StorageError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected {} bytes, source produced {}", size, written),
        )));
    }
    file.sync_all().await?;
    Ok(())
}

fn unlink(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove cache file");
        }
    }
}
