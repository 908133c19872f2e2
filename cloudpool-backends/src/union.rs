//! One logical namespace over several backends.
//!
//! Reads fail over across backends in priority order, listings fan out and
//! merge, deletes fan out best-effort, and each write lands on exactly one
//! backend chosen by the selection policy. Availability probes are cached
//! per backend; an operation that fails for backend reasons marks the
//! backend unavailable until its cached probe expires or a later call on it
//! succeeds. Reads still try unavailable backends, after every available
//! one; writes only go to backends that are not marked unavailable.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use anyhow::bail;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use cloudpool_common::range::{skip_bytes, BoundedReader};
use cloudpool_common::{
    BackendAdapter, ObjectDescriptor, ObjectReader, RangeRequest, Result, StorageError,
};

use crate::selection::{Candidate, SelectBackend, SelectionPolicy};

#[derive(Debug, Clone)]
pub struct UnionConfig {
    /// Deadline for metadata calls and for a download to start delivering.
    pub op_timeout: Duration,
    /// Deadline for a whole upload, and for skipping to a range start.
    pub transfer_timeout: Duration,
    pub probe_timeout: Duration,
    /// How long a probe result is trusted.
    pub probe_ttl: Duration,
    pub selection: SelectionPolicy,
}

impl Default for UnionConfig {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_secs(30),
            transfer_timeout: Duration::from_secs(3600),
            probe_timeout: Duration::from_secs(5),
            probe_ttl: Duration::from_secs(30),
            selection: SelectionPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Unknown,
    Available,
    Unavailable,
}

/// Registry view of one configured backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendDescriptor {
    pub name: String,
    pub priority: i32,
    pub availability: Availability,
    pub last_probed: Option<DateTime<Utc>>,
    pub in_flight: usize,
}

struct Health {
    availability: Availability,
    last_probed: Option<DateTime<Utc>>,
    checked_at: Option<Instant>,
}

struct BackendSlot {
    adapter: Arc<dyn BackendAdapter>,
    priority: i32,
    health: Mutex<Health>,
    in_flight: AtomicUsize,
}

impl BackendSlot {
    fn name(&self) -> &str {
        self.adapter.name()
    }

    fn health(&self) -> MutexGuard<'_, Health> {
        self.health.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin(self: &Arc<Self>) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlight(Arc::clone(self))
    }

    fn cached(&self, ttl: Duration) -> Option<Availability> {
        let health = self.health();
        match health.checked_at {
            Some(at) if at.elapsed() < ttl => Some(health.availability),
            _ => None,
        }
    }

    fn record(&self, availability: Availability) {
        let previous = {
            let mut health = self.health();
            let previous = health.availability;
            health.availability = availability;
            health.last_probed = Some(Utc::now());
            health.checked_at = Some(Instant::now());
            previous
        };
        if previous != availability {
            match availability {
                Availability::Available => info!(backend = %self.name(), "Backend available"),
                Availability::Unavailable => warn!(backend = %self.name(), "Backend unavailable"),
                Availability::Unknown => {}
            }
        }
    }

    fn note_success(&self) {
        let availability = self.health().availability;
        if availability == Availability::Unavailable {
            self.record(Availability::Available);
        }
    }

    fn note_failure(&self, err: &StorageError) {
        if err.is_backend_fault() {
            warn!(backend = %self.name(), error = %err, "Backend operation failed");
            self.record(Availability::Unavailable);
        }
    }

    fn descriptor(&self) -> BackendDescriptor {
        let health = self.health();
        BackendDescriptor {
            name: self.name().to_string(),
            priority: self.priority,
            availability: health.availability,
            last_probed: health.last_probed,
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

struct InFlight(Arc<BackendSlot>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Counts an open download stream against its backend's load.
struct TrackedReader {
    inner: ObjectReader,
    _in_flight: InFlight,
}

impl AsyncRead for TrackedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Run one backend call under a deadline, tracking load and passive health.
async fn attempt<T, F, Fut>(slot: &Arc<BackendSlot>, timeout: Duration, op: F) -> Result<T>
where
    F: FnOnce(Arc<dyn BackendAdapter>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let _in_flight = slot.begin();
    let result = match tokio::time::timeout(timeout, op(Arc::clone(&slot.adapter))).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::Timeout {
            backend: slot.name().to_string(),
            timeout,
        }),
    };
    match &result {
        Ok(_) => slot.note_success(),
        Err(e) => slot.note_failure(e),
    }
    result
}

/// Per-request bookkeeping for read failover.
struct ReadFailures {
    path: String,
    total: usize,
    missing: usize,
    errors: Vec<String>,
}

impl ReadFailures {
    fn new(path: &str, total: usize) -> Self {
        Self {
            path: path.to_string(),
            total,
            missing: 0,
            errors: Vec::new(),
        }
    }

    fn record(&mut self, backend: &str, err: StorageError) {
        if err.is_not_found() {
            debug!(backend, key = %self.path, "Object not on backend");
            self.missing += 1;
        } else {
            warn!(backend, key = %self.path, error = %err, "Backend read failed, trying next");
            self.errors.push(format!("{}: {}", backend, err));
        }
    }

    /// NotFound only when every backend said so; anything else means the
    /// object may exist somewhere we could not reach.
    fn into_error(self) -> StorageError {
        if self.total > 0 && self.missing == self.total {
            return StorageError::NotFound(self.path);
        }
        StorageError::BackendUnavailable(format!("{}: {}", self.path, self.errors.join("; ")))
    }
}

pub struct UnionCoordinator {
    /// Sorted by priority, highest first; ties keep registration order.
    slots: Vec<Arc<BackendSlot>>,
    config: UnionConfig,
    selector: Box<dyn SelectBackend>,
}

impl UnionCoordinator {
    pub fn new(config: UnionConfig) -> Self {
        let selector = config.selection.build();
        Self {
            slots: Vec::new(),
            config,
            selector,
        }
    }

    /// Register a backend. Names must be unique within the union.
    pub fn add_backend(
        &mut self,
        adapter: Arc<dyn BackendAdapter>,
        priority: i32,
    ) -> anyhow::Result<()> {
        if self.slots.iter().any(|s| s.name() == adapter.name()) {
            bail!("duplicate backend name: {}", adapter.name());
        }
        info!(backend = %adapter.name(), priority, "Registered backend");
        let slot = Arc::new(BackendSlot {
            adapter,
            priority,
            health: Mutex::new(Health {
                availability: Availability::Unknown,
                last_probed: None,
                checked_at: None,
            }),
            in_flight: AtomicUsize::new(0),
        });
        let pos = self
            .slots
            .iter()
            .position(|s| s.priority < priority)
            .unwrap_or(self.slots.len());
        self.slots.insert(pos, slot);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn config(&self) -> &UnionConfig {
        &self.config
    }

    pub fn backends(&self) -> Vec<BackendDescriptor> {
        self.slots.iter().map(|s| s.descriptor()).collect()
    }

    async fn probe(&self, slot: &BackendSlot) -> Availability {
        if let Some(availability) = slot.cached(self.config.probe_ttl) {
            return availability;
        }
        let available = match tokio::time::timeout(self.config.probe_timeout, slot.adapter.is_available()).await {
            Ok(available) => available,
            Err(_) => {
                debug!(backend = %slot.name(), timeout = ?self.config.probe_timeout, "Probe timed out");
                false
            }
        };
        let availability = if available {
            Availability::Available
        } else {
            Availability::Unavailable
        };
        slot.record(availability);
        availability
    }

    /// Every backend in read preference order: available ones by priority,
    /// then the unavailable ones as a last resort.
    async fn read_order(&self) -> Vec<Arc<BackendSlot>> {
        let (available, unavailable) = self.partition().await;
        if !unavailable.is_empty() {
            debug!(count = unavailable.len(), "Unavailable backends moved to the end of the read order");
        }
        available.into_iter().chain(unavailable).collect()
    }

    /// Split the backends by their (possibly cached) probe result, keeping
    /// priority order within each half.
    async fn partition(&self) -> (Vec<Arc<BackendSlot>>, Vec<Arc<BackendSlot>>) {
        let states = join_all(self.slots.iter().map(|slot| self.probe(slot))).await;
        let mut available = Vec::with_capacity(self.slots.len());
        let mut unavailable = Vec::new();
        for (slot, state) in self.slots.iter().zip(states) {
            if state == Availability::Available {
                available.push(Arc::clone(slot));
            } else {
                unavailable.push(Arc::clone(slot));
            }
        }
        (available, unavailable)
    }

    /// True if at least one backend answers its probe.
    pub async fn is_available(&self) -> bool {
        let states = join_all(self.slots.iter().map(|slot| self.probe(slot))).await;
        states.contains(&Availability::Available)
    }

    /// Store an object on one available backend.
    ///
    /// The stream is consumed by the chosen backend, so a failed write is
    /// not retried elsewhere.
    pub async fn upload(
        &self,
        path: &str,
        reader: ObjectReader,
        size: Option<u64>,
    ) -> Result<ObjectDescriptor> {
        let (available, _) = self.partition().await;
        if available.is_empty() {
            return Err(StorageError::NoBackendAvailable);
        }
        let candidates: Vec<Candidate<'_>> = available
            .iter()
            .map(|slot| Candidate {
                name: slot.name(),
                priority: slot.priority,
                in_flight: slot.in_flight.load(Ordering::Relaxed),
            })
            .collect();
        let slot = &available[self.selector.select(&candidates).min(available.len() - 1)];

        debug!(backend = %slot.name(), key = %path, ?size, "Uploading");
        let result = attempt(slot, self.config.transfer_timeout, move |adapter| async move {
            adapter.upload(path, reader, size).await
        })
        .await;
        match result {
            Ok(desc) => {
                info!(backend = %slot.name(), key = %path, size = desc.size, "Upload stored");
                Ok(desc)
            }
            Err(e @ (StorageError::Cancelled | StorageError::InvalidKey(_))) => Err(e),
            Err(e) => Err(StorageError::BackendUnavailable(format!(
                "upload of {} to {} failed: {}",
                path,
                slot.name(),
                e
            ))),
        }
    }

    /// Open the object from the first backend that can serve it. With a
    /// range, the stream is advanced to `start` and cut off after `end`.
    pub async fn download(&self, path: &str, range: Option<RangeRequest>) -> Result<ObjectReader> {
        let candidates = self.read_order().await;
        let mut failures = ReadFailures::new(path, self.slots.len());

        for slot in &candidates {
            let opened = attempt(slot, self.config.op_timeout, |adapter| async move {
                adapter.download(path).await
            })
            .await;
            let reader = match opened {
                Ok(reader) => reader,
                Err(e) => {
                    failures.record(slot.name(), e);
                    continue;
                }
            };
            let reader = match range {
                None => reader,
                Some(range) => match self.seek(slot, reader, range).await {
                    Ok(reader) => reader,
                    Err(e) => {
                        failures.record(slot.name(), e);
                        continue;
                    }
                },
            };
            debug!(backend = %slot.name(), key = %path, ?range, "Serving download");
            return Ok(Box::new(TrackedReader {
                inner: reader,
                _in_flight: slot.begin(),
            }));
        }
        Err(failures.into_error())
    }

    /// Skip-and-copy: discard `range.start` bytes, then yield `range.len()`.
    async fn seek(
        &self,
        slot: &BackendSlot,
        mut reader: ObjectReader,
        range: RangeRequest,
    ) -> Result<ObjectReader> {
        let timeout = self.config.transfer_timeout;
        let err = match tokio::time::timeout(timeout, skip_bytes(&mut reader, range.start)).await {
            Ok(Ok(())) => return Ok(Box::new(BoundedReader::new(reader, range.len()))),
            Ok(Err(e)) => StorageError::Io(e),
            Err(_) => StorageError::Timeout {
                backend: slot.name().to_string(),
                timeout,
            },
        };
        slot.note_failure(&err);
        Err(err)
    }

    pub async fn stat(&self, path: &str) -> Result<ObjectDescriptor> {
        let candidates = self.read_order().await;
        let mut failures = ReadFailures::new(path, self.slots.len());
        for slot in &candidates {
            match attempt(slot, self.config.op_timeout, |adapter| async move {
                adapter.stat(path).await
            })
            .await
            {
                Ok(desc) => return Ok(desc),
                Err(e) => failures.record(slot.name(), e),
            }
        }
        Err(failures.into_error())
    }

    /// Merged listing of every reachable backend, sorted by path. For a
    /// path held by several backends, the first backend to answer wins.
    pub async fn list(&self, prefix: &str) -> Result<Vec<ObjectDescriptor>> {
        let mut tasks = JoinSet::new();
        let mut errors = Vec::new();
        for slot in &self.slots {
            if slot.cached(self.config.probe_ttl) == Some(Availability::Unavailable) {
                debug!(backend = %slot.name(), "Skipping unavailable backend in listing");
                errors.push(format!("{}: unavailable", slot.name()));
                continue;
            }
            let slot = Arc::clone(slot);
            let prefix = prefix.to_string();
            let timeout = self.config.op_timeout;
            tasks.spawn(async move {
                let result = attempt(&slot, timeout, move |adapter| async move {
                    adapter.list(&prefix).await
                })
                .await;
                (slot.name().to_string(), result)
            });
        }

        let mut merged: BTreeMap<String, ObjectDescriptor> = BTreeMap::new();
        let mut answered = 0usize;
        while let Some(joined) = tasks.join_next().await {
            let (backend, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(error = %e, "List task failed");
                    errors.push(e.to_string());
                    continue;
                }
            };
            match result {
                Ok(objects) => {
                    answered += 1;
                    debug!(backend = %backend, prefix, count = objects.len(), "Backend listing received");
                    for object in objects {
                        merged.entry(object.path.clone()).or_insert(object);
                    }
                }
                Err(e) => {
                    warn!(backend = %backend, prefix, error = %e, "Skipping backend in listing");
                    errors.push(format!("{}: {}", backend, e));
                }
            }
        }

        if answered == 0 && !self.slots.is_empty() {
            return Err(StorageError::BackendUnavailable(format!(
                "list {}: {}",
                prefix,
                errors.join("; ")
            )));
        }
        Ok(merged.into_values().collect())
    }

    /// Delete from every backend. Succeeds if any backend deleted it.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let timeout = self.config.op_timeout;
        let outcomes = join_all(self.slots.iter().map(|slot| async move {
            let result = attempt(slot, timeout, |adapter| async move {
                adapter.delete(path).await
            })
            .await;
            (slot.name(), result)
        }))
        .await;

        let mut deleted = Vec::new();
        let mut missing = 0usize;
        let mut errors = Vec::new();
        for (backend, result) in outcomes {
            match result {
                Ok(()) => deleted.push(backend),
                Err(e) if e.is_not_found() => missing += 1,
                Err(e) => {
                    warn!(backend, key = %path, error = %e, "Delete failed on backend");
                    errors.push(format!("{}: {}", backend, e));
                }
            }
        }

        if !deleted.is_empty() {
            if !errors.is_empty() {
                warn!(key = %path, failed = errors.len(), "Delete left copies on some backends");
            }
            info!(key = %path, backends = ?deleted, "Deleted object");
            return Ok(());
        }
        if missing == self.slots.len() {
            return Err(StorageError::NotFound(path.to_string()));
        }
        Err(StorageError::BackendUnavailable(format!(
            "delete {}: {}",
            path,
            errors.join("; ")
        )))
    }

    /// Link from the first backend, in read order, that supports links.
    pub async fn signed_url(&self, path: &str, expires: Duration) -> Result<String> {
        let candidates = self.read_order().await;
        let mut unsupported = 0usize;
        let mut failures = ReadFailures::new(path, self.slots.len());
        for slot in &candidates {
            match attempt(slot, self.config.op_timeout, |adapter| async move {
                adapter.signed_url(path, expires).await
            })
            .await
            {
                Ok(url) => return Ok(url),
                Err(StorageError::Unsupported(_)) => unsupported += 1,
                Err(e) => failures.record(slot.name(), e),
            }
        }
        if unsupported == self.slots.len() {
            return Err(StorageError::Unsupported("signed urls"));
        }
        failures.total -= unsupported;
        Err(failures.into_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::io::AsyncReadExt;

    #[derive(Default)]
    struct StubBackend {
        name: String,
        objects: Mutex<BTreeMap<String, Vec<u8>>>,
        unavailable: bool,
        failing: bool,
        delay: Option<Duration>,
        probes: AtomicUsize,
        downloads: AtomicUsize,
        /// Downloads left to fail before the backend recovers.
        failed_downloads: AtomicUsize,
    }

    impl StubBackend {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                ..Default::default()
            }
        }

        fn with(self, key: &str, data: &[u8]) -> Self {
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), data.to_vec());
            self
        }

        fn unavailable(mut self) -> Self {
            self.unavailable = true;
            self.failing = true;
            self
        }

        fn failing(mut self) -> Self {
            self.failing = true;
            self
        }

        fn failing_downloads(self, count: usize) -> Self {
            self.failed_downloads.store(count, Ordering::SeqCst);
            self
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        fn keys(&self) -> Vec<String> {
            self.objects.lock().unwrap().keys().cloned().collect()
        }

        async fn gate(&self) -> Result<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing {
                return Err(StorageError::backend(&self.name, "exit status 1"));
            }
            Ok(())
        }

        fn descriptor(&self, path: &str, size: usize) -> ObjectDescriptor {
            ObjectDescriptor {
                path: path.to_string(),
                size: size as u64,
                modified: Utc::now(),
                backend: self.name.clone(),
            }
        }
    }

    #[async_trait]
    impl BackendAdapter for StubBackend {
        fn name(&self) -> &str {
            &self.name
        }

        async fn upload(
            &self,
            path: &str,
            mut reader: ObjectReader,
            _size: Option<u64>,
        ) -> Result<ObjectDescriptor> {
            self.gate().await?;
            let mut data = Vec::new();
            reader.read_to_end(&mut data).await?;
            let desc = self.descriptor(path, data.len());
            self.objects.lock().unwrap().insert(path.to_string(), data);
            Ok(desc)
        }

        async fn download(&self, path: &str) -> Result<ObjectReader> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            self.gate().await?;
            let fail = self
                .failed_downloads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(StorageError::backend(&self.name, "connection reset"));
            }
            let data = self.objects.lock().unwrap().get(path).cloned();
            match data {
                Some(data) => Ok(Box::new(io::Cursor::new(data))),
                None => Err(StorageError::NotFound(path.to_string())),
            }
        }

        async fn list(&self, prefix: &str) -> Result<Vec<ObjectDescriptor>> {
            self.gate().await?;
            Ok(self
                .objects
                .lock()
                .unwrap()
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| self.descriptor(k, v.len()))
                .collect())
        }

        async fn delete(&self, path: &str) -> Result<()> {
            self.gate().await?;
            match self.objects.lock().unwrap().remove(path) {
                Some(_) => Ok(()),
                None => Err(StorageError::NotFound(path.to_string())),
            }
        }

        async fn stat(&self, path: &str) -> Result<ObjectDescriptor> {
            self.gate().await?;
            let size = self.objects.lock().unwrap().get(path).map(|d| d.len());
            size.map(|s| self.descriptor(path, s))
                .ok_or_else(|| StorageError::NotFound(path.to_string()))
        }

        async fn is_available(&self) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            !self.unavailable
        }
    }

    fn test_config() -> UnionConfig {
        UnionConfig {
            op_timeout: Duration::from_millis(200),
            transfer_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_millis(200),
            probe_ttl: Duration::from_secs(60),
            selection: SelectionPolicy::RoundRobin,
        }
    }

    fn union_of(backends: &[Arc<StubBackend>]) -> UnionCoordinator {
        let mut union = UnionCoordinator::new(test_config());
        for backend in backends {
            union
                .add_backend(Arc::clone(backend) as Arc<dyn BackendAdapter>, 0)
                .unwrap();
        }
        union
    }

    async fn read_all(mut reader: ObjectReader) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_download_fails_over_to_healthy_backend() {
        let b1 = Arc::new(StubBackend::new("b1").unavailable());
        let b2 = Arc::new(StubBackend::new("b2").unavailable());
        let b3 = Arc::new(StubBackend::new("b3").with("hello.txt", b"HELLO"));
        let union = union_of(&[b1.clone(), b2.clone(), b3.clone()]);

        let reader = union.download("hello.txt", None).await.unwrap();
        assert_eq!(read_all(reader).await, b"HELLO");
        assert_eq!(b1.downloads.load(Ordering::SeqCst), 0);
        assert_eq!(b2.downloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_download_follows_priority() {
        let low = Arc::new(StubBackend::new("low").with("a.txt", b"low"));
        let high = Arc::new(StubBackend::new("high").with("a.txt", b"high"));
        let mut union = UnionCoordinator::new(test_config());
        union.add_backend(low.clone(), 1).unwrap();
        union.add_backend(high.clone(), 5).unwrap();

        let names: Vec<String> = union.backends().into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["high", "low"]);
        let reader = union.download("a.txt", None).await.unwrap();
        assert_eq!(read_all(reader).await, b"high");
    }

    #[tokio::test]
    async fn test_not_found_only_when_every_backend_says_so() {
        let union = union_of(&[
            Arc::new(StubBackend::new("b1")),
            Arc::new(StubBackend::new("b2")),
        ]);
        let err = union.download("ghost.txt", None).await.err().unwrap();
        assert!(err.is_not_found(), "{}", err);
        assert!(union.stat("ghost.txt").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_mixed_failures_are_backend_unavailable() {
        let union = union_of(&[
            Arc::new(StubBackend::new("b1").failing()),
            Arc::new(StubBackend::new("b2")),
        ]);
        let err = union.download("ghost.txt", None).await.err().unwrap();
        match err {
            StorageError::BackendUnavailable(msg) => assert!(msg.contains("b1"), "{}", msg),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_failure_marks_backend_unavailable() {
        let flaky = Arc::new(StubBackend::new("flaky").failing());
        let good = Arc::new(StubBackend::new("good").with("k", b"v"));
        let union = union_of(&[flaky.clone(), good]);

        union.download("k", None).await.unwrap();
        let flaky_state = union
            .backends()
            .into_iter()
            .find(|b| b.name == "flaky")
            .unwrap();
        assert_eq!(flaky_state.availability, Availability::Unavailable);

        // Tried last on the next read while the mark is fresh.
        union.download("k", None).await.unwrap();
        assert_eq!(flaky.downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sole_backend_recovers_after_transient_failure() {
        let only = Arc::new(
            StubBackend::new("only")
                .with("k", b"v")
                .failing_downloads(1),
        );
        let union = union_of(&[only.clone()]);

        let err = union.download("k", None).await.err().unwrap();
        assert!(matches!(err, StorageError::BackendUnavailable(_)), "{}", err);
        assert_eq!(union.backends()[0].availability, Availability::Unavailable);

        // Still marked unavailable, but it is the only place to read from.
        let reader = union.download("k", None).await.unwrap();
        assert_eq!(read_all(reader).await, b"v");
        assert_eq!(only.downloads.load(Ordering::SeqCst), 2);
        assert_eq!(union.backends()[0].availability, Availability::Available);

        // The successful read cleared the mark, so writes land again.
        let desc = union
            .upload("k2", Box::new(&b"data"[..]), Some(4))
            .await
            .unwrap();
        assert_eq!(desc.backend, "only");
    }

    #[tokio::test]
    async fn test_unavailable_backend_is_read_last() {
        let primary = Arc::new(StubBackend::new("primary"));
        let marked = Arc::new(StubBackend::new("marked").with("only-here", b"v"));
        let union = union_of(&[marked.clone(), primary.clone()]);
        let slot = union.slots.iter().find(|s| s.name() == "marked").unwrap();
        slot.record(Availability::Unavailable);

        let reader = union.download("only-here", None).await.unwrap();
        assert_eq!(read_all(reader).await, b"v");
        assert_eq!(primary.downloads.load(Ordering::SeqCst), 1);
        assert_eq!(marked.downloads.load(Ordering::SeqCst), 1);
        assert!(union.stat("only-here").await.is_ok());

        // Writes still avoid a backend while it is marked.
        slot.record(Availability::Unavailable);
        let desc = union
            .upload("new", Box::new(&b"data"[..]), Some(4))
            .await
            .unwrap();
        assert_eq!(desc.backend, "primary");
    }

    #[tokio::test]
    async fn test_probe_results_are_cached() {
        let b1 = Arc::new(StubBackend::new("b1").with("k", b"v"));
        let union = union_of(&[b1.clone()]);
        for _ in 0..3 {
            union.stat("k").await.unwrap();
        }
        assert_eq!(b1.probes.load(Ordering::SeqCst), 1);
        assert!(union.is_available().await);
    }

    #[tokio::test]
    async fn test_ranged_download_skips_and_bounds() {
        let b1 = Arc::new(StubBackend::new("b1").with("digits", b"0123456789"));
        let union = union_of(&[b1]);
        let range = RangeRequest::new(3, Some(6), 10).unwrap();
        let reader = union.download("digits", Some(range)).await.unwrap();
        assert_eq!(read_all(reader).await, b"3456");
    }

    #[tokio::test]
    async fn test_list_merges_and_dedups() {
        let a = Arc::new(StubBackend::new("a").with("x", b"1").with("y", b"2"));
        let b = Arc::new(StubBackend::new("b").with("y", b"3").with("z", b"4"));
        let union = union_of(&[a, b]);

        let paths: Vec<String> = union
            .list("")
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.path)
            .collect();
        assert_eq!(paths, vec!["x", "y", "z"]);
    }

    #[tokio::test]
    async fn test_list_skips_failed_and_slow_backends() {
        let good = Arc::new(StubBackend::new("good").with("docs/a", b"1"));
        let broken = Arc::new(StubBackend::new("broken").failing());
        let slow = Arc::new(
            StubBackend::new("slow")
                .with("docs/b", b"2")
                .slow(Duration::from_secs(10)),
        );
        let union = union_of(&[good, broken, slow]);

        let started = Instant::now();
        let listed = union.list("docs/").await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, "docs/a");
    }

    #[tokio::test]
    async fn test_list_fails_when_nobody_answers() {
        let union = union_of(&[Arc::new(StubBackend::new("broken").failing())]);
        assert!(matches!(
            union.list("").await,
            Err(StorageError::BackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_semantics() {
        let a = Arc::new(StubBackend::new("a").with("k", b"1"));
        let b = Arc::new(StubBackend::new("b").with("k", b"1"));
        let c = Arc::new(StubBackend::new("c"));
        let union = union_of(&[a.clone(), b.clone(), c]);

        union.delete("k").await.unwrap();
        assert!(a.keys().is_empty());
        assert!(b.keys().is_empty());
        assert!(union.delete("k").await.unwrap_err().is_not_found());

        let broken = union_of(&[
            Arc::new(StubBackend::new("x").failing()),
            Arc::new(StubBackend::new("y")),
        ]);
        assert!(matches!(
            broken.delete("k").await,
            Err(StorageError::BackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_upload_round_robin_across_available() {
        let a = Arc::new(StubBackend::new("a"));
        let b = Arc::new(StubBackend::new("b"));
        let down = Arc::new(StubBackend::new("down").unavailable());
        let union = union_of(&[a.clone(), down.clone(), b.clone()]);

        for key in ["one", "two", "three", "four"] {
            let desc = union
                .upload(key, Box::new(&b"data"[..]), Some(4))
                .await
                .unwrap();
            assert_ne!(desc.backend, "down");
        }
        assert_eq!(a.keys().len(), 2);
        assert_eq!(b.keys().len(), 2);
        assert!(down.keys().is_empty());
    }

    #[tokio::test]
    async fn test_upload_without_available_backend() {
        let union = union_of(&[Arc::new(StubBackend::new("down").unavailable())]);
        let err = union
            .upload("k", Box::new(&b"data"[..]), Some(4))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NoBackendAvailable));
        assert!(!union.is_available().await);
    }

    #[tokio::test]
    async fn test_signed_url_unsupported_everywhere() {
        let union = union_of(&[Arc::new(StubBackend::new("a").with("k", b"1"))]);
        assert!(matches!(
            union.signed_url("k", Duration::from_secs(60)).await,
            Err(StorageError::Unsupported(_))
        ));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut union = UnionCoordinator::new(UnionConfig::default());
        union.add_backend(Arc::new(StubBackend::new("a")), 0).unwrap();
        assert!(union.add_backend(Arc::new(StubBackend::new("a")), 3).is_err());
        assert_eq!(union.len(), 1);
    }
}
