//! Write-target selection among currently available backends.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Deserialize;

/// What a selection policy gets to see about each candidate.
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    pub name: &'a str,
    pub priority: i32,
    /// Operations and open streams currently running against the backend.
    pub in_flight: usize,
}

/// Picks the backend that receives an upload.
pub trait SelectBackend: Send + Sync {
    /// Index into `candidates`, which is never empty.
    fn select(&self, candidates: &[Candidate<'_>]) -> usize;
}

#[derive(Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl SelectBackend for RoundRobin {
    fn select(&self, candidates: &[Candidate<'_>]) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % candidates.len()
    }
}

/// Fewest in-flight operations wins; ties go to the higher priority, then
/// to the earlier candidate.
pub struct LeastLoaded;

impl SelectBackend for LeastLoaded {
    fn select(&self, candidates: &[Candidate<'_>]) -> usize {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(idx, c)| (c.in_flight, std::cmp::Reverse(c.priority), *idx))
            .map(|(idx, _)| idx)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    #[default]
    RoundRobin,
    LeastLoaded,
}

impl SelectionPolicy {
    pub fn build(self) -> Box<dyn SelectBackend> {
        match self {
            SelectionPolicy::RoundRobin => Box::new(RoundRobin::default()),
            SelectionPolicy::LeastLoaded => Box::new(LeastLoaded),
        }
    }
}
