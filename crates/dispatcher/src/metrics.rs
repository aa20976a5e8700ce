//! Sink metrics for observability

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use contracts::SinkStats;

/// Counters for a single sink
#[derive(Debug, Default)]
pub struct SinkMetrics {
    /// Entries waiting in the sink (queue plus writer buffer)
    queued: AtomicUsize,
    /// Records made durable
    written: AtomicU64,
    /// Records discarded
    dropped: AtomicU64,
    /// Failed write attempts
    failures: AtomicU64,
    /// Completed rotations
    rotations: AtomicU64,
}

impl SinkMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    pub fn set_queued(&self, len: usize) {
        self.queued.store(len, Ordering::Relaxed);
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn add_written(&self, n: u64) {
        self.written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn add_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn inc_failures(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rotations(&self) -> u64 {
        self.rotations.load(Ordering::Relaxed)
    }

    pub fn inc_rotations(&self) {
        self.rotations.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of all counters
    pub fn snapshot(&self, name: &str) -> SinkStats {
        SinkStats {
            name: name.to_string(),
            queued: self.queued(),
            written: self.written(),
            dropped: self.dropped(),
            failures: self.failures(),
            rotations: self.rotations(),
        }
    }
}
