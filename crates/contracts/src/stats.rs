//! Point-in-time counter snapshots for reporting

use serde::Serialize;

use crate::Lifecycle;

/// Snapshot of a sink's counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SinkStats {
    pub name: String,
    /// Entries waiting in the sink's own queue (including the writer's buffer)
    pub queued: usize,
    /// Records made durable
    pub written: u64,
    /// Records discarded (eviction, fatal error, closed sink)
    pub dropped: u64,
    /// Failed write/send attempts, including ones later retried
    pub failures: u64,
    /// Completed file rotations
    pub rotations: u64,
}

/// Snapshot of the logger's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoggerStats {
    pub lifecycle: Lifecycle,
    /// Records admitted to the queue
    pub submitted: u64,
    /// Records handed to the sinks
    pub dispatched: u64,
    /// Records discarded by the overflow policy or after shutdown
    pub dropped: u64,
    pub queue_len: usize,
    pub sink_count: usize,
}
