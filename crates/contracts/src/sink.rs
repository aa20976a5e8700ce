//! LogSink trait - Logger output interface
//!
//! Defines the abstract interface for durable destinations.

use crate::{CloseOutcome, ContractError, FlushOutcome, LogRecord, SinkStats};

/// Durable destination for batches of records
///
/// All sink implementations must implement this trait. The logger calls
/// `consume` from its single dispatch thread with non-overlapping batches;
/// `flush` and `close` may be called from any thread.
pub trait LogSink: Send + Sync {
    /// Sink name (used for logging/metrics)
    fn name(&self) -> &str;

    /// Accept a batch
    ///
    /// Implementations may enqueue and return. Relative order within the
    /// batch must be preserved. Internal failures are handled and counted by
    /// the sink; an `Err` (or a panic) is isolated and logged by the logger.
    fn consume(&self, batch: &[LogRecord]) -> Result<(), ContractError>;

    /// Block until every record accepted so far is durable or counted as
    /// dropped, bounded by the sink's own timeout
    fn flush(&self) -> FlushOutcome;

    /// Stop accepting batches and release resources, bounded in time
    fn close(&self) -> CloseOutcome {
        CloseOutcome::Closed
    }

    /// Counters snapshot
    fn stats(&self) -> SinkStats;
}
