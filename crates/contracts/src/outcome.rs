//! Results of the bounded-wait operations.
//!
//! Every wait in the pipeline has a deadline; these types keep a timeout
//! distinguishable from a clean completion.

use serde::Serialize;

/// Result of a bounded flush
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushOutcome {
    /// Everything accepted before the call is durable or counted as dropped
    Completed,
    /// The deadline elapsed with work still pending
    TimedOut,
}

impl FlushOutcome {
    pub fn is_completed(self) -> bool {
        matches!(self, FlushOutcome::Completed)
    }

    /// Combine two outcomes; any timeout wins
    pub fn and(self, other: FlushOutcome) -> FlushOutcome {
        if self.is_completed() && other.is_completed() {
            FlushOutcome::Completed
        } else {
            FlushOutcome::TimedOut
        }
    }
}

/// Result of `Logger::shutdown`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownOutcome {
    /// Logger was not running
    AlreadyStopped,
    /// Dispatch loop drained the queue and joined
    Drained,
    /// Dispatch loop was detached; `abandoned` records were still queued
    TimedOut { abandoned: usize },
}

/// Result of closing a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseOutcome {
    AlreadyClosed,
    /// Writer drained and joined
    Closed,
    /// Writer was detached; `abandoned` entries could not be written
    Detached { abandoned: usize },
}
