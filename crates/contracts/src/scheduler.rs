//! TaskScheduler trait - shared recurring-task facility
//!
//! Lets a sink run its writer as a periodic unit of work on threads owned by
//! the host process instead of a dedicated thread.

use std::sync::Arc;
use std::time::Duration;

/// Identifier of a scheduled recurring task
pub type RecurringId = u64;

/// Idempotent unit of work run repeatedly by a scheduler
pub type RecurringTask = Arc<dyn Fn() + Send + Sync>;

/// Recurring task scheduler
///
/// # Example
///
/// ```ignore
/// let id = scheduler.schedule_recurring(Duration::from_millis(200), Arc::new(move || {
///     sink.drain_once();
/// }));
/// // ...
/// scheduler.cancel_recurring(id);
/// ```
pub trait TaskScheduler: Send + Sync {
    /// Run `task` every `interval` until cancelled
    ///
    /// Runs of the same task must not overlap.
    fn schedule_recurring(&self, interval: Duration, task: RecurringTask) -> RecurringId;

    /// Stop a recurring task; unknown ids are ignored
    ///
    /// A run already in progress may complete after this returns.
    fn cancel_recurring(&self, id: RecurringId);
}
