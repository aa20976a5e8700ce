//! TokioScheduler - runs recurring sink work on a tokio runtime
//!
//! Each task gets its own interval timer. The work itself runs on the
//! blocking pool and is awaited before the next tick, so runs of one task
//! never overlap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use contracts::{RecurringId, RecurringTask, TaskScheduler};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::error::DispatcherError;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// [`TaskScheduler`] backed by a tokio runtime handle
pub struct TokioScheduler {
    handle: Handle,
    next_id: AtomicU64,
    tasks: Mutex<HashMap<RecurringId, JoinHandle<()>>>,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Scheduler on the runtime the caller is running in
    pub fn current() -> Result<Self, DispatcherError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| DispatcherError::Runtime(e.to_string()))
    }

    /// Number of tasks not yet cancelled
    pub fn active(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl TaskScheduler for TokioScheduler {
    fn schedule_recurring(&self, interval: Duration, task: RecurringTask) -> RecurringId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let period = interval.max(MIN_INTERVAL);

        let join = self.handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let run = Arc::clone(&task);
                if let Err(e) = tokio::task::spawn_blocking(move || run()).await {
                    warn!(task = id, error = %e, "Recurring task failed");
                }
            }
        });

        self.tasks.lock().insert(id, join);
        debug!(task = id, interval_ms = period.as_millis() as u64, "Recurring task scheduled");
        id
    }

    fn cancel_recurring(&self, id: RecurringId) {
        if let Some(join) = self.tasks.lock().remove(&id) {
            join.abort();
            debug!(task = id, "Recurring task cancelled");
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, join) in self.tasks.lock().drain() {
            join.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_recurring_task_runs_until_cancelled() {
        let scheduler = TokioScheduler::current().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        let id = scheduler.schedule_recurring(
            Duration::from_millis(10),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(scheduler.active(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.cancel_recurring(id);
        assert_eq!(scheduler.active(), 0);

        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(runs.load(Ordering::SeqCst) <= seen + 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_runs_do_not_overlap() {
        let scheduler = TokioScheduler::current().unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicUsize::new(0));

        let (a, o) = (Arc::clone(&active), Arc::clone(&overlapped));
        scheduler.schedule_recurring(
            Duration::from_millis(1),
            Arc::new(move || {
                if a.fetch_add(1, Ordering::SeqCst) > 0 {
                    o.fetch_add(1, Ordering::SeqCst);
                }
                std::thread::sleep(Duration::from_millis(5));
                a.fetch_sub(1, Ordering::SeqCst);
            }),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        drop(scheduler);
        assert_eq!(overlapped.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_current_without_runtime_fails() {
        assert!(matches!(
            TokioScheduler::current(),
            Err(DispatcherError::Runtime(_))
        ));
    }
}
