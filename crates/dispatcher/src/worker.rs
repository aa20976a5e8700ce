//! Worker - named OS thread whose join is bounded in time

use std::any::Any;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::error::DispatcherError;

/// Time left until `deadline`, zero once passed
pub(crate) fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// How a bounded join ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Thread finished and was joined
    Joined,
    /// Deadline elapsed; the thread keeps running on its own
    Detached,
}

#[derive(Default)]
struct Latch {
    finished: Mutex<bool>,
    cv: Condvar,
}

/// Releases the latch when the thread body returns or unwinds
struct LatchGuard(Arc<Latch>);

impl Drop for LatchGuard {
    fn drop(&mut self) {
        *self.0.finished.lock() = true;
        self.0.cv.notify_all();
    }
}

/// Handle to a running worker thread
pub struct Worker {
    /// Thread name
    name: String,
    handle: JoinHandle<()>,
    latch: Arc<Latch>,
}

impl Worker {
    /// Spawn `body` on a new thread called `name`
    pub fn spawn<F>(name: impl Into<String>, body: F) -> Result<Self, DispatcherError>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let latch = Arc::new(Latch::default());
        let thread_latch = Arc::clone(&latch);

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _guard = LatchGuard(thread_latch);
                body();
            })
            .map_err(|e| DispatcherError::spawn(&name, e))?;

        debug!(worker = %name, "Worker started");
        Ok(Self {
            name,
            handle,
            latch,
        })
    }

    /// Get worker name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn thread_id(&self) -> ThreadId {
        self.handle.thread().id()
    }

    pub fn is_finished(&self) -> bool {
        *self.latch.finished.lock()
    }

    /// Wait up to `timeout` for the thread to finish
    ///
    /// Joining from the worker's own thread detaches immediately.
    pub fn join_timeout(self, timeout: Duration) -> JoinOutcome {
        if self.thread_id() == thread::current().id() {
            warn!(worker = %self.name, "Join requested from the worker itself, detaching");
            return JoinOutcome::Detached;
        }

        let finished = {
            let mut guard = self.latch.finished.lock();
            self.latch.cv.wait_while_for(&mut guard, |done| !*done, timeout);
            *guard
        };

        if !finished {
            warn!(
                worker = %self.name,
                timeout_ms = timeout.as_millis() as u64,
                "Worker did not finish in time, detaching"
            );
            return JoinOutcome::Detached;
        }

        if let Err(payload) = self.handle.join() {
            error!(
                worker = %self.name,
                panic = %panic_message(payload.as_ref()),
                "Worker thread panicked"
            );
        }
        debug!(worker = %self.name, "Worker joined");
        JoinOutcome::Joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_worker_joins() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let worker = Worker::spawn("test-join", move || flag.store(true, Ordering::SeqCst)).unwrap();

        assert_eq!(worker.join_timeout(Duration::from_secs(5)), JoinOutcome::Joined);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_worker_detaches_on_timeout() {
        let release = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&release);
        let worker = Worker::spawn("test-detach", move || {
            while !flag.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(5));
            }
        })
        .unwrap();

        assert_eq!(worker.name(), "test-detach");
        assert_eq!(
            worker.join_timeout(Duration::from_millis(20)),
            JoinOutcome::Detached
        );
        release.store(true, Ordering::SeqCst);
    }

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");

        let payload = std::panic::catch_unwind(|| panic!("formatted {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 7");
    }

    #[test]
    fn test_remaining_saturates() {
        let past = Instant::now();
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(remaining(past), Duration::ZERO);
    }

    #[test]
    fn test_worker_panic_still_joins() {
        let worker = Worker::spawn("test-panic", || panic!("worker failure")).unwrap();
        assert_eq!(worker.join_timeout(Duration::from_secs(5)), JoinOutcome::Joined);
    }
}
