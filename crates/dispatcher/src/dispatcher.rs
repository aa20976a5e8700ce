//! Logger - bounded queue, policy-gated admission and the dispatch loop

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use contracts::{
    FlushOutcome, Lifecycle, LogLevel, LogRecord, LogSink, LoggerConfig, LoggerStats,
    LoggingProfile, OverflowPolicy, RecordFields, ShutdownOutcome, SinkStats,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::error::DispatcherError;
use crate::registry::{SinkId, SinkRegistry};
use crate::worker::{panic_message, remaining, JoinOutcome, Worker};

const DISPATCH_THREAD_NAME: &str = "reglog-dispatch";

struct QueueState {
    queue: VecDeque<LogRecord>,
    lifecycle: Lifecycle,
    /// Dispatch loop should exit once the queue is empty
    stop: bool,
    /// Records popped but not yet handed to every sink
    in_flight: usize,
    /// Incremented per `start`; a detached loop from an older run exits
    run: u64,
    /// Block policy tickets
    next_ticket: u64,
    now_serving: u64,
    /// Incremented when shutdown begins; voids outstanding tickets
    epoch: u64,
}

impl QueueState {
    fn accepting(&self) -> bool {
        self.lifecycle != Lifecycle::Draining && !self.stop
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight == 0
    }
}

struct Inner {
    config: LoggerConfig,
    state: Mutex<QueueState>,
    /// Dispatch loop waits here for records
    not_empty: Condvar,
    /// Blocked producers wait here for room
    not_full: Condvar,
    /// Flush waiters wait here for an idle queue
    drained: Condvar,
    registry: SinkRegistry,
    submitted: AtomicU64,
    dispatched: AtomicU64,
    dropped: AtomicU64,
    queue_len: AtomicUsize,
}

/// Asynchronous structured logger
///
/// Producers call [`Logger::log`] from any thread; a single dispatch thread
/// drains the queue in batches and hands each batch to every registered sink
/// in registration order.
///
/// # Example
///
/// ```no_run
/// use contracts::{LogLevel, LoggerConfig, RecordFields};
/// use dispatcher::Logger;
///
/// let logger = Logger::new(LoggerConfig::default());
/// logger.start().unwrap();
/// logger.log(LogLevel::Info, RecordFields::new("value set").key_path("HKCU\\Software"));
/// logger.shutdown(true);
/// ```
pub struct Logger {
    inner: Arc<Inner>,
    worker: Mutex<Option<Worker>>,
}

impl Logger {
    /// Create a stopped logger; records logged before `start` are queued
    pub fn new(config: LoggerConfig) -> Self {
        let capacity = config.max_queue.min(4096);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::with_capacity(capacity),
                    lifecycle: Lifecycle::Stopped,
                    stop: false,
                    in_flight: 0,
                    run: 0,
                    next_ticket: 0,
                    now_serving: 0,
                    epoch: 0,
                }),
                config,
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                drained: Condvar::new(),
                registry: SinkRegistry::new(),
                submitted: AtomicU64::new(0),
                dispatched: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                queue_len: AtomicUsize::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &LoggerConfig {
        &self.inner.config
    }

    pub fn profile(&self) -> LoggingProfile {
        self.inner.config.profile
    }

    /// Whether a record at `level` would pass the profile floor
    #[inline]
    pub fn is_enabled(&self, level: LogLevel) -> bool {
        self.inner.config.profile.admits(level)
    }

    /// Capture and enqueue a record
    ///
    /// Below the profile floor this returns before building anything. Only
    /// the `Block` policy can make the caller wait, and only while the queue
    /// is full and the dispatch loop is running.
    pub fn log(&self, level: LogLevel, fields: RecordFields) {
        if !self.is_enabled(level) {
            return;
        }
        self.inner.admit(LogRecord::capture(level, fields));
    }

    /// Like [`Logger::log`], but `fields` is only evaluated past the floor
    pub fn log_with<F>(&self, level: LogLevel, fields: F)
    where
        F: FnOnce() -> RecordFields,
    {
        if !self.is_enabled(level) {
            return;
        }
        self.inner.admit(LogRecord::capture(level, fields()));
    }

    /// Enqueue an already captured record, subject to the profile floor
    pub fn submit(&self, record: LogRecord) {
        if !self.is_enabled(record.level()) {
            return;
        }
        self.inner.admit(record);
    }

    /// Spawn the dispatch loop; no-op while already running
    #[instrument(name = "logger_start", skip(self))]
    pub fn start(&self) -> Result<(), DispatcherError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let run = {
            let mut state = self.inner.state.lock();
            state.lifecycle = Lifecycle::Running;
            state.stop = false;
            state.run += 1;
            state.run
        };
        // Wake a loop from a previous run that was detached
        self.inner.not_empty.notify_all();

        let inner = Arc::clone(&self.inner);
        match Worker::spawn(DISPATCH_THREAD_NAME, move || inner.dispatch_loop(run)) {
            Ok(spawned) => {
                *worker = Some(spawned);
                info!(
                    max_queue = self.inner.config.max_queue,
                    policy = ?self.inner.config.overflow_policy,
                    profile = ?self.inner.config.profile,
                    sinks = self.inner.registry.len(),
                    "Logger started"
                );
                Ok(())
            }
            Err(e) => {
                self.inner.state.lock().lifecycle = Lifecycle::Stopped;
                error!(error = %e, "Failed to start dispatch loop");
                Err(e)
            }
        }
    }

    /// Stop the dispatch loop after it drains the queue, bounded by
    /// `shutdown_timeout`; flush every sink afterwards if `flush` is set
    ///
    /// Records logged once shutdown begins are dropped and counted.
    #[instrument(name = "logger_shutdown", skip(self))]
    pub fn shutdown(&self, flush: bool) -> ShutdownOutcome {
        let Some(worker) = self.worker.lock().take() else {
            return ShutdownOutcome::AlreadyStopped;
        };

        {
            let mut state = self.inner.state.lock();
            state.lifecycle = Lifecycle::Draining;
            state.stop = true;
            state.epoch += 1;
            state.now_serving = state.next_ticket;
        }
        self.inner.not_empty.notify_all();
        self.inner.not_full.notify_all();
        debug!(queued = self.queue_size(), "Logger draining");

        let outcome = match worker.join_timeout(self.inner.config.shutdown_timeout()) {
            JoinOutcome::Joined => ShutdownOutcome::Drained,
            JoinOutcome::Detached => {
                let abandoned = {
                    let state = self.inner.state.lock();
                    state.queue.len() + state.in_flight
                };
                error!(
                    abandoned,
                    timeout_ms = self.inner.config.shutdown_timeout_ms,
                    "Dispatch loop did not drain in time; detached"
                );
                ShutdownOutcome::TimedOut { abandoned }
            }
        };

        self.inner.state.lock().lifecycle = Lifecycle::Stopped;
        self.inner.drained.notify_all();

        if flush {
            self.inner.flush_sinks();
        }

        info!(
            outcome = ?outcome,
            submitted = self.inner.submitted.load(Ordering::Relaxed),
            dispatched = self.inner.dispatched.load(Ordering::Relaxed),
            dropped = self.dropped_count(),
            "Logger stopped"
        );
        outcome
    }

    /// Wait until the queue is empty and every sink reports durable
    ///
    /// Both waits are bounded; a timeout is logged and reported, never hung on.
    #[instrument(name = "logger_flush", skip(self))]
    pub fn flush(&self) -> FlushOutcome {
        let queue_outcome = if self.inner.registry.is_dispatch_thread() {
            // Waiting for our own loop would never finish
            FlushOutcome::Completed
        } else {
            self.inner.wait_drained()
        };
        queue_outcome.and(self.inner.flush_sinks())
    }

    /// Register a sink; it receives every batch dispatched from now on
    pub fn add_sink(&self, sink: Arc<dyn LogSink>) -> SinkId {
        self.inner.registry.add(sink)
    }

    /// Unregister a sink once no in-flight dispatch can still reach it
    pub fn remove_sink(&self, id: SinkId) -> Option<Arc<dyn LogSink>> {
        self.inner.registry.remove(id)
    }

    pub fn sink_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Records currently queued (non-blocking)
    pub fn queue_size(&self) -> usize {
        self.inner.queue_len.load(Ordering::Relaxed)
    }

    /// Records discarded by the overflow policy or after shutdown (non-blocking)
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.state.lock().lifecycle
    }

    pub fn stats(&self) -> LoggerStats {
        LoggerStats {
            lifecycle: self.lifecycle(),
            submitted: self.inner.submitted.load(Ordering::Relaxed),
            dispatched: self.inner.dispatched.load(Ordering::Relaxed),
            dropped: self.dropped_count(),
            queue_len: self.queue_size(),
            sink_count: self.sink_count(),
        }
    }

    pub fn sink_stats(&self) -> Vec<SinkStats> {
        self.inner.registry.stats()
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        if self.worker.lock().is_some() {
            self.shutdown(true);
        }
    }
}

impl Inner {
    fn admit(&self, record: LogRecord) {
        let capacity = self.config.max_queue;
        let mut state = self.state.lock();

        if !state.accepting() {
            drop(state);
            self.count_dropped(1);
            trace!("Record dropped, logger is shutting down");
            return;
        }

        let full = state.queue.len() >= capacity;
        match self.config.overflow_policy {
            OverflowPolicy::DropNewest if full => {
                drop(state);
                self.count_dropped(1);
                return;
            }
            OverflowPolicy::DropOldest if full => {
                let mut evicted = 0;
                while state.queue.len() >= capacity && state.queue.pop_front().is_some() {
                    evicted += 1;
                }
                self.count_dropped(evicted);
            }
            OverflowPolicy::Block if full || state.next_ticket != state.now_serving => {
                // Without a running loop (or from inside it) nobody makes room
                let can_wait =
                    state.lifecycle == Lifecycle::Running && !self.registry.is_dispatch_thread();
                if can_wait {
                    if !self.wait_for_turn(&mut state) {
                        drop(state);
                        self.count_dropped(1);
                        return;
                    }
                } else if full {
                    drop(state);
                    self.count_dropped(1);
                    return;
                }
            }
            _ => {}
        }

        state.queue.push_back(record);
        self.queue_len.store(state.queue.len(), Ordering::Relaxed);
        drop(state);

        self.submitted.fetch_add(1, Ordering::Relaxed);
        self.not_empty.notify_one();
    }

    /// Queue in ticket order until there is room; false when shutdown
    /// begins first
    fn wait_for_turn(&self, state: &mut MutexGuard<'_, QueueState>) -> bool {
        let capacity = self.config.max_queue;
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        let epoch = state.epoch;

        self.not_full.wait_while(state, |s| {
            s.epoch == epoch && !(s.now_serving == ticket && s.queue.len() < capacity)
        });

        if state.epoch != epoch {
            return false;
        }
        state.now_serving += 1;
        // The next ticket holder may already fit
        self.not_full.notify_all();
        true
    }

    fn count_dropped(&self, n: u64) {
        if n > 0 {
            self.dropped.fetch_add(n, Ordering::Relaxed);
        }
    }

    #[instrument(name = "logger_dispatch_loop", skip(self))]
    fn dispatch_loop(&self, run: u64) {
        let me = thread::current().id();
        self.registry.set_dispatch_thread(me);
        debug!("Dispatch loop started");

        let interval = self.config.flush_interval();
        let max_batch = self.config.max_batch.max(1);
        let mut batches: u64 = 0;

        loop {
            let batch = {
                let mut state = self.state.lock();
                self.not_empty.wait_while_for(
                    &mut state,
                    |s| s.queue.is_empty() && !s.stop && s.run == run,
                    interval,
                );

                if state.run != run {
                    debug!("Superseded by a newer run, exiting");
                    return;
                }
                if state.queue.is_empty() {
                    if state.stop {
                        break;
                    }
                    continue;
                }

                let n = state.queue.len().min(max_batch);
                let batch: Vec<LogRecord> = state.queue.drain(..n).collect();
                state.in_flight += batch.len();
                self.queue_len.store(state.queue.len(), Ordering::Relaxed);
                batch
            };
            self.not_full.notify_all();

            self.deliver(&batch);
            batches += 1;

            let mut state = self.state.lock();
            state.in_flight -= batch.len();
            self.dispatched
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            if state.is_idle() {
                self.drained.notify_all();
            }
        }

        self.registry.clear_dispatch_thread(me);
        self.drained.notify_all();
        debug!(batches, "Dispatch loop finished");
    }

    /// Hand one batch to every sink; failures stay with the failing sink
    fn deliver(&self, batch: &[LogRecord]) {
        let snapshot = self.registry.acquire();
        for entry in snapshot.entries() {
            let sink = &entry.sink;
            match catch_unwind(AssertUnwindSafe(|| sink.consume(batch))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(sink = %sink.name(), records = batch.len(), error = %e, "Sink rejected batch");
                }
                Err(payload) => {
                    error!(
                        sink = %sink.name(),
                        records = batch.len(),
                        panic = %panic_message(payload.as_ref()),
                        "Sink panicked during consume"
                    );
                }
            }
        }
    }

    fn wait_drained(&self) -> FlushOutcome {
        let timeout = self.config.flush_timeout();
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        if state.is_idle() {
            return FlushOutcome::Completed;
        }
        if state.lifecycle != Lifecycle::Running {
            warn!(
                queued = state.queue.len(),
                "Flush requested while the dispatch loop is not running"
            );
            return FlushOutcome::TimedOut;
        }

        self.drained.wait_while_for(
            &mut state,
            |s| !s.is_idle() && s.lifecycle == Lifecycle::Running,
            remaining(deadline),
        );
        if state.is_idle() {
            FlushOutcome::Completed
        } else {
            warn!(
                queued = state.queue.len(),
                in_flight = state.in_flight,
                timeout_ms = self.config.flush_timeout_ms,
                "Logger flush timed out"
            );
            FlushOutcome::TimedOut
        }
    }

    fn flush_sinks(&self) -> FlushOutcome {
        let mut outcome = FlushOutcome::Completed;
        for sink in self.registry.sinks() {
            let result = catch_unwind(AssertUnwindSafe(|| sink.flush())).unwrap_or_else(|payload| {
                error!(
                    sink = %sink.name(),
                    panic = %panic_message(payload.as_ref()),
                    "Sink panicked during flush"
                );
                FlushOutcome::TimedOut
            });
            if !result.is_completed() {
                warn!(sink = %sink.name(), "Sink flush did not complete");
            }
            outcome = outcome.and(result);
        }
        outcome
    }
}
