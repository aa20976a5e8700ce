//! EventSink - records forwarded to an OS structured-event facility
//!
//! Lines longer than `max_payload_bytes` are cut and tagged with a marker
//! and a reference to the full record. The queue is bounded by entry count
//! and bytes; the oldest entries are evicted first. Delivery runs either on a
//! dedicated thread or as a recurring task on a shared [`TaskScheduler`].

mod facility;

pub use self::facility::{
    open_facility, EventFacility, EventSeverity, FacilityError, FileFacility, SyslogFacility,
};

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use contracts::{
    CloseOutcome, ContractError, EventSinkConfig, FlushOutcome, LogRecord, LogSink, RecurringId,
    SinkStats, TaskScheduler,
};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::error::DispatcherError;
use crate::metrics::SinkMetrics;
use crate::worker::{remaining, JoinOutcome, Worker};

/// Appended to a cut payload, followed by the reference
pub const TRUNCATION_MARKER: &str = "...[TRUNCATED]";

/// Fit a record into `max_payload` bytes
///
/// Returns the payload (without trailing newline) and whether it was cut.
/// A cut payload ends with the marker and ` snap=<id>`, or
/// ` ref=<timestamp>/<thread>` when the record has no snapshot id. The
/// reference is never cut: only the body shrinks, so a reference longer
/// than `max_payload` yields a payload of marker and reference alone.
pub fn prepare_payload(record: &LogRecord, max_payload: usize) -> (String, bool) {
    let mut line = record.to_ndjson_line();
    if line.ends_with('\n') {
        line.pop();
    }
    if line.len() <= max_payload {
        return (line, false);
    }

    let reference = match record.snapshot_id() {
        Some(id) => format!(" snap={id}"),
        None => format!(" ref={}/{}", record.timestamp(), record.tid()),
    };
    let mut suffix = String::with_capacity(TRUNCATION_MARKER.len() + reference.len());
    suffix.push_str(TRUNCATION_MARKER);
    suffix.push_str(&reference);

    let keep = char_floor(&line, max_payload.saturating_sub(suffix.len()));
    line.truncate(keep);
    line.push_str(&suffix);
    (line, true)
}

/// Largest char boundary of `s` not above `index`
fn char_floor(s: &str, index: usize) -> usize {
    let mut index = index.min(s.len());
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

struct EventEntry {
    severity: EventSeverity,
    payload: String,
}

struct EventQueue {
    entries: VecDeque<EventEntry>,
    bytes: usize,
    /// Entries taken by the current drain pass
    sending: usize,
    flush_requested: bool,
    stop: bool,
    closed: bool,
}

impl EventQueue {
    fn pending(&self) -> usize {
        self.entries.len() + self.sending
    }
}

struct Shared {
    name: String,
    config: EventSinkConfig,
    facility: Mutex<Box<dyn EventFacility>>,
    queue: Mutex<EventQueue>,
    wake: Condvar,
    idle: Condvar,
    /// Held by whichever context is draining; scheduled runs never overlap
    run_guard: Mutex<()>,
    metrics: SinkMetrics,
}

enum Driver {
    Thread(Worker),
    Scheduled {
        scheduler: Arc<dyn TaskScheduler>,
        id: RecurringId,
    },
}

/// Sink reporting each record to an [`EventFacility`]
pub struct EventSink {
    shared: Arc<Shared>,
    driver: Mutex<Option<Driver>>,
}

impl EventSink {
    /// Open the configured facility and start a dedicated writer thread
    pub fn new(config: EventSinkConfig) -> Result<Self, DispatcherError> {
        let facility = open_facility(&config.facility);
        Self::with_facility(config, facility)
    }

    /// Use `facility` with a dedicated writer thread
    pub fn with_facility(
        config: EventSinkConfig,
        facility: Box<dyn EventFacility>,
    ) -> Result<Self, DispatcherError> {
        let shared = Shared::new(config, facility);
        let writer = Arc::clone(&shared);
        let worker = Worker::spawn(format!("reglog-event-{}", shared.name), move || {
            writer.writer_loop()
        })?;
        Ok(Self {
            shared,
            driver: Mutex::new(Some(Driver::Thread(worker))),
        })
    }

    /// Use `facility`, draining from a recurring task on `scheduler`
    pub fn with_scheduler(
        config: EventSinkConfig,
        facility: Box<dyn EventFacility>,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> Self {
        let shared = Shared::new(config, facility);
        let task_shared = Arc::clone(&shared);
        let id = scheduler.schedule_recurring(
            shared.config.poll_interval(),
            Arc::new(move || task_shared.run_scheduled()),
        );
        debug!(sink = %shared.name, task = id, "EventSink scheduled");
        Self {
            shared,
            driver: Mutex::new(Some(Driver::Scheduled { scheduler, id })),
        }
    }

    pub fn config(&self) -> &EventSinkConfig {
        &self.shared.config
    }

    /// Entries queued or being delivered
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().pending()
    }

    pub fn is_registered(&self) -> bool {
        self.shared.facility.lock().is_registered()
    }
}

impl LogSink for EventSink {
    fn name(&self) -> &str {
        &self.shared.name
    }

    #[instrument(
        name = "event_sink_consume",
        skip(self, batch),
        fields(sink = %self.shared.name, records = batch.len())
    )]
    fn consume(&self, batch: &[LogRecord]) -> Result<(), ContractError> {
        self.shared.enqueue(batch);
        Ok(())
    }

    #[instrument(name = "event_sink_flush", skip(self), fields(sink = %self.shared.name))]
    fn flush(&self) -> FlushOutcome {
        self.shared.flush()
    }

    #[instrument(name = "event_sink_close", skip(self), fields(sink = %self.shared.name))]
    fn close(&self) -> CloseOutcome {
        let Some(driver) = self.driver.lock().take() else {
            return CloseOutcome::AlreadyClosed;
        };

        let timeout = self.shared.config.close_timeout();
        let deadline = Instant::now() + timeout;
        {
            let mut queue = self.shared.queue.lock();
            queue.stop = true;
            queue.closed = true;
        }
        self.shared.wake.notify_all();

        let outcome = match driver {
            Driver::Thread(worker) => match worker.join_timeout(timeout) {
                JoinOutcome::Joined => CloseOutcome::Closed,
                JoinOutcome::Detached => CloseOutcome::Detached {
                    abandoned: self.shared.abandon_queue(),
                },
            },
            Driver::Scheduled { scheduler, id } => {
                scheduler.cancel_recurring(id);
                self.shared.drain_until(deadline)
            }
        };

        if let Some(mut facility) = self.shared.facility.try_lock() {
            facility.deregister();
        }
        info!(sink = %self.shared.name, outcome = ?outcome, "EventSink closed");
        outcome
    }

    fn stats(&self) -> SinkStats {
        self.shared.metrics.set_queued(self.pending());
        self.shared.metrics.snapshot(&self.shared.name)
    }
}

impl Drop for EventSink {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn new(config: EventSinkConfig, mut facility: Box<dyn EventFacility>) -> Arc<Self> {
        // A failed registration leaves the sink usable; sends retry it
        match facility.register(&config.source_name) {
            Ok(()) => info!(
                sink = %config.name,
                facility = %facility.describe(),
                source = %config.source_name,
                "EventSink registered"
            ),
            Err(e) => warn!(
                sink = %config.name,
                facility = %facility.describe(),
                error = %e,
                "Event source registration failed, starting degraded"
            ),
        }

        Arc::new(Self {
            name: config.name.clone(),
            facility: Mutex::new(facility),
            queue: Mutex::new(EventQueue {
                entries: VecDeque::new(),
                bytes: 0,
                sending: 0,
                flush_requested: false,
                stop: false,
                closed: false,
            }),
            wake: Condvar::new(),
            idle: Condvar::new(),
            run_guard: Mutex::new(()),
            metrics: SinkMetrics::new(),
            config,
        })
    }

    fn enqueue(&self, batch: &[LogRecord]) {
        let max_payload = self.config.max_payload_bytes;
        let mut truncated = 0usize;
        let entries: Vec<EventEntry> = batch
            .iter()
            .map(|record| {
                let (payload, cut) = prepare_payload(record, max_payload);
                if cut {
                    truncated += 1;
                }
                EventEntry {
                    severity: EventSeverity::from(record.level()),
                    payload,
                }
            })
            .collect();

        let mut queue = self.queue.lock();
        if queue.closed {
            drop(queue);
            self.metrics.add_dropped(batch.len() as u64);
            debug!(sink = %self.name, records = batch.len(), "Batch dropped, sink closed");
            return;
        }

        let mut evicted: u64 = 0;
        for entry in entries {
            while queue.entries.len() >= self.config.max_queue_count
                || queue.bytes + entry.payload.len() > self.config.max_queue_bytes
            {
                match queue.entries.pop_front() {
                    Some(old) => {
                        queue.bytes -= old.payload.len();
                        evicted += 1;
                    }
                    None => break,
                }
            }
            queue.bytes += entry.payload.len();
            queue.entries.push_back(entry);
        }
        self.metrics.set_queued(queue.pending());
        drop(queue);
        self.wake.notify_one();

        if truncated > 0 {
            debug!(sink = %self.name, truncated, "Oversized payloads truncated");
        }
        if evicted > 0 {
            self.metrics.add_dropped(evicted);
            warn!(sink = %self.name, evicted, "Event queue full, oldest entries evicted");
        }
    }

    fn flush(&self) -> FlushOutcome {
        let deadline = Instant::now() + self.config.flush_timeout();
        let mut queue = self.queue.lock();
        if queue.pending() == 0 {
            return FlushOutcome::Completed;
        }

        queue.flush_requested = true;
        self.wake.notify_one();
        self.idle
            .wait_while_for(&mut queue, |q| q.pending() > 0, remaining(deadline));
        if queue.pending() == 0 {
            FlushOutcome::Completed
        } else {
            warn!(
                sink = %self.name,
                pending = queue.pending(),
                timeout_ms = self.config.flush_timeout_ms,
                "EventSink flush timed out"
            );
            FlushOutcome::TimedOut
        }
    }

    #[instrument(name = "event_sink_writer_loop", skip(self), fields(sink = %self.name))]
    fn writer_loop(&self) {
        debug!(sink = %self.name, "Writer started");
        let interval = self.config.poll_interval();
        loop {
            {
                let mut queue = self.queue.lock();
                self.wake.wait_while_for(
                    &mut queue,
                    |q| q.entries.is_empty() && !q.stop && !q.flush_requested,
                    interval,
                );
                if queue.entries.is_empty() && queue.stop {
                    break;
                }
            }
            let _guard = self.run_guard.lock();
            self.drain_pass();
        }
        self.idle.notify_all();
        debug!(sink = %self.name, "Writer stopped");
    }

    /// One scheduler tick: drain everything queued unless a run is active
    fn run_scheduled(&self) {
        let Some(_guard) = self.run_guard.try_lock() else {
            return;
        };
        while self.drain_pass() > 0 {}
    }

    /// Deliver up to `batch_size` entries; returns how many were taken
    fn drain_pass(&self) -> usize {
        let batch: Vec<EventEntry> = {
            let mut queue = self.queue.lock();
            queue.flush_requested = false;
            let n = queue.entries.len().min(self.config.batch_size.max(1));
            let batch: Vec<EventEntry> = queue.entries.drain(..n).collect();
            queue.bytes -= batch.iter().map(|e| e.payload.len()).sum::<usize>();
            queue.sending = batch.len();
            batch
        };

        let send_interval = self.config.send_interval();
        for (index, entry) in batch.iter().enumerate() {
            if index > 0 && !send_interval.is_zero() {
                thread::sleep(send_interval);
            }
            self.deliver(entry);
        }

        let mut queue = self.queue.lock();
        queue.sending = 0;
        self.metrics.set_queued(queue.pending());
        if queue.pending() == 0 {
            self.idle.notify_all();
        }
        batch.len()
    }

    /// Report one entry, retrying transient failures with doubling backoff
    fn deliver(&self, entry: &EventEntry) {
        let attempts = self.config.max_attempts.max(1);
        let mut backoff = self.config.retry_backoff();

        for attempt in 1..=attempts {
            let error = match self.report(entry) {
                Ok(()) => {
                    self.metrics.add_written(1);
                    return;
                }
                Err(e) => e,
            };
            self.metrics.inc_failures();

            if error.is_fatal() {
                self.metrics.add_dropped(1);
                warn!(sink = %self.name, error = %error, "Fatal facility error, record dropped");
                return;
            }
            if attempt == attempts {
                self.metrics.add_dropped(1);
                warn!(
                    sink = %self.name,
                    attempts,
                    error = %error,
                    "Delivery retries exhausted, record dropped"
                );
                return;
            }

            debug!(sink = %self.name, attempt, error = %error, "Transient facility error, retrying");
            thread::sleep(backoff);
            backoff = backoff.saturating_mul(2);
            self.reacquire();
        }
    }

    fn report(&self, entry: &EventEntry) -> Result<(), FacilityError> {
        let mut facility = self.facility.lock();
        if !facility.is_registered() {
            facility.register(&self.config.source_name)?;
        }
        facility.report(entry.severity, &entry.payload)
    }

    /// Drop the facility handle and register again
    fn reacquire(&self) {
        let mut facility = self.facility.lock();
        facility.deregister();
        if let Err(e) = facility.register(&self.config.source_name) {
            debug!(sink = %self.name, error = %e, "Re-registration failed");
        }
    }

    /// Discard whatever is still queued; returns entries left undelivered
    fn abandon_queue(&self) -> usize {
        let mut queue = self.queue.lock();
        let abandoned = queue.entries.len();
        queue.entries.clear();
        queue.bytes = 0;
        self.metrics.add_dropped(abandoned as u64);
        abandoned + queue.sending
    }

    /// Drain under the calling thread until empty or `deadline`
    fn drain_until(&self, deadline: Instant) -> CloseOutcome {
        loop {
            if Instant::now() >= deadline {
                return CloseOutcome::Detached {
                    abandoned: self.abandon_queue(),
                };
            }
            match self.run_guard.try_lock() {
                Some(_guard) => {
                    if self.drain_pass() == 0 {
                        return CloseOutcome::Closed;
                    }
                }
                // A scheduled run is still in progress
                None => thread::sleep(Duration::from_millis(5)),
            }
        }
    }
}
