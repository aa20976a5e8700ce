//! FileSink - NDJSON lines appended to a rotating file
//!
//! `consume` serializes each record and queues the line under a byte
//! ceiling of ten times the flush threshold, evicting the oldest lines when
//! full. A dedicated writer thread drains the queue into a buffer of up to
//! `flush_threshold_bytes`, appends it to the active file, rotates the file
//! past `max_file_bytes` and applies retention to the archives.

mod rotation;

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use contracts::{
    CloseOutcome, ContractError, FileSinkConfig, FlushOutcome, LogRecord, LogSink, SinkStats,
};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::error::DispatcherError;
use crate::metrics::SinkMetrics;
use crate::worker::{remaining, JoinOutcome, Worker};

use self::rotation::{is_fatal, ActiveFile, WriteError, WriteReport};

/// Minimum spacing of durability syncs outside an explicit flush
const SYNC_INTERVAL: Duration = Duration::from_secs(1);

struct LineQueue {
    lines: VecDeque<String>,
    bytes: usize,
    /// Lines taken by the writer and not yet written or dropped
    writing: usize,
    flush_requested: bool,
    stop: bool,
    closed: bool,
}

impl LineQueue {
    fn pending(&self) -> usize {
        self.lines.len() + self.writing
    }
}

#[derive(Default)]
struct SyncState {
    last: Option<Instant>,
    /// Data written since the last sync
    unsynced: bool,
}

/// Lines fully contained in `written`; every queued line ends in `\n`
fn complete_lines(written: &[u8]) -> usize {
    written.iter().filter(|&&b| b == b'\n').count()
}

struct Shared {
    name: String,
    config: FileSinkConfig,
    queue: Mutex<LineQueue>,
    /// Writer waits here for lines, flush or stop
    wake: Condvar,
    /// Flush waiters wait here for an empty queue
    idle: Condvar,
    file: Mutex<ActiveFile>,
    metrics: SinkMetrics,
}

/// Sink writing NDJSON lines to `<directory>/<base_name>.log`
pub struct FileSink {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl FileSink {
    /// Open the active file and start the writer thread
    #[instrument(name = "file_sink_new", skip(config), fields(sink = %config.name))]
    pub fn new(config: FileSinkConfig) -> Result<Self, DispatcherError> {
        let active = ActiveFile::open(&config);
        Self::start(config, active)
    }

    #[cfg(test)]
    fn with_opener(
        config: FileSinkConfig,
        opener: rotation::Opener,
    ) -> Result<Self, DispatcherError> {
        let active = ActiveFile::with_opener(&config, opener);
        Self::start(config, active)
    }

    fn start(config: FileSinkConfig, active: io::Result<ActiveFile>) -> Result<Self, DispatcherError> {
        let active = active.map_err(|e| {
            DispatcherError::sink_creation(
                &config.name,
                format!("cannot open {}: {e}", config.active_path().display()),
            )
        })?;

        info!(
            sink = %config.name,
            path = %active.path().display(),
            resumed_bytes = active.bytes(),
            "FileSink opened"
        );

        let shared = Arc::new(Shared {
            name: config.name.clone(),
            queue: Mutex::new(LineQueue {
                lines: VecDeque::new(),
                bytes: 0,
                writing: 0,
                flush_requested: false,
                stop: false,
                closed: false,
            }),
            wake: Condvar::new(),
            idle: Condvar::new(),
            file: Mutex::new(active),
            metrics: SinkMetrics::new(),
            config,
        });

        let writer = Arc::clone(&shared);
        let worker = Worker::spawn(format!("reglog-file-{}", shared.name), move || {
            writer.writer_loop()
        })?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn config(&self) -> &FileSinkConfig {
        &self.shared.config
    }

    /// Lines queued or held by the writer
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().pending()
    }

    /// Size of the active file as tracked by the writer
    pub fn active_bytes(&self) -> u64 {
        self.shared.file.lock().bytes()
    }

    pub fn metrics(&self) -> &SinkMetrics {
        &self.shared.metrics
    }
}

impl LogSink for FileSink {
    fn name(&self) -> &str {
        &self.shared.name
    }

    #[instrument(
        name = "file_sink_consume",
        skip(self, batch),
        fields(sink = %self.shared.name, records = batch.len())
    )]
    fn consume(&self, batch: &[LogRecord]) -> Result<(), ContractError> {
        self.shared.enqueue(batch);
        Ok(())
    }

    #[instrument(name = "file_sink_flush", skip(self), fields(sink = %self.shared.name))]
    fn flush(&self) -> FlushOutcome {
        self.shared.flush()
    }

    #[instrument(name = "file_sink_close", skip(self), fields(sink = %self.shared.name))]
    fn close(&self) -> CloseOutcome {
        let Some(worker) = self.worker.lock().take() else {
            return CloseOutcome::AlreadyClosed;
        };

        {
            let mut queue = self.shared.queue.lock();
            queue.stop = true;
            queue.closed = true;
        }
        self.shared.wake.notify_all();

        match worker.join_timeout(self.shared.config.close_timeout()) {
            JoinOutcome::Joined => {
                self.shared.file.lock().close();
                info!(sink = %self.shared.name, "FileSink closed");
                CloseOutcome::Closed
            }
            JoinOutcome::Detached => {
                let abandoned = self.shared.write_remaining_directly();
                warn!(sink = %self.shared.name, abandoned, "FileSink writer detached on close");
                CloseOutcome::Detached { abandoned }
            }
        }
    }

    fn stats(&self) -> SinkStats {
        self.shared.metrics.set_queued(self.pending());
        self.shared.metrics.snapshot(&self.shared.name)
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn enqueue(&self, batch: &[LogRecord]) {
        let mut lines: VecDeque<String> = batch.iter().map(LogRecord::to_ndjson_line).collect();
        let mut batch_bytes: usize = lines.iter().map(String::len).sum();
        let ceiling = self.config.memory_ceiling();
        let mut evicted: u64 = 0;

        // A batch larger than the ceiling keeps only its newest lines
        while batch_bytes > ceiling {
            match lines.pop_front() {
                Some(line) => {
                    batch_bytes -= line.len();
                    evicted += 1;
                }
                None => break,
            }
        }

        let mut queue = self.queue.lock();
        if queue.closed {
            drop(queue);
            self.metrics.add_dropped(batch.len() as u64);
            debug!(sink = %self.name, records = batch.len(), "Batch dropped, sink closed");
            return;
        }

        while queue.bytes + batch_bytes > ceiling {
            match queue.lines.pop_front() {
                Some(line) => {
                    queue.bytes -= line.len();
                    evicted += 1;
                }
                None => break,
            }
        }

        queue.bytes += batch_bytes;
        queue.lines.extend(lines);
        self.metrics.set_queued(queue.pending());
        drop(queue);
        self.wake.notify_one();

        if evicted > 0 {
            self.metrics.add_dropped(evicted);
            warn!(
                sink = %self.name,
                evicted,
                ceiling_bytes = ceiling,
                "Memory ceiling reached, oldest lines evicted"
            );
        }
    }

    fn flush(&self) -> FlushOutcome {
        let deadline = Instant::now() + self.config.flush_timeout();
        let mut queue = self.queue.lock();
        if queue.closed && queue.pending() == 0 {
            return FlushOutcome::Completed;
        }

        queue.flush_requested = true;
        self.wake.notify_one();

        self.idle.wait_while_for(
            &mut queue,
            |q| q.pending() > 0 || q.flush_requested,
            remaining(deadline),
        );
        if queue.pending() == 0 && !queue.flush_requested {
            FlushOutcome::Completed
        } else {
            warn!(
                sink = %self.name,
                pending = queue.pending(),
                timeout_ms = self.config.flush_timeout_ms,
                "FileSink flush timed out"
            );
            FlushOutcome::TimedOut
        }
    }

    #[instrument(name = "file_sink_writer_loop", skip(self), fields(sink = %self.name))]
    fn writer_loop(&self) {
        debug!(sink = %self.name, "Writer started");
        let interval = self.config.flush_interval();
        let threshold = self.config.flush_threshold_bytes;
        let mut sync = SyncState::default();

        loop {
            let (buffer, count, forced) = {
                let mut queue = self.queue.lock();
                self.wake.wait_while_for(
                    &mut queue,
                    |q| q.lines.is_empty() && !q.stop && !q.flush_requested,
                    interval,
                );

                if queue.lines.is_empty() && queue.stop && !queue.flush_requested {
                    break;
                }

                let mut buffer = String::new();
                let mut count = 0;
                while let Some(front) = queue.lines.front() {
                    if !buffer.is_empty() && buffer.len() + front.len() > threshold {
                        break;
                    }
                    if let Some(line) = queue.lines.pop_front() {
                        queue.bytes -= line.len();
                        buffer.push_str(&line);
                        count += 1;
                    }
                }
                queue.writing = count;
                let forced = std::mem::take(&mut queue.flush_requested);
                (buffer, count, forced)
            };

            if count > 0 {
                self.write_buffer(buffer.as_bytes(), count);
                sync.unsynced = true;
            }
            self.sync_if_due(&mut sync, forced);

            let mut queue = self.queue.lock();
            queue.writing = 0;
            if forced && !queue.lines.is_empty() {
                // Keep the forced sync until the backlog is written
                queue.flush_requested = true;
            }
            self.metrics.set_queued(queue.pending());
            if queue.pending() == 0 && !queue.flush_requested {
                self.idle.notify_all();
            }
        }

        self.sync_if_due(&mut sync, true);
        self.idle.notify_all();
        debug!(sink = %self.name, "Writer stopped");
    }

    /// Append one buffer of `count` lines
    ///
    /// On a transient error the file is reopened and the write retried once
    /// from where the first attempt stopped. On a fatal error the lines that
    /// did not land are dropped.
    fn write_buffer(&self, data: &[u8], count: usize) {
        let mut file = self.file.lock();

        let failed = match file.write(data) {
            Ok(report) => {
                self.record_success(&report, count);
                return;
            }
            Err(failed) => failed,
        };
        self.metrics.inc_failures();
        let landed = failed.report.bytes;
        let done = complete_lines(&data[..landed]);
        self.record_success(&failed.report, done);

        if is_fatal(&failed.error) {
            self.metrics.add_dropped((count - done) as u64);
            error!(
                sink = %self.name,
                records = count - done,
                error = %failed.error,
                "Fatal write error, buffer dropped"
            );
            return;
        }

        warn!(
            sink = %self.name,
            error = %failed.error,
            landed_bytes = landed,
            "Write failed, reopening file and retrying"
        );
        let retried = file
            .reopen()
            .map_err(|error| WriteError {
                error,
                report: WriteReport::default(),
            })
            .and_then(|()| file.write(&data[landed..]));
        match retried {
            Ok(report) => self.record_success(&report, count - done),
            Err(failed) => {
                let total = complete_lines(&data[..landed + failed.report.bytes]);
                self.record_success(&failed.report, total - done);
                self.metrics.inc_failures();
                self.metrics.add_dropped((count - total) as u64);
                error!(
                    sink = %self.name,
                    records = count - total,
                    error = %failed.error,
                    "Write retry failed, buffer dropped"
                );
            }
        }
    }

    fn record_success(&self, report: &rotation::WriteReport, count: usize) {
        self.metrics.add_written(count as u64);
        for _ in 0..report.rotations {
            self.metrics.inc_rotations();
        }
        if report.rotations > 0 {
            info!(sink = %self.name, rotations = report.rotations, "Log file rotated");
        }
    }

    /// Durability sync of written data, at most once per second unless
    /// `force` is set
    fn sync_if_due(&self, sync: &mut SyncState, force: bool) {
        if !self.config.fsync_on_flush {
            return;
        }
        let due = sync.unsynced && sync.last.is_none_or(|at| at.elapsed() >= SYNC_INTERVAL);
        if !force && !due {
            return;
        }
        if let Err(e) = self.file.lock().sync() {
            self.metrics.inc_failures();
            warn!(sink = %self.name, error = %e, "fsync failed");
        }
        sync.last = Some(Instant::now());
        sync.unsynced = false;
    }

    /// Best-effort final write under the closing thread after the writer
    /// was detached; returns the number of lines left unwritten
    fn write_remaining_directly(&self) -> usize {
        let (lines, in_writer) = {
            let mut queue = self.queue.lock();
            queue.bytes = 0;
            let lines: Vec<String> = queue.lines.drain(..).collect();
            (lines, queue.writing)
        };
        if lines.is_empty() {
            return in_writer;
        }

        let count = lines.len();
        let Some(mut file) = self.file.try_lock() else {
            // Writer is stuck inside the file; leave it be
            self.metrics.add_dropped(count as u64);
            return count + in_writer;
        };

        let buffer = lines.concat();
        match file.write(buffer.as_bytes()) {
            Ok(report) => {
                self.record_success(&report, count);
                if self.config.fsync_on_flush {
                    let _ = file.sync();
                }
                in_writer
            }
            Err(failed) => {
                let done = complete_lines(&buffer.as_bytes()[..failed.report.bytes]);
                self.record_success(&failed.report, done);
                self.metrics.inc_failures();
                self.metrics.add_dropped((count - done) as u64);
                error!(
                    sink = %self.name,
                    records = count - done,
                    error = %failed.error,
                    "Final direct write failed"
                );
                count - done + in_writer
            }
        }
    }
}
