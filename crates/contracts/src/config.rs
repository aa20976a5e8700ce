//! PipelineConfig - Config Loader output
//!
//! Describes the logger (queue capacity, severity floor, overflow policy) and
//! the sinks it fans out to.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::{LoggingProfile, OverflowPolicy};

/// Configuration version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConfigVersion {
    #[default]
    V1,
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Configuration version
    #[serde(default)]
    pub version: ConfigVersion,

    /// Dispatcher settings
    #[serde(default)]
    pub logger: LoggerConfig,

    /// Output routing
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
}

/// Logger (dispatcher) settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggerConfig {
    /// Queue capacity in records
    #[validate(range(min = 1))]
    pub max_queue: usize,

    /// Severity floor
    pub profile: LoggingProfile,

    /// Admission rule when the queue is full
    pub overflow_policy: OverflowPolicy,

    /// Idle wake-up interval of the dispatch loop
    #[validate(range(min = 1))]
    pub flush_interval_ms: u64,

    /// Records handed to the sinks per dispatch
    #[validate(range(min = 1))]
    pub max_batch: usize,

    /// Bound on the drain-and-join performed by shutdown
    pub shutdown_timeout_ms: u64,

    /// Bound on waiting for the queue to empty in flush
    pub flush_timeout_ms: u64,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            max_queue: 64 * 1024,
            profile: LoggingProfile::Medium,
            overflow_policy: OverflowPolicy::DropOldest,
            flush_interval_ms: 200,
            max_batch: 128,
            shutdown_timeout_ms: 5_000,
            flush_timeout_ms: 10_000,
        }
    }
}

impl LoggerConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

/// One configured sink, tagged by `type`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkConfig {
    /// Rotating NDJSON file
    File(FileSinkConfig),
    /// OS structured-event facility
    Event(EventSinkConfig),
    /// Mirror into the process `tracing` subscriber
    Trace(TraceSinkConfig),
}

impl SinkConfig {
    pub fn name(&self) -> &str {
        match self {
            SinkConfig::File(c) => &c.name,
            SinkConfig::Event(c) => &c.name,
            SinkConfig::Trace(c) => &c.name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SinkConfig::File(_) => "file",
            SinkConfig::Event(_) => "event",
            SinkConfig::Trace(_) => "trace",
        }
    }
}

/// FileSink settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct FileSinkConfig {
    /// Sink name
    #[validate(length(min = 1))]
    pub name: String,

    /// Log directory, created if missing
    pub directory: PathBuf,

    /// Active file is `<directory>/<base_name>.log`
    #[serde(default = "default_base_name")]
    #[validate(length(min = 1))]
    pub base_name: String,

    /// Rotate once the active file reaches this size
    #[serde(default = "default_max_file_bytes")]
    #[validate(range(min = 1))]
    pub max_file_bytes: u64,

    /// Archival files kept by retention
    #[serde(default = "default_rotate_count")]
    #[validate(range(min = 1))]
    pub rotate_count: usize,

    /// Writer wake-up interval
    #[serde(default = "default_file_flush_interval_ms")]
    #[validate(range(min = 1))]
    pub flush_interval_ms: u64,

    /// Writer buffer size; the in-memory ceiling is ten times this
    #[serde(default = "default_flush_threshold_bytes")]
    #[validate(range(min = 1))]
    pub flush_threshold_bytes: usize,

    /// Force data to stable storage after writes (rate limited)
    #[serde(default = "default_true")]
    pub fsync_on_flush: bool,

    #[serde(default = "default_file_flush_timeout_ms")]
    pub flush_timeout_ms: u64,

    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
}

impl FileSinkConfig {
    /// Config with defaults for everything but name and directory
    pub fn new(name: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            directory: directory.into(),
            base_name: default_base_name(),
            max_file_bytes: default_max_file_bytes(),
            rotate_count: default_rotate_count(),
            flush_interval_ms: default_file_flush_interval_ms(),
            flush_threshold_bytes: default_flush_threshold_bytes(),
            fsync_on_flush: true,
            flush_timeout_ms: default_file_flush_timeout_ms(),
            close_timeout_ms: default_close_timeout_ms(),
        }
    }

    /// Byte ceiling of the sink's in-memory queue
    pub fn memory_ceiling(&self) -> usize {
        self.flush_threshold_bytes.saturating_mul(FILE_MEMORY_MULTIPLIER)
    }

    pub fn active_path(&self) -> PathBuf {
        self.directory.join(format!("{}.log", self.base_name))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/// Multiple of `flush_threshold_bytes` bounding a file sink's queue
pub const FILE_MEMORY_MULTIPLIER: usize = 10;

/// EventSink settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EventSinkConfig {
    /// Sink name
    #[validate(length(min = 1))]
    pub name: String,

    /// Source name registered with the facility
    #[serde(default = "default_source_name")]
    #[validate(length(min = 1))]
    pub source_name: String,

    #[serde(default)]
    pub facility: FacilityConfig,

    #[serde(default = "default_max_queue_count")]
    #[validate(range(min = 1))]
    pub max_queue_count: usize,

    #[serde(default = "default_max_queue_bytes")]
    #[validate(range(min = 1))]
    pub max_queue_bytes: usize,

    /// Longer lines are truncated with a marker
    #[serde(default = "default_max_payload_bytes")]
    #[validate(range(min = 256))]
    pub max_payload_bytes: usize,

    /// Records taken per drain pass
    #[serde(default = "default_event_batch_size")]
    #[validate(range(min = 1))]
    pub batch_size: usize,

    /// Pause between two deliveries
    #[serde(default = "default_send_interval_ms")]
    pub send_interval_ms: u64,

    /// Delivery attempts per record on transient failures
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1))]
    pub max_attempts: u32,

    /// First retry delay, doubled per attempt
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Writer wake-up interval (also the scheduler period)
    #[serde(default = "default_event_poll_interval_ms")]
    #[validate(range(min = 1))]
    pub poll_interval_ms: u64,

    #[serde(default = "default_event_flush_timeout_ms")]
    pub flush_timeout_ms: u64,

    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,

    /// Run the writer on the shared scheduler instead of a dedicated thread
    #[serde(default)]
    pub shared_scheduler: bool,
}

impl EventSinkConfig {
    /// Config with defaults for everything but the name and the facility
    pub fn new(name: impl Into<String>, facility: FacilityConfig) -> Self {
        Self {
            name: name.into(),
            source_name: default_source_name(),
            facility,
            max_queue_count: default_max_queue_count(),
            max_queue_bytes: default_max_queue_bytes(),
            max_payload_bytes: default_max_payload_bytes(),
            batch_size: default_event_batch_size(),
            send_interval_ms: default_send_interval_ms(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            poll_interval_ms: default_event_poll_interval_ms(),
            flush_timeout_ms: default_event_flush_timeout_ms(),
            close_timeout_ms: default_close_timeout_ms(),
            shared_scheduler: false,
        }
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/// Which OS facility an event sink talks to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FacilityConfig {
    /// Local syslog daemon over a unix datagram socket
    Syslog {
        #[serde(default = "default_syslog_socket")]
        socket: PathBuf,
    },
    /// Append-only file, for hosts without a structured-log facility
    File { path: PathBuf },
}

impl Default for FacilityConfig {
    fn default() -> Self {
        FacilityConfig::Syslog {
            socket: default_syslog_socket(),
        }
    }
}

/// TraceSink settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TraceSinkConfig {
    #[validate(length(min = 1))]
    pub name: String,
}

fn default_true() -> bool {
    true
}

fn default_base_name() -> String {
    "reglog".to_string()
}

fn default_max_file_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_rotate_count() -> usize {
    5
}

fn default_file_flush_interval_ms() -> u64 {
    1_000
}

fn default_flush_threshold_bytes() -> usize {
    64 * 1024
}

fn default_file_flush_timeout_ms() -> u64 {
    5_000
}

fn default_close_timeout_ms() -> u64 {
    5_000
}

fn default_source_name() -> String {
    "reglog".to_string()
}

fn default_max_queue_count() -> usize {
    10_000
}

fn default_max_queue_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_max_payload_bytes() -> usize {
    61_440
}

fn default_event_batch_size() -> usize {
    64
}

fn default_send_interval_ms() -> u64 {
    1
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    50
}

fn default_event_poll_interval_ms() -> u64 {
    200
}

fn default_event_flush_timeout_ms() -> u64 {
    30_000
}

fn default_syslog_socket() -> PathBuf {
    PathBuf::from("/dev/log")
}
