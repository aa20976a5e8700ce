//! Severity, profile and admission policy enums.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Ordered record severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Critical = 5,
}

impl LogLevel {
    /// All levels, lowest first
    pub const ALL: [LogLevel; 6] = [
        LogLevel::Trace,
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
        LogLevel::Critical,
    ];

    /// Numeric severity as written in the `lvl` field
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Upper-case name used in human readable output
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static severity floor applied before a record is constructed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoggingProfile {
    /// Error and above
    Weak,
    /// Info and above
    #[default]
    Medium,
    /// Everything
    Strong,
}

impl LoggingProfile {
    /// Lowest level admitted by this profile
    pub fn min_level(self) -> LogLevel {
        match self {
            LoggingProfile::Weak => LogLevel::Error,
            LoggingProfile::Medium => LogLevel::Info,
            LoggingProfile::Strong => LogLevel::Trace,
        }
    }

    /// Whether a record at `level` passes the floor
    #[inline]
    pub fn admits(self, level: LogLevel) -> bool {
        level >= self.min_level()
    }
}

/// Rule applied when an admission would exceed the queue capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Producer waits until the dispatcher frees space
    Block,
    /// Incoming record is discarded and counted
    DropNewest,
    /// Oldest queued record is evicted and counted, incoming record admitted
    #[default]
    DropOldest,
}

/// Lifecycle shared by the logger and the sinks
///
/// `Stopped -> Running -> Draining -> Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    #[default]
    Stopped,
    Running,
    Draining,
}
