//! LogRecord - the unit flowing from producers to sinks
//!
//! A record is immutable once captured and serializes deterministically to a
//! single NDJSON line with the field order
//! `@ts, lvl, msg?, op?, key?, val?, before?, after?, snap?, meta?, src?, pid, tid`.

use std::thread;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::LogLevel;

/// Source tag used when the producer does not supply one
pub const DEFAULT_SOURCE: &str = "ui";

/// Producer-supplied part of a record
///
/// Everything except the level; timestamp, pid and thread id are stamped by
/// the logger when the record is captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordFields {
    pub message: String,
    /// Short operation tag (e.g. `set_value`, `snapshot_create`)
    pub operation: String,
    pub key_path: String,
    pub value_name: String,
    /// Snapshot or diff before the change
    pub before: String,
    /// Snapshot or diff after the change
    pub after: String,
    pub source: String,
    pub snapshot_id: Option<String>,
    /// Opaque metadata, usually a JSON document
    pub metadata: Option<String>,
}

impl Default for RecordFields {
    fn default() -> Self {
        Self {
            message: String::new(),
            operation: String::new(),
            key_path: String::new(),
            value_name: String::new(),
            before: String::new(),
            after: String::new(),
            source: DEFAULT_SOURCE.to_string(),
            snapshot_id: None,
            metadata: None,
        }
    }
}

impl RecordFields {
    /// Fields carrying only a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    pub fn key_path(mut self, key_path: impl Into<String>) -> Self {
        self.key_path = key_path.into();
        self
    }

    pub fn value_name(mut self, value_name: impl Into<String>) -> Self {
        self.value_name = value_name.into();
        self
    }

    /// Attach the before/after diff pair
    pub fn diff(mut self, before: impl Into<String>, after: impl Into<String>) -> Self {
        self.before = before.into();
        self.after = after.into();
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn snapshot_id(mut self, snapshot_id: impl Into<String>) -> Self {
        self.snapshot_id = Some(snapshot_id.into());
        self
    }

    pub fn metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }
}

/// Immutable structured log event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    timestamp: String,
    level: LogLevel,
    fields: RecordFields,
    pid: u32,
    tid: String,
}

impl LogRecord {
    /// Capture a record for the calling thread at the current instant
    pub fn capture(level: LogLevel, fields: RecordFields) -> Self {
        Self::from_parts(
            Utc::now(),
            level,
            fields,
            std::process::id(),
            current_thread_tag(),
        )
    }

    /// Build a record with every stamp supplied by the caller
    pub fn from_parts(
        timestamp: DateTime<Utc>,
        level: LogLevel,
        fields: RecordFields,
        pid: u32,
        tid: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            level,
            fields,
            pid,
            tid: tid.into(),
        }
    }

    /// ISO-8601 UTC timestamp with millisecond precision
    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn message(&self) -> &str {
        &self.fields.message
    }

    pub fn operation(&self) -> &str {
        &self.fields.operation
    }

    pub fn key_path(&self) -> &str {
        &self.fields.key_path
    }

    pub fn value_name(&self) -> &str {
        &self.fields.value_name
    }

    pub fn before(&self) -> &str {
        &self.fields.before
    }

    pub fn after(&self) -> &str {
        &self.fields.after
    }

    pub fn source(&self) -> &str {
        &self.fields.source
    }

    pub fn snapshot_id(&self) -> Option<&str> {
        self.fields.snapshot_id.as_deref()
    }

    pub fn metadata(&self) -> Option<&str> {
        self.fields.metadata.as_deref()
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn tid(&self) -> &str {
        &self.tid
    }

    /// Serialize to one NDJSON line, including the trailing `\n`
    pub fn to_ndjson_line(&self) -> String {
        let line = NdjsonLine {
            ts: &self.timestamp,
            lvl: LEVEL_DIGITS[self.level.as_u8() as usize],
            msg: &self.fields.message,
            op: &self.fields.operation,
            key: &self.fields.key_path,
            val: &self.fields.value_name,
            before: &self.fields.before,
            after: &self.fields.after,
            snap: self.fields.snapshot_id.as_deref(),
            meta: self.fields.metadata.as_deref(),
            src: &self.fields.source,
            pid: self.pid,
            tid: &self.tid,
        };
        // Serializing borrowed strings and integers cannot fail.
        let mut out = serde_json::to_string(&line).unwrap_or_default();
        out.push('\n');
        out
    }
}

const LEVEL_DIGITS: [&str; 6] = ["0", "1", "2", "3", "4", "5"];

#[derive(Serialize)]
struct NdjsonLine<'a> {
    #[serde(rename = "@ts")]
    ts: &'a str,
    lvl: &'static str,
    #[serde(skip_serializing_if = "is_empty")]
    msg: &'a str,
    #[serde(skip_serializing_if = "is_empty")]
    op: &'a str,
    #[serde(skip_serializing_if = "is_empty")]
    key: &'a str,
    #[serde(skip_serializing_if = "is_empty")]
    val: &'a str,
    #[serde(skip_serializing_if = "is_empty")]
    before: &'a str,
    #[serde(skip_serializing_if = "is_empty")]
    after: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    snap: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    meta: Option<&'a str>,
    #[serde(skip_serializing_if = "is_empty")]
    src: &'a str,
    pid: u32,
    tid: &'a str,
}

fn is_empty(s: &&str) -> bool {
    s.is_empty()
}

fn current_thread_tag() -> String {
    let id = format!("{:?}", thread::current().id());
    id.trim_start_matches("ThreadId(")
        .trim_end_matches(')')
        .to_string()
}
