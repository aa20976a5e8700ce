//! TraceSink - forwards records to the process `tracing` subscriber

use contracts::{ContractError, FlushOutcome, LogLevel, LogRecord, LogSink, SinkStats};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::metrics::SinkMetrics;

/// Emit `$record` through the tracing macro `$level`
macro_rules! forward {
    ($level:ident, $sink:expr, $record:expr) => {
        $level!(
            sink = %$sink,
            ts = $record.timestamp(),
            op = $record.operation(),
            key = $record.key_path(),
            snap = $record.snapshot_id().unwrap_or(""),
            src = $record.source(),
            tid = $record.tid(),
            "{}",
            $record.message()
        )
    };
}

/// Sink that re-emits records as tracing events, mainly for debugging
pub struct TraceSink {
    name: String,
    metrics: SinkMetrics,
}

impl TraceSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            metrics: SinkMetrics::new(),
        }
    }

    fn emit(&self, record: &LogRecord) {
        match record.level() {
            LogLevel::Trace => forward!(trace, self.name, record),
            LogLevel::Debug => forward!(debug, self.name, record),
            LogLevel::Info => forward!(info, self.name, record),
            LogLevel::Warn => forward!(warn, self.name, record),
            LogLevel::Error | LogLevel::Critical => forward!(error, self.name, record),
        }
    }
}

impl LogSink for TraceSink {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(
        name = "trace_sink_consume",
        skip(self, batch),
        fields(sink = %self.name, records = batch.len())
    )]
    fn consume(&self, batch: &[LogRecord]) -> Result<(), ContractError> {
        for record in batch {
            self.emit(record);
        }
        self.metrics.add_written(batch.len() as u64);
        Ok(())
    }

    fn flush(&self) -> FlushOutcome {
        // Nothing buffered
        FlushOutcome::Completed
    }

    fn stats(&self) -> SinkStats {
        self.metrics.snapshot(&self.name)
    }
}
