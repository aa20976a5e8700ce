//! PipelineBuilder - assemble a running Logger and its sinks from configuration

use std::sync::Arc;

use contracts::{
    CloseOutcome, LogSink, LoggerStats, PipelineConfig, ShutdownOutcome, SinkConfig, SinkStats,
    TaskScheduler,
};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::dispatcher::Logger;
use crate::error::DispatcherError;
use crate::sinks::{open_facility, EventSink, FileSink, TraceSink};

/// Builds a [`Pipeline`] from a [`PipelineConfig`]
///
/// # Example
///
/// ```no_run
/// use contracts::{LogLevel, PipelineConfig, RecordFields};
/// use dispatcher::PipelineBuilder;
///
/// let pipeline = PipelineBuilder::from_config(&PipelineConfig::default()).build()?;
/// pipeline.logger().log(LogLevel::Info, RecordFields::new("started"));
/// let report = pipeline.shutdown();
/// assert!(report.is_clean());
/// # Ok::<(), dispatcher::DispatcherError>(())
/// ```
pub struct PipelineBuilder<'a> {
    config: &'a PipelineConfig,
    scheduler: Option<Arc<dyn TaskScheduler>>,
    extra_sinks: Vec<Arc<dyn LogSink>>,
}

impl<'a> PipelineBuilder<'a> {
    pub fn from_config(config: &'a PipelineConfig) -> Self {
        Self {
            config,
            scheduler: None,
            extra_sinks: Vec::new(),
        }
    }

    /// Scheduler for event sinks configured with `shared_scheduler`
    pub fn with_scheduler(mut self, scheduler: Arc<dyn TaskScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Register an already constructed sink after the configured ones
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.extra_sinks.push(sink);
        self
    }

    /// Create every sink, register them in configuration order and start
    /// the logger
    #[instrument(name = "pipeline_build", skip(self), fields(sinks = self.config.sinks.len()))]
    pub fn build(self) -> Result<Pipeline, DispatcherError> {
        let logger = Arc::new(Logger::new(self.config.logger.clone()));

        let mut sinks = Vec::with_capacity(self.config.sinks.len() + self.extra_sinks.len());
        for sink_config in &self.config.sinks {
            let sink = create_sink(sink_config, self.scheduler.as_ref())?;
            info!(sink = %sink.name(), kind = sink_config.kind(), "Sink created");
            sinks.push(sink);
        }
        sinks.extend(self.extra_sinks);

        for sink in &sinks {
            logger.add_sink(Arc::clone(sink));
        }
        logger.start()?;

        info!(
            sinks = sinks.len(),
            profile = ?logger.profile(),
            max_queue = self.config.logger.max_queue,
            "Pipeline started"
        );
        Ok(Pipeline { logger, sinks })
    }
}

fn create_sink(
    config: &SinkConfig,
    scheduler: Option<&Arc<dyn TaskScheduler>>,
) -> Result<Arc<dyn LogSink>, DispatcherError> {
    let sink: Arc<dyn LogSink> = match config {
        SinkConfig::File(file) => Arc::new(FileSink::new(file.clone())?),
        SinkConfig::Event(event) => match (event.shared_scheduler, scheduler) {
            (true, Some(scheduler)) => Arc::new(EventSink::with_scheduler(
                event.clone(),
                open_facility(&event.facility),
                Arc::clone(scheduler),
            )),
            (true, None) => {
                warn!(
                    sink = %event.name,
                    "No shared scheduler supplied, using a dedicated writer thread"
                );
                Arc::new(EventSink::new(event.clone())?)
            }
            (false, _) => Arc::new(EventSink::new(event.clone())?),
        },
        SinkConfig::Trace(trace) => Arc::new(TraceSink::new(trace.name.clone())),
    };
    Ok(sink)
}

/// A started logger plus the sinks it owns
pub struct Pipeline {
    logger: Arc<Logger>,
    sinks: Vec<Arc<dyn LogSink>>,
}

impl Pipeline {
    pub fn logger(&self) -> &Arc<Logger> {
        &self.logger
    }

    pub fn sink_names(&self) -> Vec<String> {
        self.sinks.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn logger_stats(&self) -> LoggerStats {
        self.logger.stats()
    }

    pub fn sink_stats(&self) -> Vec<SinkStats> {
        self.sinks.iter().map(|s| s.stats()).collect()
    }

    /// Stop the logger (draining and flushing), then close each sink
    ///
    /// Every step is bounded by its configured timeout.
    #[instrument(name = "pipeline_shutdown", skip(self))]
    pub fn shutdown(self) -> PipelineReport {
        let logger = self.logger.shutdown(true);
        let sinks: Vec<(String, CloseOutcome)> = self
            .sinks
            .iter()
            .map(|sink| (sink.name().to_string(), sink.close()))
            .collect();

        let report = PipelineReport { logger, sinks };
        if report.is_clean() {
            info!("Pipeline shut down cleanly");
        } else {
            warn!(report = ?report, "Pipeline shutdown timed out");
        }
        report
    }
}

/// What `Pipeline::shutdown` achieved
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    pub logger: ShutdownOutcome,
    pub sinks: Vec<(String, CloseOutcome)>,
}

impl PipelineReport {
    /// No step had to detach a worker
    pub fn is_clean(&self) -> bool {
        !matches!(self.logger, ShutdownOutcome::TimedOut { .. })
            && self
                .sinks
                .iter()
                .all(|(_, outcome)| !matches!(outcome, CloseOutcome::Detached { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{
        EventSinkConfig, FacilityConfig, FileSinkConfig, LogLevel, RecordFields, TraceSinkConfig,
    };

    fn config(dir: &std::path::Path) -> PipelineConfig {
        PipelineConfig {
            sinks: vec![
                SinkConfig::File(FileSinkConfig::new("file", dir.join("logs"))),
                SinkConfig::Event(EventSinkConfig {
                    shared_scheduler: true,
                    poll_interval_ms: 10,
                    send_interval_ms: 0,
                    ..EventSinkConfig::new(
                        "events",
                        FacilityConfig::File {
                            path: dir.join("events.log"),
                        },
                    )
                }),
                SinkConfig::Trace(TraceSinkConfig {
                    name: "trace".to_string(),
                }),
            ],
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_build_registers_sinks_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let pipeline = PipelineBuilder::from_config(&config).build().unwrap();

        assert_eq!(pipeline.sink_names(), ["file", "events", "trace"]);
        assert_eq!(pipeline.logger().sink_count(), 3);

        for i in 0..10 {
            pipeline
                .logger()
                .log(LogLevel::Warn, RecordFields::new(format!("record-{i}")));
        }
        assert!(pipeline.logger().flush().is_completed());

        let stats = pipeline.sink_stats();
        assert!(stats.iter().all(|s| s.written == 10));

        let report = pipeline.shutdown();
        assert!(report.is_clean());
        assert_eq!(report.logger, ShutdownOutcome::Drained);

        let file = std::fs::read_to_string(dir.path().join("logs").join("reglog.log")).unwrap();
        assert_eq!(file.lines().count(), 10);
        let events = std::fs::read_to_string(dir.path().join("events.log")).unwrap();
        assert_eq!(events.lines().count(), 10);
    }

    #[test]
    fn test_build_fails_on_unusable_directory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let config = PipelineConfig {
            sinks: vec![SinkConfig::File(FileSinkConfig::new("file", &blocker))],
            ..PipelineConfig::default()
        };
        assert!(PipelineBuilder::from_config(&config).build().is_err());
    }

    #[test]
    fn test_extra_sink_is_registered_last() {
        let config = PipelineConfig::default();
        let pipeline = PipelineBuilder::from_config(&config)
            .with_sink(Arc::new(TraceSink::new("extra")))
            .build()
            .unwrap();
        assert_eq!(pipeline.sink_names(), ["extra"]);
        pipeline.shutdown();
    }
}
