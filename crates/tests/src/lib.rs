//! # Integration Tests
//!
//! Cross-crate and end-to-end tests.
//!
//! Covers:
//! - Record format contract
//! - Logger + real sinks on disk (conservation, bounds, drop order, flush)
//! - Rotation, retention and event truncation observed through the sinks
//! - Configuration text to running pipeline

#[cfg(test)]
mod contract_tests {
    use contracts::{LogLevel, LogRecord, RecordFields};

    #[test]
    fn test_ndjson_field_order() {
        let record = LogRecord::capture(
            LogLevel::Warn,
            RecordFields::new("changed")
                .operation("set_value")
                .key_path("HKCU\\Software\\App")
                .value_name("Mode")
                .diff("1", "2")
                .snapshot_id("snap-1")
                .metadata("{}"),
        );
        let line = record.to_ndjson_line();
        assert!(line.ends_with('\n'));

        let keys = [
            "\"@ts\"", "\"lvl\"", "\"msg\"", "\"op\"", "\"key\"", "\"val\"", "\"before\"",
            "\"after\"", "\"snap\"", "\"meta\"", "\"src\"", "\"pid\"", "\"tid\"",
        ];
        let positions: Vec<usize> = keys.iter().map(|k| line.find(k).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{line}");
    }

    #[test]
    fn test_round_trip_escaping() {
        let message = "He said \"hi\"\nline2";
        let record = LogRecord::capture(LogLevel::Info, RecordFields::new(message));
        let line = record.to_ndjson_line();

        assert_eq!(line.matches('\n').count(), 1);
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["msg"], message);
    }
}

#[cfg(test)]
mod e2e_tests {
    use std::collections::HashMap;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use parking_lot::Mutex;

    use config_loader::{ConfigFormat, ConfigLoader};
    use contracts::{
        ContractError, EventSinkConfig, FacilityConfig, FileSinkConfig, FlushOutcome, LogLevel,
        LogRecord, LogSink, LoggerConfig, OverflowPolicy, RecordFields, ShutdownOutcome,
        SinkStats, TaskScheduler,
    };
    use dispatcher::{
        EventSink, FileFacility, FileSink, Logger, PipelineBuilder, TokioScheduler,
    };
    use observability::StatsAggregator;

    /// Keeps every record it is handed, optionally slowly
    struct CollectingSink {
        name: String,
        records: Mutex<Vec<LogRecord>>,
        delay: Duration,
    }

    impl CollectingSink {
        fn new(name: &str) -> Arc<Self> {
            Self::slow(name, Duration::ZERO)
        }

        fn slow(name: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                records: Mutex::new(Vec::new()),
                delay,
            })
        }

        fn messages(&self) -> Vec<String> {
            self.records
                .lock()
                .iter()
                .map(|r| r.message().to_string())
                .collect()
        }
    }

    impl LogSink for CollectingSink {
        fn name(&self) -> &str {
            &self.name
        }

        fn consume(&self, batch: &[LogRecord]) -> Result<(), ContractError> {
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            self.records.lock().extend_from_slice(batch);
            Ok(())
        }

        fn flush(&self) -> FlushOutcome {
            FlushOutcome::Completed
        }

        fn stats(&self) -> SinkStats {
            SinkStats {
                name: self.name.clone(),
                written: self.records.lock().len() as u64,
                ..Default::default()
            }
        }
    }

    struct FailingSink {
        panic: bool,
    }

    impl LogSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        fn consume(&self, _batch: &[LogRecord]) -> Result<(), ContractError> {
            if self.panic {
                panic!("sink exploded");
            }
            Err(ContractError::sink_write("failing", "always fails"))
        }

        fn flush(&self) -> FlushOutcome {
            FlushOutcome::Completed
        }

        fn stats(&self) -> SinkStats {
            SinkStats::default()
        }
    }

    fn file_config(dir: &Path) -> FileSinkConfig {
        FileSinkConfig {
            fsync_on_flush: false,
            flush_interval_ms: 20,
            ..FileSinkConfig::new("file", dir)
        }
    }

    fn read_messages(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                value["msg"].as_str().unwrap_or_default().to_string()
            })
            .collect()
    }

    fn archives(dir: &Path) -> Vec<PathBuf> {
        let mut found: Vec<PathBuf> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.file_name().unwrap().to_str().unwrap() != "reglog.log")
            .collect();
        found.sort();
        found
    }

    fn record(message: &str) -> LogRecord {
        LogRecord::capture(LogLevel::Info, RecordFields::new(message))
    }

    /// Block policy with sinks that never fail loses nothing, and each
    /// producer's records keep their call order
    #[test]
    fn test_block_policy_conserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Arc::new(Logger::new(LoggerConfig {
            max_queue: 16,
            max_batch: 8,
            overflow_policy: OverflowPolicy::Block,
            ..LoggerConfig::default()
        }));
        let file = Arc::new(FileSink::new(file_config(dir.path())).unwrap());
        let collector = CollectingSink::new("collector");
        logger.add_sink(file.clone());
        logger.add_sink(collector.clone());
        logger.start().unwrap();

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let logger = Arc::clone(&logger);
                thread::spawn(move || {
                    for i in 0..500 {
                        logger.log(LogLevel::Info, RecordFields::new(format!("p{p}-{i}")));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        assert_eq!(logger.shutdown(true), ShutdownOutcome::Drained);
        assert_eq!(logger.dropped_count(), 0);
        assert_eq!(logger.stats().submitted, 2000);
        assert_eq!(collector.messages().len(), 2000);
        assert_eq!(file.stats().written, 2000);

        let written = read_messages(&file.config().active_path());
        assert_eq!(written.len(), 2000);
        let mut next: HashMap<String, usize> = HashMap::new();
        for message in written {
            let (producer, index) = message.split_once('-').unwrap();
            let expected = next.entry(producer.to_string()).or_insert(0);
            assert_eq!(index.parse::<usize>().unwrap(), *expected);
            *expected += 1;
        }
    }

    /// The queue never exceeds `max_queue`, and every record is either
    /// dispatched or counted as dropped
    #[test]
    fn test_queue_stays_bounded() {
        let logger = Arc::new(Logger::new(LoggerConfig {
            max_queue: 8,
            max_batch: 4,
            overflow_policy: OverflowPolicy::DropNewest,
            ..LoggerConfig::default()
        }));
        logger.add_sink(CollectingSink::slow("slow", Duration::from_millis(2)));
        logger.start().unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let observer = {
            let logger = Arc::clone(&logger);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut max_seen = 0;
                while !done.load(Ordering::SeqCst) {
                    max_seen = max_seen.max(logger.queue_size());
                }
                max_seen
            })
        };

        for i in 0..1000 {
            logger.log(LogLevel::Info, RecordFields::new(format!("r{i}")));
            assert!(logger.queue_size() <= 8);
        }
        assert!(logger.flush().is_completed());
        done.store(true, Ordering::SeqCst);

        assert!(observer.join().unwrap() <= 8);
        let stats = logger.stats();
        assert!(stats.dropped > 0);
        assert_eq!(stats.dispatched + stats.dropped, 1000);
    }

    /// DropOldest keeps the newest suffix and counts each eviction
    #[test]
    fn test_drop_oldest_keeps_suffix() {
        let logger = Logger::new(LoggerConfig {
            max_queue: 3,
            overflow_policy: OverflowPolicy::DropOldest,
            ..LoggerConfig::default()
        });
        for message in ["A", "B", "C", "D", "E"] {
            logger.log(LogLevel::Info, RecordFields::new(message));
            assert!(logger.queue_size() <= 3);
        }
        assert_eq!(logger.queue_size(), 3);
        assert_eq!(logger.dropped_count(), 2);

        let collector = CollectingSink::new("collector");
        logger.add_sink(collector.clone());
        logger.start().unwrap();
        assert!(logger.flush().is_completed());
        assert_eq!(collector.messages(), ["C", "D", "E"]);
        logger.shutdown(false);
    }

    /// A record survives the trip through the file sink byte for byte
    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(file_config(dir.path())).unwrap();
        let message = "He said \"hi\"\nline2\u{1}";

        sink.consume(&[record(message)]).unwrap();
        assert!(sink.flush().is_completed());

        assert_eq!(read_messages(&sink.config().active_path()), [message]);
    }

    /// Writing more than `max_file_bytes` produces exactly one archive and
    /// resets the active count
    #[test]
    fn test_rotation_creates_one_archive() {
        let dir = tempfile::tempdir().unwrap();
        let line = record("rotate me");
        let len = line.to_ndjson_line().len() as u64;
        let sink = FileSink::new(FileSinkConfig {
            max_file_bytes: len - 1,
            ..file_config(dir.path())
        })
        .unwrap();

        sink.consume(&[line]).unwrap();
        assert!(sink.flush().is_completed());

        assert_eq!(archives(dir.path()).len(), 1);
        assert_eq!(sink.active_bytes(), 0);
        assert_eq!(sink.stats().rotations, 1);
    }

    /// After several rotations only the two newest archives remain
    #[test]
    fn test_retention_keeps_two_newest() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(FileSinkConfig {
            max_file_bytes: 1,
            rotate_count: 2,
            ..file_config(dir.path())
        })
        .unwrap();

        for i in 0..5 {
            sink.consume(&[record(&format!("r{i}"))]).unwrap();
            assert!(sink.flush().is_completed());
            thread::sleep(Duration::from_millis(20));
        }

        let kept = archives(dir.path());
        assert_eq!(kept.len(), 2);
        let mut messages: Vec<String> = kept.iter().flat_map(|p| read_messages(p)).collect();
        messages.sort();
        assert_eq!(messages, ["r3", "r4"]);
    }

    /// An oversized record reaches the event facility cut, marked and
    /// carrying its snapshot id
    #[test]
    fn test_event_truncation_through_logger() {
        let dir = tempfile::tempdir().unwrap();
        let events_path = dir.path().join("events.log");
        let config = EventSinkConfig {
            max_payload_bytes: 256,
            send_interval_ms: 0,
            ..EventSinkConfig::new(
                "events",
                FacilityConfig::File {
                    path: events_path.clone(),
                },
            )
        };
        let sink = Arc::new(
            EventSink::with_facility(config, Box::new(FileFacility::new(&events_path))).unwrap(),
        );

        let logger = Logger::new(LoggerConfig::default());
        logger.add_sink(sink.clone());
        logger.start().unwrap();
        logger.log(
            LogLevel::Error,
            RecordFields::new("x".repeat(2_000)).snapshot_id("snap-7"),
        );
        logger.log(LogLevel::Info, RecordFields::new("short"));
        assert!(logger.flush().is_completed());

        let content = fs::read_to_string(&events_path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(" ERROR "));
        assert!(lines[0].ends_with("...[TRUNCATED] snap=snap-7"));
        assert!(!lines[1].contains("TRUNCATED"));
        logger.shutdown(true);
    }

    /// After a completed flush nothing is pending anywhere
    #[test]
    fn test_flush_empties_every_queue() {
        let dir = tempfile::tempdir().unwrap();
        let events_path = dir.path().join("events.log");
        let file = Arc::new(FileSink::new(file_config(&dir.path().join("logs"))).unwrap());
        let events = Arc::new(
            EventSink::with_facility(
                EventSinkConfig {
                    send_interval_ms: 0,
                    ..EventSinkConfig::new(
                        "events",
                        FacilityConfig::File {
                            path: events_path.clone(),
                        },
                    )
                },
                Box::new(FileFacility::new(&events_path)),
            )
            .unwrap(),
        );

        let logger = Logger::new(LoggerConfig {
            overflow_policy: OverflowPolicy::Block,
            ..LoggerConfig::default()
        });
        logger.add_sink(file.clone());
        logger.add_sink(events.clone());
        logger.start().unwrap();

        for i in 0..500 {
            logger.log(LogLevel::Info, RecordFields::new(format!("r{i}")));
        }
        assert_eq!(logger.flush(), FlushOutcome::Completed);

        assert_eq!(logger.queue_size(), 0);
        assert_eq!(file.pending(), 0);
        assert_eq!(events.pending(), 0);
        assert_eq!(file.stats().written, 500);
        assert_eq!(events.stats().written, 500);
        logger.shutdown(true);
    }

    /// Erroring and panicking sinks do not stop delivery to a healthy one
    #[test]
    fn test_faulty_sinks_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::new(LoggerConfig::default());
        logger.add_sink(Arc::new(FailingSink { panic: false }));
        logger.add_sink(Arc::new(FailingSink { panic: true }));
        let file = Arc::new(FileSink::new(file_config(dir.path())).unwrap());
        logger.add_sink(file.clone());
        logger.start().unwrap();

        for i in 0..20 {
            logger.log(LogLevel::Info, RecordFields::new(format!("r{i}")));
        }
        logger.flush();
        assert_eq!(logger.shutdown(true), ShutdownOutcome::Drained);
        assert_eq!(read_messages(&file.config().active_path()).len(), 20);
    }

    /// TOML text all the way to files on disk
    #[test]
    fn test_config_to_running_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let toml = format!(
            r#"
[logger]
max_queue = 1024
profile = "strong"
overflow_policy = "block"

[[sinks]]
type = "file"
name = "main"
directory = "{logs}"
max_file_bytes = 8192
rotate_count = 10
fsync_on_flush = false

[[sinks]]
type = "event"
name = "events"
send_interval_ms = 0
facility = {{ kind = "file", path = "{events}" }}

[[sinks]]
type = "trace"
name = "trace"
"#,
            logs = dir.path().join("logs").display(),
            events = dir.path().join("events.log").display(),
        );
        let config = ConfigLoader::load_from_str(&toml, ConfigFormat::Toml).unwrap();
        let pipeline = PipelineBuilder::from_config(&config).build().unwrap();

        for i in 0..200 {
            pipeline
                .logger()
                .log(LogLevel::Trace, RecordFields::new(format!("trace-{i}")));
        }
        assert!(pipeline.logger().flush().is_completed());

        let mut aggregator = StatsAggregator::new();
        aggregator.update(&pipeline.logger_stats(), &pipeline.sink_stats());
        let summary = aggregator.summary();
        assert_eq!(summary.submitted, 200);
        assert!(summary.sinks.iter().all(|s| s.written == 200));

        let report = pipeline.shutdown();
        assert!(report.is_clean());

        let logs = dir.path().join("logs");
        let total: usize = fs::read_dir(&logs)
            .unwrap()
            .map(|e| read_messages(&e.unwrap().path()).len())
            .sum();
        assert_eq!(total, 200);
        assert!(!archives(&logs).is_empty());
    }

    /// Event sink driven by the tokio scheduler instead of its own thread
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shared_scheduler_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let events_path = dir.path().join("events.log");
        let scheduler = Arc::new(TokioScheduler::current().unwrap());

        let config = contracts::PipelineConfig {
            sinks: vec![contracts::SinkConfig::Event(EventSinkConfig {
                shared_scheduler: true,
                poll_interval_ms: 10,
                send_interval_ms: 0,
                ..EventSinkConfig::new(
                    "events",
                    FacilityConfig::File {
                        path: events_path.clone(),
                    },
                )
            })],
            ..contracts::PipelineConfig::default()
        };
        let pipeline = PipelineBuilder::from_config(&config)
            .with_scheduler(scheduler.clone() as Arc<dyn TaskScheduler>)
            .build()
            .unwrap();
        assert_eq!(scheduler.active(), 1);

        let report = tokio::task::spawn_blocking(move || {
            for i in 0..50 {
                pipeline
                    .logger()
                    .log(LogLevel::Warn, RecordFields::new(format!("w{i}")));
            }
            assert!(pipeline.logger().flush().is_completed());
            pipeline.shutdown()
        })
        .await
        .unwrap();

        assert!(report.is_clean());
        assert_eq!(scheduler.active(), 0);
        let content = fs::read_to_string(&events_path).unwrap();
        assert_eq!(content.lines().count(), 50);
        assert!(content.lines().all(|l| l.contains(" WARNING ")));
    }
}
