//! `run` command implementation.

use std::io::{self, BufRead};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use contracts::{LogLevel, PipelineConfig, RecordFields, SinkConfig, TaskScheduler};
use dispatcher::{Logger, Pipeline, PipelineBuilder, PipelineReport, TokioScheduler};
use observability::{record_logger_stats, record_sink_stats, StatsAggregator};
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio::time::Interval;
use tracing::{debug, info, warn};

use crate::cli::RunArgs;
use crate::error::{ensure_config_exists, CliError};

const SYNTHETIC_OPERATIONS: [&str; 4] = ["set_value", "delete_value", "create_key", "snapshot_create"];

/// Execute the `run` command
pub async fn run_pipeline(args: &RunArgs) -> Result<()> {
    info!(config = %args.config.display(), "Loading configuration");
    ensure_config_exists(&args.config)?;

    let config = config_loader::ConfigLoader::load_from_path(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    info!(
        sinks = config.sinks.len(),
        max_queue = config.logger.max_queue,
        profile = ?config.logger.profile,
        overflow_policy = ?config.logger.overflow_policy,
        "Configuration loaded"
    );

    if args.dry_run {
        info!("Dry run mode - configuration is valid, exiting");
        print_config_summary(&config);
        return Ok(());
    }

    if args.metrics_port != 0 {
        observability::init_metrics_only(args.metrics_port)?;
    }

    let scheduler: Arc<dyn TaskScheduler> = Arc::new(TokioScheduler::current()?);
    let pipeline = PipelineBuilder::from_config(&config)
        .with_scheduler(scheduler)
        .build()
        .context("Failed to build pipeline")?;

    let stop = Arc::new(AtomicBool::new(false));
    let mut producer = spawn_producer(args, Arc::clone(pipeline.logger()), Arc::clone(&stop))?;

    let mut aggregator = StatsAggregator::new();
    let mut ticker = (args.stats_interval > 0)
        .then(|| tokio::time::interval(Duration::from_secs(args.stats_interval)));

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut producer => {
                let produced = result.context("Producer thread exited unexpectedly")??;
                info!(records = produced, "Input exhausted");
                break;
            }
            _ = tick(&mut ticker) => sample(&pipeline, &mut aggregator),
            _ = &mut shutdown => {
                warn!("Received shutdown signal, stopping pipeline...");
                stop.store(true, Ordering::Relaxed);
                break;
            }
        }
    }

    let logger = Arc::clone(pipeline.logger());
    let report = tokio::task::spawn_blocking(move || pipeline.shutdown())
        .await
        .context("Shutdown task failed")?;

    aggregator.update(&logger.stats(), &logger.sink_stats());
    println!("\n{}", aggregator.summary());
    print_report(&report);

    if !report.is_clean() {
        return Err(CliError::shutdown(format!("{:?}", report)).into());
    }
    info!("reglog finished");
    Ok(())
}

/// Feed the logger from a dedicated thread
///
/// A plain thread rather than the blocking pool: a stdin read may never
/// return, and the runtime waits for blocking-pool tasks on exit.
fn spawn_producer(
    args: &RunArgs,
    logger: Arc<Logger>,
    stop: Arc<AtomicBool>,
) -> Result<oneshot::Receiver<Result<u64, CliError>>> {
    let (tx, rx) = oneshot::channel();
    let synthetic = args.synthetic;
    let level = LogLevel::from(args.level);

    thread::Builder::new()
        .name("reglog-producer".to_string())
        .spawn(move || {
            let result = match synthetic {
                Some(count) => Ok(produce_synthetic(&logger, count, &stop)),
                None => produce_lines(io::stdin().lock(), &logger, level, &stop),
            };
            let _ = tx.send(result);
        })
        .context("Failed to spawn producer thread")?;
    Ok(rx)
}

/// One stdin line in JSON form; `level` is optional
#[derive(Deserialize)]
struct InputLine {
    #[serde(default)]
    level: Option<LogLevel>,
    #[serde(flatten)]
    fields: RecordFields,
}

/// JSON objects become records field by field; anything else is a message
fn parse_line(line: &str, default_level: LogLevel) -> (LogLevel, RecordFields) {
    let trimmed = line.trim();
    if trimmed.starts_with('{') {
        match serde_json::from_str::<InputLine>(trimmed) {
            Ok(input) => return (input.level.unwrap_or(default_level), input.fields),
            Err(e) => debug!(error = %e, "Input line is not a record object, using it as text"),
        }
    }
    (default_level, RecordFields::new(trimmed))
}

fn produce_lines<R: BufRead>(
    reader: R,
    logger: &Logger,
    default_level: LogLevel,
    stop: &AtomicBool,
) -> Result<u64, CliError> {
    let mut produced = 0;
    for (index, line) in reader.lines().enumerate() {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let line = line.map_err(|e| CliError::input(index as u64 + 1, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let (level, fields) = parse_line(&line, default_level);
        logger.log(level, fields);
        produced += 1;
    }
    Ok(produced)
}

fn produce_synthetic(logger: &Logger, count: u64, stop: &AtomicBool) -> u64 {
    for i in 0..count {
        if stop.load(Ordering::Relaxed) {
            return i;
        }
        let level = match i % 10 {
            0 => LogLevel::Warn,
            5 => LogLevel::Debug,
            9 => LogLevel::Error,
            _ => LogLevel::Info,
        };
        logger.log_with(level, || {
            let fields = RecordFields::new(format!("synthetic record {i}"))
                .operation(SYNTHETIC_OPERATIONS[(i % 4) as usize])
                .key_path(format!("HKCU\\Software\\reglog\\key{}", i % 16))
                .value_name(format!("value{}", i % 8))
                .diff(i.to_string(), (i + 1).to_string())
                .source("synthetic");
            if i % 10 == 0 {
                fields.snapshot_id(format!("snap-{}", i / 10))
            } else {
                fields
            }
        });
    }
    count
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn sample(pipeline: &Pipeline, aggregator: &mut StatsAggregator) {
    let logger = pipeline.logger_stats();
    let sinks = pipeline.sink_stats();

    record_logger_stats(&logger);
    for sink in &sinks {
        record_sink_stats(sink);
    }
    aggregator.update(&logger, &sinks);

    info!(
        submitted = logger.submitted,
        dispatched = logger.dispatched,
        dropped = logger.dropped,
        queue_len = logger.queue_len,
        "Pipeline stats"
    );
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn print_report(report: &PipelineReport) {
    println!("Shutdown: {:?}", report.logger);
    for (name, outcome) in &report.sinks {
        println!("  {name}: {outcome:?}");
    }
    println!();
}

/// Print configuration summary for dry-run mode
fn print_config_summary(config: &PipelineConfig) {
    println!("\n=== Configuration Summary ===\n");
    println!("Logger:");
    println!("  Max queue: {}", config.logger.max_queue);
    println!("  Profile: {:?}", config.logger.profile);
    println!("  Overflow policy: {:?}", config.logger.overflow_policy);
    println!("\nSinks ({}):", config.sinks.len());
    for sink in &config.sinks {
        match sink {
            SinkConfig::File(file) => {
                println!("  - {} (file) -> {}", file.name, file.active_path().display())
            }
            SinkConfig::Event(event) => {
                println!("  - {} (event) -> {:?}", event.name, event.facility)
            }
            SinkConfig::Trace(trace) => println!("  - {} (trace)", trace.name),
        }
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{LoggerConfig, OverflowPolicy};
    use dispatcher::TraceSink;
    use std::io::Cursor;

    fn logger() -> Logger {
        let logger = Logger::new(LoggerConfig {
            overflow_policy: OverflowPolicy::Block,
            ..LoggerConfig::default()
        });
        logger.add_sink(Arc::new(TraceSink::new("trace")));
        logger.start().unwrap();
        logger
    }

    #[test]
    fn test_parse_json_line() {
        let (level, fields) = parse_line(
            r#"{"level":"error","message":"boom","key_path":"HKLM\\Run","snapshot_id":"s1"}"#,
            LogLevel::Info,
        );
        assert_eq!(level, LogLevel::Error);
        assert_eq!(fields.message, "boom");
        assert_eq!(fields.key_path, "HKLM\\Run");
        assert_eq!(fields.snapshot_id.as_deref(), Some("s1"));
        assert_eq!(fields.source, "ui");
    }

    #[test]
    fn test_parse_text_line() {
        let (level, fields) = parse_line("  plain text  ", LogLevel::Warn);
        assert_eq!(level, LogLevel::Warn);
        assert_eq!(fields.message, "plain text");

        let (_, fields) = parse_line("{not json", LogLevel::Info);
        assert_eq!(fields.message, "{not json");
    }

    #[test]
    fn test_produce_lines_skips_blank() {
        let logger = logger();
        let input = Cursor::new("first\n\n{\"message\":\"second\"}\nthird\n");
        let produced = produce_lines(input, &logger, LogLevel::Info, &AtomicBool::new(false)).unwrap();
        assert_eq!(produced, 3);

        assert!(logger.flush().is_completed());
        assert_eq!(logger.stats().dispatched, 3);
    }

    #[test]
    fn test_produce_synthetic_honours_stop() {
        let logger = logger();
        assert_eq!(produce_synthetic(&logger, 50, &AtomicBool::new(false)), 50);
        assert_eq!(produce_synthetic(&logger, 50, &AtomicBool::new(true)), 0);

        logger.flush();
        // Debug records are below the default profile floor
        assert_eq!(logger.stats().submitted, 45);
    }
}
