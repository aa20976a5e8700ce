//! `info` command implementation.

use anyhow::{Context, Result};
use contracts::{FacilityConfig, LoggerConfig, PipelineConfig, SinkConfig};
use serde::Serialize;
use tracing::info;

use crate::cli::InfoArgs;
use crate::error::ensure_config_exists;

/// Configuration info for JSON output
#[derive(Serialize)]
struct ConfigInfo<'a> {
    version: String,
    logger: &'a LoggerConfig,
    sinks: &'a [SinkConfig],
}

/// Execute the `info` command
pub fn run_info(args: &InfoArgs) -> Result<()> {
    info!(config = %args.config.display(), "Loading configuration info");
    ensure_config_exists(&args.config)?;

    let config = config_loader::ConfigLoader::load_from_path(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    if args.json {
        let info = ConfigInfo {
            version: format!("{:?}", config.version),
            logger: &config.logger,
            sinks: &config.sinks,
        };
        let json =
            serde_json::to_string_pretty(&info).context("Failed to serialize config info")?;
        println!("{}", json);
    } else {
        print_config_info(&config);
    }

    Ok(())
}

fn print_config_info(config: &PipelineConfig) {
    let logger = &config.logger;
    println!("reglog configuration ({:?})\n", config.version);

    println!("Logger");
    println!("   ├─ Max queue: {}", logger.max_queue);
    println!("   ├─ Profile: {:?} (min level {:?})", logger.profile, logger.profile.min_level());
    println!("   ├─ Overflow policy: {:?}", logger.overflow_policy);
    println!("   ├─ Batch: {} records every {} ms", logger.max_batch, logger.flush_interval_ms);
    println!(
        "   └─ Timeouts: shutdown {} ms, flush {} ms",
        logger.shutdown_timeout_ms, logger.flush_timeout_ms
    );

    println!("\nSinks ({})", config.sinks.len());
    for (i, sink) in config.sinks.iter().enumerate() {
        let is_last = i + 1 == config.sinks.len();
        let prefix = if is_last { "└─" } else { "├─" };
        let child = if is_last { "   " } else { "│  " };

        println!("   {} {} ({})", prefix, sink.name(), sink.kind());
        match sink {
            SinkConfig::File(file) => {
                println!("   {}  ├─ Path: {}", child, file.active_path().display());
                println!(
                    "   {}  ├─ Rotation: {} bytes, keep {}",
                    child, file.max_file_bytes, file.rotate_count
                );
                println!(
                    "   {}  └─ Flush: every {} ms or {} bytes, fsync {}",
                    child, file.flush_interval_ms, file.flush_threshold_bytes, file.fsync_on_flush
                );
            }
            SinkConfig::Event(event) => {
                let facility = match &event.facility {
                    FacilityConfig::Syslog { socket } => format!("syslog {}", socket.display()),
                    FacilityConfig::File { path } => format!("file {}", path.display()),
                };
                println!("   {}  ├─ Facility: {} as '{}'", child, facility, event.source_name);
                println!(
                    "   {}  ├─ Queue: {} entries, {} bytes, payload {} bytes",
                    child, event.max_queue_count, event.max_queue_bytes, event.max_payload_bytes
                );
                println!(
                    "   {}  └─ Writer: {}",
                    child,
                    if event.shared_scheduler {
                        "shared scheduler"
                    } else {
                        "dedicated thread"
                    }
                );
            }
            SinkConfig::Trace(_) => {}
        }
    }

    println!();
}
