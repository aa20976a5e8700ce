//! CLI argument definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use contracts::LogLevel;
use std::path::PathBuf;

/// reglog - asynchronous structured logging pipeline
#[derive(Parser, Debug)]
#[command(
    name = "reglog",
    author,
    version,
    about = "Asynchronous structured logging pipeline",
    long_about = "Feeds structured change records through a bounded, policy-gated queue \n\
                  and fans them out to rotating NDJSON files, the OS event facility \n\
                  and other configured sinks."
)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true, env = "REGLOG_VERBOSE")]
    pub verbose: u8,

    /// Suppress all diagnostics except warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Diagnostic output format
    #[arg(
        long,
        value_enum,
        default_value = "pretty",
        global = true,
        env = "REGLOG_LOG_FORMAT"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the pipeline over stdin or synthetic records
    Run(RunArgs),

    /// Validate configuration file without running
    Validate(ValidateArgs),

    /// Display configuration information
    Info(InfoArgs),
}

/// Arguments for the `run` command
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Path to configuration file (TOML or JSON)
    #[arg(short, long, default_value = "reglog.toml", env = "REGLOG_CONFIG")]
    pub config: PathBuf,

    /// Generate N synthetic records instead of reading stdin
    #[arg(long, value_name = "N")]
    pub synthetic: Option<u64>,

    /// Level for stdin lines that do not carry one
    #[arg(long, value_enum, default_value = "info")]
    pub level: InputLevel,

    /// Seconds between stats reports (0 = disabled)
    #[arg(long, default_value = "5", env = "REGLOG_STATS_INTERVAL")]
    pub stats_interval: u64,

    /// Metrics server port (0 = disabled)
    #[arg(long, default_value = "0", env = "REGLOG_METRICS_PORT")]
    pub metrics_port: u16,

    /// Validate configuration and exit without running pipeline
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for the `validate` command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Path to configuration file to validate
    #[arg(short, long, default_value = "reglog.toml")]
    pub config: PathBuf,

    /// Output validation result as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `info` command
#[derive(Parser, Debug)]
pub struct InfoArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "reglog.toml")]
    pub config: PathBuf,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// Diagnostic output format
#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum LogFormat {
    /// JSON structured logging
    Json,
    /// Human-readable pretty format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
}

impl From<LogFormat> for observability::LogFormat {
    fn from(format: LogFormat) -> Self {
        match format {
            LogFormat::Json => observability::LogFormat::Json,
            LogFormat::Pretty => observability::LogFormat::Pretty,
            LogFormat::Compact => observability::LogFormat::Compact,
        }
    }
}

/// Record severity accepted on the command line
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl From<InputLevel> for LogLevel {
    fn from(level: InputLevel) -> Self {
        match level {
            InputLevel::Trace => LogLevel::Trace,
            InputLevel::Debug => LogLevel::Debug,
            InputLevel::Info => LogLevel::Info,
            InputLevel::Warn => LogLevel::Warn,
            InputLevel::Error => LogLevel::Error,
            InputLevel::Critical => LogLevel::Critical,
        }
    }
}
