//! `validate` command implementation.

use anyhow::{Context, Result};
use contracts::{FacilityConfig, OverflowPolicy, PipelineConfig, SinkConfig};
use serde::Serialize;
use tracing::info;

use crate::cli::ValidateArgs;

/// Validation result for JSON output
#[derive(Serialize)]
struct ValidationResult {
    valid: bool,
    config_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<ConfigSummary>,
}

#[derive(Serialize)]
struct ConfigSummary {
    version: String,
    max_queue: usize,
    profile: String,
    overflow_policy: String,
    file_sinks: usize,
    event_sinks: usize,
    trace_sinks: usize,
}

/// Execute the `validate` command
pub fn run_validate(args: &ValidateArgs) -> Result<()> {
    info!(config = %args.config.display(), "Validating configuration");

    let result = validate_config(args);

    if args.json {
        let json = serde_json::to_string_pretty(&result)
            .context("Failed to serialize validation result")?;
        println!("{}", json);
    } else {
        print_validation_result(&result);
    }

    if result.valid {
        Ok(())
    } else {
        anyhow::bail!("Configuration validation failed")
    }
}

fn validate_config(args: &ValidateArgs) -> ValidationResult {
    let config_path = args.config.display().to_string();

    if !args.config.exists() {
        return ValidationResult {
            valid: false,
            config_path,
            error: Some(format!("File not found: {}", args.config.display())),
            warnings: None,
            summary: None,
        };
    }

    match config_loader::ConfigLoader::load_from_path(&args.config) {
        Ok(config) => {
            let warnings = collect_warnings(&config);
            let count = |kind: &str| config.sinks.iter().filter(|s| s.kind() == kind).count();

            ValidationResult {
                valid: true,
                config_path,
                error: None,
                warnings: if warnings.is_empty() {
                    None
                } else {
                    Some(warnings)
                },
                summary: Some(ConfigSummary {
                    version: format!("{:?}", config.version),
                    max_queue: config.logger.max_queue,
                    profile: format!("{:?}", config.logger.profile),
                    overflow_policy: format!("{:?}", config.logger.overflow_policy),
                    file_sinks: count("file"),
                    event_sinks: count("event"),
                    trace_sinks: count("trace"),
                }),
            }
        }
        Err(e) => ValidationResult {
            valid: false,
            config_path,
            error: Some(e.to_string()),
            warnings: None,
            summary: None,
        },
    }
}

/// Configuration warnings (non-fatal issues)
fn collect_warnings(config: &PipelineConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    if config.sinks.is_empty() {
        warnings.push("No sinks configured - records will be dispatched nowhere".to_string());
    }

    if config.logger.overflow_policy == OverflowPolicy::Block {
        warnings.push(
            "overflow_policy = block: producers wait while the queue is full".to_string(),
        );
    }

    for sink in &config.sinks {
        match sink {
            SinkConfig::File(file) if !file.fsync_on_flush => warnings.push(format!(
                "File sink '{}' has fsync_on_flush disabled - flush does not force data to disk",
                file.name
            )),
            SinkConfig::Event(event) => {
                if let FacilityConfig::Syslog { socket } = &event.facility {
                    if !socket.exists() {
                        warnings.push(format!(
                            "Event sink '{}': syslog socket {} does not exist, sink will start degraded",
                            event.name,
                            socket.display()
                        ));
                    }
                }
            }
            _ => {}
        }
    }

    warnings
}

fn print_validation_result(result: &ValidationResult) {
    if result.valid {
        println!("✓ Configuration is valid: {}", result.config_path);

        if let Some(ref summary) = result.summary {
            println!("\n  Version: {}", summary.version);
            println!("  Max queue: {}", summary.max_queue);
            println!("  Profile: {}", summary.profile);
            println!("  Overflow policy: {}", summary.overflow_policy);
            println!(
                "  Sinks: {} file, {} event, {} trace",
                summary.file_sinks, summary.event_sinks, summary.trace_sinks
            );
        }

        if let Some(ref warnings) = result.warnings {
            println!("\n⚠ Warnings:");
            for warning in warnings {
                println!("  - {}", warning);
            }
        }
    } else {
        println!("✗ Configuration is invalid: {}", result.config_path);
        if let Some(ref error) = result.error {
            println!("\n  Error: {}", error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn args(config: PathBuf) -> ValidateArgs {
        ValidateArgs {
            config,
            json: false,
        }
    }

    #[test]
    fn test_missing_file_is_invalid() {
        let result = validate_config(&args(PathBuf::from("/nonexistent/reglog.toml")));
        assert!(!result.valid);
        assert!(result.error.unwrap().contains("File not found"));
    }

    #[test]
    fn test_valid_config_summary_and_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reglog.toml");
        std::fs::write(
            &path,
            r#"
[logger]
overflow_policy = "block"

[[sinks]]
type = "file"
name = "main"
directory = "logs"
fsync_on_flush = false
"#,
        )
        .unwrap();

        let result = validate_config(&args(path));
        assert!(result.valid, "{:?}", result.error);
        let summary = result.summary.unwrap();
        assert_eq!(summary.file_sinks, 1);
        assert_eq!(summary.event_sinks, 0);
        assert_eq!(result.warnings.unwrap().len(), 2);
    }

    #[test]
    fn test_invalid_config_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reglog.toml");
        std::fs::write(&path, "[logger]\nmax_queue = 0\n").unwrap();

        let result = validate_config(&args(path));
        assert!(!result.valid);
        assert!(result.error.unwrap().contains("max_queue"));
    }
}
