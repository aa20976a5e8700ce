//! Configuration validation
//!
//! Rules:
//! - per-field ranges (declared with `validator` derive on the config types)
//! - sink names unique
//! - no two file sinks share an active file
//! - no other log file lives inside a file sink's archive namespace
//! - event sink byte budget holds at least one full payload

use std::collections::HashSet;
use std::path::Path;

use contracts::{ContractError, FacilityConfig, PipelineConfig, SinkConfig};
use validator::{Validate, ValidationErrors};

/// Validate a PipelineConfig
///
/// Returns the first error encountered, or Ok(()).
pub fn validate(config: &PipelineConfig) -> Result<(), ContractError> {
    validate_logger(config)?;
    validate_sink_fields(config)?;
    validate_sink_names(config)?;
    validate_file_targets(config)?;
    validate_archive_namespaces(config)?;
    validate_event_budgets(config)?;
    Ok(())
}

/// Convert derive-level errors into a ContractError rooted at `prefix`
fn field_error(prefix: &str, errors: ValidationErrors) -> ContractError {
    let mut fields: Vec<_> = errors.field_errors().into_iter().collect();
    fields.sort_by(|a, b| a.0.cmp(&b.0));

    match fields.first() {
        Some((field, errs)) => {
            let message = errs
                .first()
                .map(|e| match &e.message {
                    Some(m) => m.to_string(),
                    None => format!("failed '{}' check", e.code),
                })
                .unwrap_or_else(|| "invalid value".to_string());
            ContractError::config_validation(format!("{prefix}.{field}"), message)
        }
        None => ContractError::config_validation(prefix, errors.to_string()),
    }
}

fn validate_logger(config: &PipelineConfig) -> Result<(), ContractError> {
    config
        .logger
        .validate()
        .map_err(|e| field_error("logger", e))
}

fn validate_sink_fields(config: &PipelineConfig) -> Result<(), ContractError> {
    for (index, sink) in config.sinks.iter().enumerate() {
        let prefix = format!("sinks[{index}]");
        let result = match sink {
            SinkConfig::File(c) => c.validate(),
            SinkConfig::Event(c) => c.validate(),
            SinkConfig::Trace(c) => c.validate(),
        };
        result.map_err(|e| field_error(&prefix, e))?;
    }
    Ok(())
}

/// Sink names are used as metric labels and in log fields
fn validate_sink_names(config: &PipelineConfig) -> Result<(), ContractError> {
    let mut seen = HashSet::new();
    for sink in &config.sinks {
        if !seen.insert(sink.name()) {
            return Err(ContractError::config_validation(
                format!("sinks[name={}]", sink.name()),
                "duplicate sink name",
            ));
        }
    }
    Ok(())
}

/// Two file sinks writing the same file would interleave and rotate each
/// other's archives
fn validate_file_targets(config: &PipelineConfig) -> Result<(), ContractError> {
    let mut seen = HashSet::new();
    for sink in &config.sinks {
        if let SinkConfig::File(file) = sink {
            if !seen.insert(file.active_path()) {
                return Err(ContractError::config_validation(
                    format!("sinks[{}].base_name", file.name),
                    format!(
                        "active file {} already used by another sink",
                        file.active_path().display()
                    ),
                ));
            }
        }
    }
    Ok(())
}

/// Retention treats `<base_name>.*` in the sink directory as its own
/// archives, so no other log file may be named inside that prefix
fn validate_archive_namespaces(config: &PipelineConfig) -> Result<(), ContractError> {
    let others: Vec<(&str, std::path::PathBuf)> = config
        .sinks
        .iter()
        .filter_map(|sink| match sink {
            SinkConfig::File(file) => Some((file.name.as_str(), file.active_path())),
            SinkConfig::Event(event) => match &event.facility {
                FacilityConfig::File { path } => Some((event.name.as_str(), path.clone())),
                FacilityConfig::Syslog { .. } => None,
            },
            SinkConfig::Trace(_) => None,
        })
        .collect();

    for sink in &config.sinks {
        let SinkConfig::File(file) = sink else {
            continue;
        };
        let prefix = format!("{}.", file.base_name);
        for (owner, path) in &others {
            if in_namespace(&file.directory, &prefix, path) {
                return Err(ContractError::config_validation(
                    format!("sinks[{}].base_name", file.name),
                    format!(
                        "archives named {prefix}* would match {} used by sink {owner}",
                        path.display()
                    ),
                ));
            }
        }
    }
    Ok(())
}

fn in_namespace(directory: &Path, prefix: &str, path: &Path) -> bool {
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    parent == directory
        && path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(prefix))
}

fn validate_event_budgets(config: &PipelineConfig) -> Result<(), ContractError> {
    for sink in &config.sinks {
        if let SinkConfig::Event(event) = sink {
            if event.max_queue_bytes < event.max_payload_bytes {
                return Err(ContractError::config_validation(
                    format!("sinks[{}].max_queue_bytes", event.name),
                    format!(
                        "max_queue_bytes ({}) must be >= max_payload_bytes ({})",
                        event.max_queue_bytes, event.max_payload_bytes
                    ),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{EventSinkConfig, FacilityConfig, FileSinkConfig, TraceSinkConfig};

    fn base_config() -> PipelineConfig {
        PipelineConfig {
            sinks: vec![
                SinkConfig::File(FileSinkConfig::new("audit", "logs")),
                SinkConfig::Trace(TraceSinkConfig {
                    name: "console".to_string(),
                }),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate(&base_config()).is_ok());
    }

    #[test]
    fn test_zero_queue_rejected() {
        let mut config = base_config();
        config.logger.max_queue = 0;
        let err = validate(&config).unwrap_err();
        match err {
            ContractError::ConfigValidation { field, .. } => {
                assert_eq!(field, "logger.max_queue")
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_sink_field_range_rejected() {
        let mut config = base_config();
        if let SinkConfig::File(file) = &mut config.sinks[0] {
            file.max_file_bytes = 0;
        }
        let err = validate(&config).unwrap_err();
        match err {
            ContractError::ConfigValidation { field, .. } => {
                assert_eq!(field, "sinks[0].max_file_bytes")
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_sink_name() {
        let mut config = base_config();
        config.sinks.push(SinkConfig::Trace(TraceSinkConfig {
            name: "audit".to_string(),
        }));
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("duplicate sink name"));
    }

    #[test]
    fn test_shared_active_file_rejected() {
        let mut config = base_config();
        config
            .sinks
            .push(SinkConfig::File(FileSinkConfig::new("audit2", "logs")));
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("already used"));
    }

    #[test]
    fn test_file_sink_inside_archive_namespace_rejected() {
        let mut config = base_config();
        let mut nested = FileSinkConfig::new("nested", "logs");
        nested.base_name = "reglog.audit".to_string();
        config.sinks.push(SinkConfig::File(nested));
        let err = validate(&config).unwrap_err();
        match err {
            ContractError::ConfigValidation { field, .. } => {
                assert_eq!(field, "sinks[audit].base_name")
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_event_file_inside_archive_namespace_rejected() {
        let mut config = base_config();
        config.sinks.push(SinkConfig::Event(EventSinkConfig::new(
            "events",
            FacilityConfig::File {
                path: "logs/reglog.events.log".into(),
            },
        )));
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("used by sink events"), "{err}");
    }

    #[test]
    fn test_similar_names_outside_namespace_allowed() {
        let mut config = base_config();
        let mut other = FileSinkConfig::new("other", "logs");
        other.base_name = "reglog-audit".to_string();
        config.sinks.push(SinkConfig::File(other));
        let mut elsewhere = FileSinkConfig::new("elsewhere", "archive");
        elsewhere.base_name = "reglog.old".to_string();
        config.sinks.push(SinkConfig::File(elsewhere));
        config.sinks.push(SinkConfig::Event(EventSinkConfig::new(
            "events",
            FacilityConfig::File {
                path: "reglog.events.log".into(),
            },
        )));
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_event_budget_smaller_than_payload() {
        let mut config = base_config();
        let mut event = EventSinkConfig::new("events", FacilityConfig::default());
        event.max_queue_bytes = 1024;
        config.sinks.push(SinkConfig::Event(event));
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("max_queue_bytes"));
    }
}
