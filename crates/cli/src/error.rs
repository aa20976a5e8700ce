//! Error types for CLI operations.

use std::path::Path;

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Reading producer input failed
    #[error("Failed to read input line {line}: {source}")]
    Input {
        line: u64,
        #[source]
        source: std::io::Error,
    },

    /// Pipeline did not shut down within its timeouts
    #[error("Shutdown incomplete: {message}")]
    Shutdown { message: String },
}

impl CliError {
    pub fn config_not_found(path: &Path) -> Self {
        Self::ConfigNotFound {
            path: path.display().to_string(),
        }
    }

    pub fn input(line: u64, source: std::io::Error) -> Self {
        Self::Input { line, source }
    }

    pub fn shutdown(message: impl Into<String>) -> Self {
        Self::Shutdown {
            message: message.into(),
        }
    }
}

/// Fail with `ConfigNotFound` unless `path` exists
pub fn ensure_config_exists(path: &Path) -> Result<(), CliError> {
    if path.exists() {
        Ok(())
    } else {
        Err(CliError::config_not_found(path))
    }
}
