//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value failed validation.
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },

    /// `${VAR}` referenced without a default and not set.
    #[error("environment variable '{var}' not set (referenced in configuration)")]
    MissingEnvVar { var: String },

    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    ParseError(#[from] serde_saphyr::Error),

    /// I/O error reading config file.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Explicitly named config file does not exist.
    #[error("configuration file not found: {path}")]
    ConfigFileNotFound { path: PathBuf },

    /// Empty configuration file.
    #[error("configuration file is empty")]
    EmptyConfigFile,
}
