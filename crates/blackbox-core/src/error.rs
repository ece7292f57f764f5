//! Error types for Blackbox

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using BlackboxError
pub type Result<T> = std::result::Result<T, BlackboxError>;

/// Main error type for Blackbox operations
#[derive(Debug, Error)]
pub enum BlackboxError {
    /// Configuration-related errors
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    NotFound(PathBuf),

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {message}")]
    InvalidValue { field: String, message: String },

    /// Compiler executable could not be located
    #[error("Compiler '{program}' not found: {reason}")]
    CompilerNotFound { program: String, reason: String },

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// IO error
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),
}
