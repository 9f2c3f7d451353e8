//! Error types for configuration loading and validation.

use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum Error {
    /// A value failed validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// IO error while reading configuration files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The merged configuration could not be deserialized.
    #[error("configuration error: {0}")]
    Build(#[from] config::ConfigError),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, Error>;
