//! Error types for ndload

use thiserror::Error;

/// Result type alias for shared ndload operations
pub type Result<T> = std::result::Result<T, NdloadError>;

/// Main error type for configuration and shared utilities
#[derive(Error, Debug)]
pub enum NdloadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Environment variable '{0}' is not set and has no default")]
    MissingVariable(String),
}

impl NdloadError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
