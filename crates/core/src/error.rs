//! Core error types

use thiserror::Error;

/// Core error type for Loomnet
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration file could not be read or parsed
    #[error("Config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
