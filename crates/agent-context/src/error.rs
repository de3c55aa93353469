//! Error types for the execution context.
//!
//! The context itself has almost no failure paths: limit checks return
//! booleans and hook errors are passed through untouched. What remains is
//! the cancelled / deadline-exceeded distinction and configuration loading.

use thiserror::Error;

/// Why a context is no longer live.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    /// The context, or one it was derived from, was cancelled explicitly.
    #[error("context cancelled")]
    Cancelled,

    /// The effective deadline has passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

impl ContextError {
    /// Whether this error came from a deadline rather than an explicit cancel
    pub fn is_deadline(&self) -> bool {
        matches!(self, ContextError::DeadlineExceeded)
    }
}

/// Errors raised while building a [`ContextConfig`](crate::ContextConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A value is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// The configuration source could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),
}

impl ConfigError {
    /// Create an invalid configuration error
    pub fn invalid(msg: impl Into<String>) -> Self {
        ConfigError::Invalid(msg.into())
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(format!("TOML error: {}", err))
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Parse(format!("YAML error: {}", err))
    }
}

/// Result type alias for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;
