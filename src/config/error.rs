//! Configuration errors.

use thiserror::Error;

/// Errors raised while validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value is out of its allowed range.
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
}
