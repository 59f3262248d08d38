//! Logging subsystem errors.

use thiserror::Error;

/// Errors raised while installing a subscriber.
#[derive(Debug, Clone, Error)]
pub enum LoggingError {
    /// A global subscriber is already installed, or setup failed.
    #[error("failed to initialize logging: {0}")]
    InitializationFailed(String),
}
