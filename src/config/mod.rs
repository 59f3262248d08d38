//! Runtime configuration.
//!
//! Tunables consumed by channels, sync agents, and peers. Defaults match
//! the wire-contract constants; lowering the limits is safe, raising them
//! breaks interoperability with peers that enforce the defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{
    DEFAULT_SYNC_TIMEOUT, MAX_FRAME_LENGTH, MAX_QUERY_LIMIT, MAX_UNRESOLVED_COUNT,
};

mod error;

pub use error::ConfigError;

/// Protocol instance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Maximum abbreviated messages per query response.
    pub max_query_limit: usize,

    /// Unresolved-parent bound before sync falls back to a full replay.
    pub max_unresolved_count: usize,

    /// Deadline for a single sync request; an expired request resolves
    /// as an empty response rather than a ban.
    pub sync_timeout: Duration,

    /// Interval for automatic liveness probes; `None` disables them.
    pub ping_interval: Option<Duration>,

    /// Upper bound on a single length-delimited frame.
    pub max_frame_length: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_query_limit: MAX_QUERY_LIMIT,
            max_unresolved_count: MAX_UNRESOLVED_COUNT,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            ping_interval: None,
            max_frame_length: MAX_FRAME_LENGTH,
        }
    }
}

impl ProtocolConfig {
    /// Validate internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_query_limit == 0 {
            return Err(ConfigError::InvalidValue("max_query_limit must be positive".into()));
        }
        if self.max_query_limit > MAX_QUERY_LIMIT {
            return Err(ConfigError::InvalidValue(format!(
                "max_query_limit above wire bound {}",
                MAX_QUERY_LIMIT
            )));
        }
        if self.max_unresolved_count == 0 {
            return Err(ConfigError::InvalidValue(
                "max_unresolved_count must be positive".into(),
            ));
        }
        if self.sync_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("sync_timeout must be positive".into()));
        }
        if self.max_frame_length < 1024 {
            return Err(ConfigError::InvalidValue("max_frame_length too small".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ProtocolConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_limit_rejected() {
        let config = ProtocolConfig { max_query_limit: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_limit_above_wire_bound_rejected() {
        let config = ProtocolConfig {
            max_query_limit: MAX_QUERY_LIMIT + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
