//! Binder configuration

use crate::error::AngularError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Binder configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinderConfig {
    /// Largest JSON encoding accepted by `bind`, in bytes
    pub max_value_bytes: usize,
    /// How long `run_unit` waits for a paragraph before aborting, in milliseconds
    pub run_unit_timeout_ms: u64,
    /// Watcher dispatches allowed in one cascade before dispatch is refused
    pub max_cascade_depth: u32,
    /// Buffered change events per scope before slow subscribers lag
    pub broadcast_capacity: usize,
}

impl BinderConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With value size limit
    #[inline]
    #[must_use]
    pub fn with_max_value_bytes(mut self, bytes: usize) -> Self {
        self.max_value_bytes = bytes;
        self
    }

    /// With run-unit timeout
    #[inline]
    #[must_use]
    pub fn with_run_unit_timeout(mut self, timeout: Duration) -> Self {
        self.run_unit_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// With cascade depth limit
    #[inline]
    #[must_use]
    pub fn with_max_cascade_depth(mut self, depth: u32) -> Self {
        self.max_cascade_depth = depth;
        self
    }

    /// With broadcast buffer size
    #[inline]
    #[must_use]
    pub fn with_broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity;
        self
    }

    /// Run-unit timeout as a duration
    #[inline]
    #[must_use]
    pub fn run_unit_timeout(&self) -> Duration {
        Duration::from_millis(self.run_unit_timeout_ms)
    }

    /// Parse from TOML, filling unspecified fields with defaults
    ///
    /// # Errors
    /// - `AngularError::Config` if the TOML is malformed or a value is invalid
    pub fn from_toml_str(source: &str) -> Result<Self, AngularError> {
        let config: Self =
            toml::from_str(source).map_err(|e| AngularError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// - `AngularError::Config` naming the first invalid field
    pub fn validate(&self) -> Result<(), AngularError> {
        if self.max_value_bytes == 0 {
            return Err(AngularError::Config(
                "max_value_bytes must be greater than zero".to_string(),
            ));
        }
        if self.run_unit_timeout_ms == 0 {
            return Err(AngularError::Config(
                "run_unit_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.broadcast_capacity == 0 {
            return Err(AngularError::Config(
                "broadcast_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for BinderConfig {
    fn default() -> Self {
        Self {
            max_value_bytes: 1024 * 1024,
            run_unit_timeout_ms: 300_000,
            max_cascade_depth: 16,
            broadcast_capacity: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = BinderConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.run_unit_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn builder_methods() {
        let config = BinderConfig::new()
            .with_max_value_bytes(64)
            .with_run_unit_timeout(Duration::from_millis(250))
            .with_max_cascade_depth(2)
            .with_broadcast_capacity(8);

        assert_eq!(config.max_value_bytes, 64);
        assert_eq!(config.run_unit_timeout_ms, 250);
        assert_eq!(config.max_cascade_depth, 2);
        assert_eq!(config.broadcast_capacity, 8);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let config = BinderConfig::from_toml_str("max_cascade_depth = 4\n").unwrap();
        assert_eq!(config.max_cascade_depth, 4);
        assert_eq!(config.max_value_bytes, BinderConfig::default().max_value_bytes);
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let err = BinderConfig::from_toml_str("broadcast_capacity = 0\n").unwrap_err();
        assert!(matches!(err, AngularError::Config(_)));

        let err = BinderConfig::from_toml_str("max_cascade_depth = \"deep\"\n").unwrap_err();
        assert!(matches!(err, AngularError::Config(_)));
    }
}
