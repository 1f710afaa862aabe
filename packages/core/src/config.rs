//! Store configuration
//!
//! Settings are plain serde structs with defaults so a host can load them from
//! JSON and override only what it needs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn invalid_value(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Garbage collection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct GcConfig {
    /// Keep reference counts and allow collection passes
    pub enabled: bool,
    /// Maximum records evicted per collection step
    pub step_size: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            step_size: 100,
        }
    }
}

/// Settings for one store instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct StoreConfig {
    pub gc: GcConfig,
    /// Buffered change batches per broadcast receiver
    pub event_channel_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            gc: GcConfig::default(),
            event_channel_capacity: 256,
        }
    }
}

impl StoreConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: StoreConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gc.step_size == 0 {
            return Err(ConfigError::invalid_value("gc.stepSize", "must be greater than zero"));
        }
        if self.event_channel_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "eventChannelCapacity",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Same settings with garbage collection turned off
    pub fn without_gc(mut self) -> Self {
        self.gc.enabled = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert!(config.gc.enabled);
        assert_eq!(config.gc.step_size, 100);
        assert_eq!(config.event_channel_capacity, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = StoreConfig::from_json(r#"{"gc": {"stepSize": 5}}"#).unwrap();
        assert_eq!(config.gc.step_size, 5);
        assert!(config.gc.enabled);
        assert_eq!(config.event_channel_capacity, 256);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            StoreConfig::from_json(r#"{"gc": {"stepSize": 0}}"#),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            StoreConfig::from_json(r#"{"unknown": true}"#),
            Err(ConfigError::Parse(_))
        ));
    }
}
