//! Store configuration

use crate::identity::DEFAULT_LID_PREFIX;
use crate::{ConfigError, QuarryError, QuarryResult};
use serde::{Deserialize, Serialize};

/// Runtime configuration for a store instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Prefix of locally generated ids.
    pub lid_prefix: String,
    /// Capacity of the notification broadcast channel.
    pub notification_capacity: usize,
    /// Unknown relationship names in pushes are errors (`true`) or skipped with a warning.
    pub strict_relationships: bool,
    /// Resources of unregistered types are dropped with a warning (`true`) or rejected.
    pub drop_unknown_types: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lid_prefix: DEFAULT_LID_PREFIX.to_string(),
            notification_capacity: 256,
            strict_relationships: true,
            drop_unknown_types: true,
        }
    }
}

impl StoreConfig {
    pub fn with_lid_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.lid_prefix = prefix.into();
        self
    }

    pub fn with_notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = capacity;
        self
    }

    pub fn with_strict_relationships(mut self, strict: bool) -> Self {
        self.strict_relationships = strict;
        self
    }

    pub fn with_drop_unknown_types(mut self, drop: bool) -> Self {
        self.drop_unknown_types = drop;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> QuarryResult<()> {
        if self.lid_prefix.is_empty() {
            return Err(QuarryError::Config(ConfigError::InvalidValue {
                field: "lid_prefix".to_string(),
                value: self.lid_prefix.clone(),
                reason: "lid_prefix must not be empty".to_string(),
            }));
        }

        if self.lid_prefix.chars().any(char::is_whitespace) {
            return Err(QuarryError::Config(ConfigError::InvalidValue {
                field: "lid_prefix".to_string(),
                value: self.lid_prefix.clone(),
                reason: "lid_prefix must not contain whitespace".to_string(),
            }));
        }

        if self.notification_capacity == 0 {
            return Err(QuarryError::Config(ConfigError::InvalidValue {
                field: "notification_capacity".to_string(),
                value: self.notification_capacity.to_string(),
                reason: "notification_capacity must be greater than 0".to_string(),
            }));
        }

        Ok(())
    }

    /// Load configuration from `QUARRY_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            lid_prefix: std::env::var("QUARRY_LID_PREFIX").unwrap_or(defaults.lid_prefix),
            notification_capacity: std::env::var("QUARRY_NOTIFICATION_CAPACITY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.notification_capacity),
            strict_relationships: std::env::var("QUARRY_STRICT_RELATIONSHIPS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.strict_relationships),
            drop_unknown_types: std::env::var("QUARRY_DROP_UNKNOWN_TYPES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.drop_unknown_types),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lid_prefix, "@lid:");
        assert_eq!(config.notification_capacity, 256);
        assert!(config.strict_relationships);
        assert!(config.drop_unknown_types);
    }

    #[test]
    fn test_empty_lid_prefix_rejected() {
        let err = StoreConfig::default().with_lid_prefix("").validate().unwrap_err();
        match err {
            QuarryError::Config(ConfigError::InvalidValue { field, .. }) => {
                assert_eq!(field, "lid_prefix")
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = StoreConfig::default()
            .with_notification_capacity(0)
            .validate();
        assert!(matches!(
            result,
            Err(QuarryError::Config(ConfigError::InvalidValue { .. }))
        ));
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = StoreConfig::default()
            .with_lid_prefix("tmp:")
            .with_strict_relationships(false);
        let json = serde_json::to_string(&config).unwrap();
        let back: StoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
