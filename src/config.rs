//! Registry Configuration
//!
//! Built in code or loaded from YAML. Every field has a default, so a config
//! file only needs to name what it overrides:
//!
//! ```yaml
//! topic: subscriptions
//! full_state_timeout_ms: 2000
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default cluster topic for registry traffic
pub const DEFAULT_TOPIC: &str = "state-registry";

/// Configuration for a state registry instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Cluster topic the registry publishes and subscribes on
    pub topic: String,
    /// How long a joining node waits for full-state responses
    pub full_state_timeout_ms: u64,
    /// Grace period before a checksum mismatch triggers a full-state request
    pub reconciliation_delay_ms: u64,
    /// Event channel capacity
    pub event_channel_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            full_state_timeout_ms: 1000,
            reconciliation_delay_ms: 500,
            event_channel_capacity: 1024,
        }
    }
}

impl RegistryConfig {
    /// Default configuration on a specific topic
    pub fn for_topic(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Default::default()
        }
    }

    pub fn full_state_timeout(&self) -> Duration {
        Duration::from_millis(self.full_state_timeout_ms)
    }

    pub fn reconciliation_delay(&self) -> Duration {
        Duration::from_millis(self.reconciliation_delay_ms)
    }

    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: RegistryConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    /// Reject configurations the registry cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(Error::Configuration("topic must not be empty".into()));
        }
        if self.full_state_timeout_ms == 0 {
            return Err(Error::Configuration(
                "full_state_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(Error::Configuration(
                "event_channel_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = RegistryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.topic, DEFAULT_TOPIC);
        assert_eq!(config.full_state_timeout(), Duration::from_secs(1));
        assert_eq!(config.reconciliation_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = RegistryConfig::from_yaml_str("topic: subscriptions\n").unwrap();
        assert_eq!(config.topic, "subscriptions");
        assert_eq!(config.full_state_timeout_ms, 1000);
        assert_eq!(config.event_channel_capacity, 1024);
    }

    #[test]
    fn test_validation_errors() {
        let config = RegistryConfig::for_topic("  ");
        assert_matches!(config.validate(), Err(Error::Configuration(_)));

        let yaml = "full_state_timeout_ms: 0\n";
        assert_matches!(RegistryConfig::from_yaml_str(yaml), Err(Error::Configuration(_)));

        let yaml = "event_channel_capacity: 0\n";
        assert_matches!(RegistryConfig::from_yaml_str(yaml), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_malformed_yaml() {
        assert_matches!(
            RegistryConfig::from_yaml_str("full_state_timeout_ms: soon\n"),
            Err(Error::ConfigParse(_))
        );
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "topic: locks").unwrap();
        writeln!(file, "reconciliation_delay_ms: 250").unwrap();

        let config = RegistryConfig::from_file(file.path()).unwrap();
        assert_eq!(config.topic, "locks");
        assert_eq!(config.reconciliation_delay(), Duration::from_millis(250));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.yaml");
        assert_matches!(RegistryConfig::from_file(missing), Err(Error::Io(_)));
    }
}
