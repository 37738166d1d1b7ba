//! Engine settings.
//!
//! Settings are loaded from YAML. Every field has a default, so an empty
//! document is a valid configuration.
//!
//! ```yaml
//! transaction_timeout_ms: 1500
//! poll_interval_ms: 10000
//! wakeup_queue_cap: 8
//! legacy_secure_policy: reinterview
//! ```

use std::path::Path;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How bindings read from snapshots older than the secure flag are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegacySecurePolicy {
    /// Every legacy binding is plain.
    #[default]
    AssumeInsecure,
    /// Every legacy binding is secure.
    AssumeSecure,
    /// Legacy units are interviewed again and the node information decides.
    Reinterview,
}

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Deadline for one transaction, handshake and reply included.
    pub transaction_timeout_ms: u64,
    /// How long one inbound read waits inside the poll cycle.
    pub inbound_timeout_ms: u64,
    /// Maximum inbound records handled per poll cycle.
    pub inbound_frame_budget: usize,
    /// Minimum age of a binding's last poll before it is polled again.
    pub poll_interval_ms: u64,
    /// Consecutive failures before a unit's fields are marked in error.
    pub unit_failure_threshold: u32,
    /// Consecutive link failures before the connection is rebuilt.
    pub link_failure_threshold: u32,
    /// Base delay between connection attempts.
    pub reconnect_interval_ms: u64,
    /// Random extra delay added to each reconnect.
    pub reconnect_jitter_ms: u64,
    /// Commands queued per sleeping unit before the oldest is dropped.
    pub wakeup_queue_cap: usize,
    /// Delivery attempts for a queued command before it is dropped.
    pub wakeup_max_retries: u32,
    /// Coordinator id used when the version query fails.
    pub default_controller_id: u8,
    /// Treatment of bindings from old snapshots.
    pub legacy_secure_policy: LegacySecurePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            transaction_timeout_ms: 1_000,
            inbound_timeout_ms: 10,
            inbound_frame_budget: 16,
            poll_interval_ms: 30_000,
            unit_failure_threshold: 3,
            link_failure_threshold: 5,
            reconnect_interval_ms: 5_000,
            reconnect_jitter_ms: 1_000,
            wakeup_queue_cap: 16,
            wakeup_max_retries: 3,
            default_controller_id: 1,
            legacy_secure_policy: LegacySecurePolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate settings from YAML text.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = if yaml.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load settings from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Serialize to YAML.
    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check that every setting is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transaction_timeout_ms == 0 {
            return Err(ConfigError::Invalid("transaction_timeout_ms must be > 0".into()));
        }
        if self.inbound_frame_budget == 0 {
            return Err(ConfigError::Invalid("inbound_frame_budget must be > 0".into()));
        }
        if self.unit_failure_threshold == 0 || self.link_failure_threshold == 0 {
            return Err(ConfigError::Invalid("failure thresholds must be > 0".into()));
        }
        if self.wakeup_queue_cap == 0 {
            return Err(ConfigError::Invalid("wakeup_queue_cap must be > 0".into()));
        }
        if self.default_controller_id == 0 {
            return Err(ConfigError::Invalid("default_controller_id must be a unit id".into()));
        }
        Ok(())
    }

    /// Transaction deadline.
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    /// Inbound read timeout.
    pub fn inbound_timeout(&self) -> Duration {
        Duration::from_millis(self.inbound_timeout_ms)
    }

    /// Poll freshness interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Delay before the next connection attempt, jitter included.
    pub fn reconnect_delay(&self, rng: &mut impl Rng) -> Duration {
        let jitter = if self.reconnect_jitter_ms > 0 {
            rng.gen_range(0..=self.reconnect_jitter_ms)
        } else {
            0
        };
        Duration::from_millis(self.reconnect_interval_ms + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_empty_yaml_is_default() {
        let config = EngineConfig::from_yaml_str("").expect("should parse");
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_partial_yaml() {
        let config = EngineConfig::from_yaml_str(
            "poll_interval_ms: 250\nlegacy_secure_policy: reinterview\n",
        )
        .expect("should parse");
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.legacy_secure_policy, LegacySecurePolicy::Reinterview);
        assert_eq!(config.unit_failure_threshold, 3);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            EngineConfig::from_yaml_str("wakeup_queue_cap: 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_yaml_str("poll_interval_ms: [1, 2]"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_yaml_round_trip_through_file() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("engine.yaml");
        let mut config = EngineConfig::default();
        config.wakeup_max_retries = 7;
        std::fs::write(&path, config.to_yaml_string().expect("should serialize"))
            .expect("should write");
        assert_eq!(EngineConfig::from_file(&path).expect("should load"), config);
    }

    #[test]
    fn test_reconnect_jitter_bounds() {
        let config = EngineConfig::default();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let delay = config.reconnect_delay(&mut rng);
            assert!(delay >= Duration::from_millis(5_000));
            assert!(delay <= Duration::from_millis(6_000));
        }
    }
}
