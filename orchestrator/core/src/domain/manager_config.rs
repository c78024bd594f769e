// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Unit Manager Configuration
//
// Tunables for the unit manager worker:
// - transfer pool size (bounds concurrent outbound staging connections)
// - polling interval of the store
// - grace period for in-flight transfers on shutdown
// - event bus buffer size

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitManagerConfig {
    /// Maximum number of transfers executing at once
    #[serde(default = "default_transfer_pool_size")]
    pub transfer_pool_size: usize,

    /// Sleep between two iterations of the worker loop
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How long `stop()` lets in-flight transfers finish before aborting them
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,

    /// Events buffered per subscriber before the slowest one starts lagging
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

fn default_transfer_pool_size() -> usize {
    2
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(30)
}

fn default_event_bus_capacity() -> usize {
    1000
}

impl Default for UnitManagerConfig {
    fn default() -> Self {
        Self {
            transfer_pool_size: default_transfer_pool_size(),
            poll_interval: default_poll_interval(),
            shutdown_grace: default_shutdown_grace(),
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

impl UnitManagerConfig {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("UNIT_MANAGER_TRANSFER_POOL_SIZE") {
            match val.parse::<usize>() {
                Ok(size) => {
                    tracing::info!("Environment override: UNIT_MANAGER_TRANSFER_POOL_SIZE={}", size);
                    self.transfer_pool_size = size;
                }
                Err(_) => {
                    tracing::warn!(
                        "Invalid value for UNIT_MANAGER_TRANSFER_POOL_SIZE: '{}'. Expected an integer. Ignoring.",
                        val
                    );
                }
            }
        }

        if let Ok(val) = std::env::var("UNIT_MANAGER_POLL_INTERVAL_MS") {
            match val.parse::<u64>() {
                Ok(ms) => {
                    tracing::info!("Environment override: UNIT_MANAGER_POLL_INTERVAL_MS={}", ms);
                    self.poll_interval = Duration::from_millis(ms);
                }
                Err(_) => {
                    tracing::warn!(
                        "Invalid value for UNIT_MANAGER_POLL_INTERVAL_MS: '{}'. Expected milliseconds. Ignoring.",
                        val
                    );
                }
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.transfer_pool_size == 0 {
            anyhow::bail!("transfer_pool_size must be at least 1");
        }

        if self.poll_interval.is_zero() {
            anyhow::bail!("poll_interval must be greater than zero");
        }

        if self.event_bus_capacity == 0 {
            anyhow::bail!("event_bus_capacity must be at least 1");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = UnitManagerConfig::default();
        assert_eq!(config.transfer_pool_size, 2);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_with_humantime_durations() {
        let yaml = r#"
transfer_pool_size: 4
poll_interval: 250ms
shutdown_grace: 5s
"#;
        let config = UnitManagerConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.transfer_pool_size, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert_eq!(config.event_bus_capacity, 1000);
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = UnitManagerConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, UnitManagerConfig::default());
    }

    #[test]
    fn test_validation() {
        let mut config = UnitManagerConfig::default();

        config.transfer_pool_size = 0;
        assert!(config.validate().is_err());
        config.transfer_pool_size = 2;

        config.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());
        config.poll_interval = Duration::from_secs(1);

        config.event_bus_capacity = 0;
        assert!(config.validate().is_err());
    }
}
