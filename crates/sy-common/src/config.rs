//! Engine configuration with TOML support
//!
//! Defaults mirror a conservative production posture: no redelivery unless
//! asked for, bounded fan-out parallelism, stream caching off.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Redelivery defaults applied to routes that do not override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedeliveryConfig {
    /// Maximum redeliveries after the first attempt. 0 disables redelivery.
    pub maximum_redeliveries: u32,
    /// Delay before the first redelivery.
    pub redelivery_delay_ms: u64,
    /// Multiplier applied per attempt when exponential backoff is enabled.
    pub backoff_multiplier: f64,
    /// Cap on any single computed delay.
    pub maximum_redelivery_delay_ms: u64,
    pub use_exponential_backoff: bool,
    /// Add up to 25% random jitter to each computed delay.
    pub use_jitter: bool,
}

impl Default for RedeliveryConfig {
    fn default() -> Self {
        Self {
            maximum_redeliveries: 0,
            redelivery_delay_ms: 1000,
            backoff_multiplier: 2.0,
            maximum_redelivery_delay_ms: 60_000,
            use_exponential_backoff: false,
            use_jitter: false,
        }
    }
}

impl RedeliveryConfig {
    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.redelivery_delay_ms)
    }

    pub fn maximum_redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.maximum_redelivery_delay_ms)
    }
}

/// Fan-out (multicast/splitter/recipient-list) defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FanOutConfig {
    /// Concurrency bound for parallel fan-out branches.
    pub max_parallel: usize,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self { max_parallel: 16 }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub redelivery: RedeliveryConfig,
    pub fanout: FanOutConfig,
    /// Buffer single-read stream bodies into re-readable form before the
    /// first stage runs.
    pub stream_caching: bool,
}

impl EngineConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.redelivery.maximum_redeliveries, 0);
        assert_eq!(config.redelivery.redelivery_delay(), Duration::from_millis(1000));
        assert_eq!(config.fanout.max_parallel, 16);
        assert!(!config.stream_caching);
    }

    #[test]
    fn test_from_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            stream_caching = true

            [redelivery]
            maximum_redeliveries = 3
            redelivery_delay_ms = 50
            use_exponential_backoff = true

            [fanout]
            max_parallel = 4
            "#,
        )
        .unwrap();

        assert!(config.stream_caching);
        assert_eq!(config.redelivery.maximum_redeliveries, 3);
        assert!(config.redelivery.use_exponential_backoff);
        assert_eq!(config.fanout.max_parallel, 4);
    }

    #[test]
    fn test_bad_toml_is_rejected() {
        let result = EngineConfig::from_toml_str("redelivery = \"nope\"");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
