//! Fabric configuration

use std::time::Duration;

use ferrybus_router::ChannelConfig;
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Delay before a leaf reconnects to the hub
    pub reconnect_interval_ms: u64,
    /// Undeliverable packets held per context before the oldest is dropped
    pub max_backlog: usize,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: 500,
            max_backlog: 256,
        }
    }
}

impl FabricConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: FabricConfig =
            toml::from_str(text).map_err(|e| ClientError::Config(e.to_string()))?;
        if config.max_backlog == 0 {
            return Err(ClientError::Config("max_backlog must be at least 1".into()));
        }
        Ok(config)
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            max_backlog: self.max_backlog,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = FabricConfig::from_toml_str("reconnect_interval_ms = 50").unwrap();
        assert_eq!(config.reconnect_interval_ms, 50);
        assert_eq!(config.max_backlog, 256);
    }

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(FabricConfig::from_toml_str("").unwrap(), FabricConfig::default());
    }

    #[test]
    fn test_rejects_zero_backlog() {
        assert!(matches!(
            FabricConfig::from_toml_str("max_backlog = 0"),
            Err(ClientError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_wrong_type() {
        assert!(FabricConfig::from_toml_str("max_backlog = \"lots\"").is_err());
    }

    #[test]
    fn test_channel_config() {
        let config = FabricConfig {
            reconnect_interval_ms: 75,
            max_backlog: 8,
        };
        let channel = config.channel_config();
        assert_eq!(channel.reconnect_interval, Duration::from_millis(75));
        assert_eq!(channel.max_backlog, 8);
    }
}
