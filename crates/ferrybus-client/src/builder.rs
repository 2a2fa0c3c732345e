//! Fabric builder pattern

use crate::config::FabricConfig;
use crate::fabric::Fabric;

/// Builder for [`Fabric`]
#[derive(Debug, Default)]
pub struct FabricBuilder {
    config: FabricConfig,
}

impl FabricBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration
    pub fn config(mut self, config: FabricConfig) -> Self {
        self.config = config;
        self
    }

    /// Set reconnect interval in milliseconds
    pub fn reconnect_interval(mut self, ms: u64) -> Self {
        self.config.reconnect_interval_ms = ms;
        self
    }

    /// Set the undeliverable backlog bound
    pub fn max_backlog(mut self, max: usize) -> Self {
        self.config.max_backlog = max.max(1);
        self
    }

    /// Build an uninitialized fabric
    pub fn build(self) -> Fabric {
        Fabric::new(self.config)
    }
}
