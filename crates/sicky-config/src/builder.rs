//! Configuration builder

use crate::types::{
    AdvertiseConfig, Config, ConsulConfig, MdnsConfig, ReconcileConfig, RedisConfig,
    ServiceConfig,
};
use std::collections::HashMap;

/// Builder for constructing configuration programmatically
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable the Consul backend
    pub fn consul(mut self, consul: ConsulConfig) -> Self {
        self.config.registries.consul = Some(consul);
        self
    }

    /// Enable the mDNS backend
    pub fn mdns(mut self, mdns: MdnsConfig) -> Self {
        self.config.registries.mdns = Some(mdns);
        self
    }

    /// Enable the Redis backend
    pub fn redis(mut self, redis: RedisConfig) -> Self {
        self.config.registries.redis = Some(redis);
        self
    }

    /// Set the reconciliation interval in seconds (0 disables it)
    pub fn reconcile_interval(mut self, secs: u64) -> Self {
        self.config.reconcile = ReconcileConfig {
            interval_secs: secs,
        };
        self
    }

    /// Declare a service by name
    pub fn service(mut self, name: impl Into<String>) -> Self {
        self.config.services.push(ServiceConfig {
            name: name.into(),
            kind: String::new(),
            tags: Vec::new(),
            metadata: HashMap::new(),
        });
        self
    }

    /// Advertise this process
    pub fn advertise(mut self, advertise: AdvertiseConfig) -> Self {
        self.config.advertise = Some(advertise);
        self
    }

    /// Set the log level
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.observability.log_level = level.into();
        self
    }

    /// Build the configuration
    pub fn build(self) -> sicky_core::Result<Config> {
        if let Some(ref advertise) = self.config.advertise {
            if advertise.service.is_empty() {
                return Err(sicky_core::Error::Config(
                    "advertise service is required".to_string(),
                ));
            }
        }
        Ok(self.config)
    }
}
