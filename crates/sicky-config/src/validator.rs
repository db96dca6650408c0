//! Configuration validation

use crate::types::{AdvertiseConfig, Config};
use sicky_core::{Error, Result};
use std::collections::HashSet;

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    validate_registries(config)?;

    validate_services(config)?;

    if let Some(ref advertise) = config.advertise {
        validate_advertise(config, advertise)?;
    }

    Ok(())
}

fn validate_registries(config: &Config) -> Result<()> {
    if config.registries.enabled_count() == 0 {
        tracing::warn!("No registry backends configured, the pool will only hold static data");
    }

    if let Some(ref consul) = config.registries.consul {
        let url = url::Url::parse(&consul.address)
            .map_err(|e| Error::Config(format!("Invalid consul address '{}': {e}", consul.address)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "consul address must use http or https, got '{}'",
                url.scheme()
            )));
        }
        if consul.wait_time.is_zero() {
            return Err(Error::Config("consul wait_time must be > 0".to_string()));
        }
        if consul.retry_interval.is_zero() {
            return Err(Error::Config("consul retry_interval must be > 0".to_string()));
        }
    }

    if let Some(ref mdns) = config.registries.mdns {
        if mdns.protocols.is_empty() {
            return Err(Error::Config("mdns protocols cannot be empty".to_string()));
        }
        if !mdns.service_prefix.starts_with('_') {
            return Err(Error::Config(format!(
                "mdns service_prefix must start with '_', got '{}'",
                mdns.service_prefix
            )));
        }
        if !mdns.domain.ends_with('.') {
            return Err(Error::Config(format!(
                "mdns domain must be fully qualified (end with '.'), got '{}'",
                mdns.domain
            )));
        }
    }

    if let Some(ref redis) = config.registries.redis {
        if redis.address.is_empty() {
            return Err(Error::Config("redis address cannot be empty".to_string()));
        }
        if redis.pool_size == 0 {
            return Err(Error::Config("redis pool_size must be > 0".to_string()));
        }
        if redis.notify_key.is_empty() {
            return Err(Error::Config("redis notify_key cannot be empty".to_string()));
        }
        if redis.key_prefix.is_empty() {
            return Err(Error::Config("redis key_prefix cannot be empty".to_string()));
        }
    }

    Ok(())
}

fn validate_services(config: &Config) -> Result<()> {
    let mut names = HashSet::new();
    for service in &config.services {
        if service.name.is_empty() {
            return Err(Error::Config("service name cannot be empty".to_string()));
        }
        if !names.insert(service.name.as_str()) {
            return Err(Error::Config(format!(
                "Duplicate service name: {}",
                service.name
            )));
        }
    }
    Ok(())
}

fn validate_advertise(config: &Config, advertise: &AdvertiseConfig) -> Result<()> {
    if !config.services.iter().any(|s| s.name == advertise.service) {
        return Err(Error::Config(format!(
            "Advertised service '{}' is not declared in services",
            advertise.service
        )));
    }

    if advertise.address.is_empty() {
        return Err(Error::Config("advertise address cannot be empty".to_string()));
    }

    if let Some(ttl) = advertise.ttl {
        if ttl.as_secs() < 2 {
            return Err(Error::Config("advertise ttl must be at least 2s".to_string()));
        }
    }

    if advertise.servers.is_empty() {
        tracing::warn!(
            service = %advertise.service,
            "Advertised instance has no servers, mDNS will not announce it"
        );
    }

    for server in &advertise.servers {
        if server.kind.is_empty() {
            return Err(Error::Config("advertised server kind cannot be empty".to_string()));
        }
        if server.port == 0 {
            return Err(Error::Config(format!(
                "advertised {} server needs a non-zero port",
                server.kind
            )));
        }
    }

    for topic in &advertise.topics {
        if topic.name.is_empty() {
            return Err(Error::Config("advertised topic name cannot be empty".to_string()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConsulConfig, MdnsConfig, RedisConfig, ServerConfig, ServiceConfig};
    use crate::ConfigBuilder;
    use std::collections::HashMap;
    use std::time::Duration;

    fn advertise(service: &str) -> AdvertiseConfig {
        AdvertiseConfig {
            service: service.to_string(),
            id: None,
            address: "10.0.0.1".to_string(),
            network: "tcp".to_string(),
            manager_port: 0,
            check: None,
            ttl: None,
            weight: 1,
            servers: vec![ServerConfig {
                id: None,
                kind: "grpc".to_string(),
                name: "api".to_string(),
                address: None,
                port: 9000,
            }],
            topics: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = ConfigBuilder::new()
            .consul(ConsulConfig::default())
            .mdns(MdnsConfig::default())
            .redis(RedisConfig::default())
            .service("orders")
            .advertise(advertise("orders"))
            .build()
            .unwrap();

        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_invalid_consul_scheme() {
        let consul = ConsulConfig {
            address: "tcp://127.0.0.1:8500".to_string(),
            ..Default::default()
        };
        let config = ConfigBuilder::new().consul(consul).build().unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_zero_wait_time() {
        let consul = ConsulConfig {
            wait_time: Duration::ZERO,
            ..Default::default()
        };
        let config = ConfigBuilder::new().consul(consul).build().unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_redis_pool_size() {
        let redis = RedisConfig {
            pool_size: 0,
            ..Default::default()
        };
        let config = ConfigBuilder::new().redis(redis).build().unwrap();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("pool_size"));
    }

    #[test]
    fn test_mdns_empty_protocols() {
        let mdns = MdnsConfig {
            protocols: Vec::new(),
            ..Default::default()
        };
        let config = ConfigBuilder::new().mdns(mdns).build().unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_duplicate_services() {
        let mut config = ConfigBuilder::new().service("orders").build().unwrap();
        config.services.push(ServiceConfig {
            name: "orders".to_string(),
            kind: String::new(),
            tags: Vec::new(),
            metadata: HashMap::new(),
        });
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }

    #[test]
    fn test_advertise_undeclared_service() {
        let config = ConfigBuilder::new()
            .service("billing")
            .advertise(advertise("orders"))
            .build()
            .unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_advertise_server_without_port() {
        let mut ad = advertise("orders");
        ad.servers[0].port = 0;
        let config = ConfigBuilder::new()
            .service("orders")
            .advertise(ad)
            .build()
            .unwrap();
        assert!(validate_config(&config).is_err());
    }
}
