//! Configuration types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Registry backends
    #[serde(default)]
    pub registries: RegistriesConfig,

    /// Reconciliation sweep
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Services declared up front (instances can only join declared services)
    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    /// Advertisement of this process
    #[serde(default)]
    pub advertise: Option<AdvertiseConfig>,

    /// Observability
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Registry backends; absent sections are disabled
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RegistriesConfig {
    /// Consul backend
    #[serde(default)]
    pub consul: Option<ConsulConfig>,

    /// mDNS backend
    #[serde(default)]
    pub mdns: Option<MdnsConfig>,

    /// Redis backend
    #[serde(default)]
    pub redis: Option<RedisConfig>,
}

impl RegistriesConfig {
    /// Number of enabled backends
    pub fn enabled_count(&self) -> usize {
        usize::from(self.consul.is_some())
            + usize::from(self.mdns.is_some())
            + usize::from(self.redis.is_some())
    }
}

/// Consul configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsulConfig {
    /// Consul address (default: http://127.0.0.1:8500)
    #[serde(default = "default_consul_address")]
    pub address: String,

    /// Datacenter filter
    #[serde(default)]
    pub datacenter: Option<String>,

    /// ACL token
    #[serde(default)]
    pub token: Option<String>,

    /// Maximum blocking-query wait
    #[serde(default = "default_consul_wait", with = "humantime_serde")]
    pub wait_time: Duration,

    /// Delay before retrying a failed watch request
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,
}

fn default_consul_address() -> String {
    "http://127.0.0.1:8500".to_string()
}

fn default_consul_wait() -> Duration {
    Duration::from_secs(300)
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(5)
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: default_consul_address(),
            datacenter: None,
            token: None,
            wait_time: default_consul_wait(),
            retry_interval: default_retry_interval(),
        }
    }
}

/// mDNS configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MdnsConfig {
    /// Domain (usually "local.")
    #[serde(default = "default_mdns_domain")]
    pub domain: String,

    /// Leading service-type label shared by every sicky advertisement
    #[serde(default = "default_service_prefix")]
    pub service_prefix: String,

    /// Protocol labels worth browsing for instances
    #[serde(default = "default_protocols")]
    pub protocols: Vec<String>,

    /// Keep IPv6 addresses of resolved instances.
    ///
    /// Only filters what gets registered into the pool; the daemon still
    /// queries IPv6 interfaces.
    #[serde(default = "default_enable_ipv6")]
    pub enable_ipv6: bool,
}

fn default_mdns_domain() -> String {
    "local.".to_string()
}

fn default_service_prefix() -> String {
    "_sicky".to_string()
}

fn default_protocols() -> Vec<String> {
    ["grpc", "http", "websocket", "udp"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_enable_ipv6() -> bool {
    // Prefer IPv4 addresses on macOS
    !cfg!(target_os = "macos")
}

impl Default for MdnsConfig {
    fn default() -> Self {
        Self {
            domain: default_mdns_domain(),
            service_prefix: default_service_prefix(),
            protocols: default_protocols(),
            enable_ipv6: default_enable_ipv6(),
        }
    }
}

impl MdnsConfig {
    /// Set the domain
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Enable or disable IPv6 address registration
    pub fn with_ipv6(mut self, enable: bool) -> Self {
        self.enable_ipv6 = enable;
        self
    }

    /// Meta-query type listing every advertised service type
    pub fn meta_query(&self) -> String {
        format!("_services._dns-sd._udp.{}", self.domain)
    }

    /// Full service type for a protocol/network pair
    /// (e.g. `_sicky._grpc._tcp.local.`)
    pub fn service_type(&self, protocol: &str, network: &str) -> String {
        format!(
            "{}._{}._{}.{}",
            self.service_prefix, protocol, network, self.domain
        )
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedisConfig {
    /// `host:port` of the Redis server
    #[serde(default = "default_redis_address")]
    pub address: String,

    /// Password
    #[serde(default)]
    pub password: Option<String>,

    /// Database index
    #[serde(default)]
    pub db: i64,

    /// Upper bound on concurrent requests issued by the adapter
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Pub/sub channel carrying change notices
    #[serde(default = "default_notify_key")]
    pub notify_key: String,

    /// Prefix of instance keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Expiry of instance keys (none = persistent)
    #[serde(default, with = "humantime_serde")]
    pub ttl: Option<Duration>,
}

fn default_redis_address() -> String {
    "127.0.0.1:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_notify_key() -> String {
    "sicky:notify".to_string()
}

fn default_key_prefix() -> String {
    "sicky:instance:".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            address: default_redis_address(),
            password: None,
            db: 0,
            pool_size: default_pool_size(),
            notify_key: default_notify_key(),
            key_prefix: default_key_prefix(),
            ttl: None,
        }
    }
}

impl RedisConfig {
    /// Connection URL understood by the redis client
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) if !password.is_empty() => {
                format!("redis://:{}@{}/{}", password, self.address, self.db)
            }
            _ => format!("redis://{}/{}", self.address, self.db),
        }
    }

    /// Key holding an instance
    pub fn instance_key(&self, id: &str) -> String {
        format!("{}{}", self.key_prefix, id)
    }
}

/// Reconciliation configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconcileConfig {
    /// Sweep interval in seconds (0 = disabled)
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,
}

fn default_reconcile_interval() -> u64 {
    30
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval(),
        }
    }
}

impl ReconcileConfig {
    /// Sweep interval; zero means disabled
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Declared service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    /// Service name
    pub name: String,

    /// Service kind
    #[serde(default)]
    pub kind: String,

    /// Tags
    #[serde(default)]
    pub tags: Vec<String>,

    /// Metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Advertisement of the running process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdvertiseConfig {
    /// Service this process belongs to
    pub service: String,

    /// Instance id (generated when absent)
    #[serde(default)]
    pub id: Option<String>,

    /// Advertised host
    pub address: String,

    /// Network of the instance address
    #[serde(default = "default_network")]
    pub network: String,

    /// Management port
    #[serde(default)]
    pub manager_port: u16,

    /// Health-check entry point
    #[serde(default)]
    pub check: Option<String>,

    /// Advertisement time-to-live; re-advertised every ttl/2
    #[serde(default, with = "humantime_serde")]
    pub ttl: Option<Duration>,

    /// Load-balancing weight
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Protocol servers
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Messaging topics
    #[serde(default)]
    pub topics: Vec<TopicConfig>,

    /// Metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_network() -> String {
    "tcp".to_string()
}

fn default_weight() -> u32 {
    1
}

/// Advertised protocol server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Server id (defaults to `<kind>-<port>`)
    #[serde(default)]
    pub id: Option<String>,

    /// Protocol tag
    pub kind: String,

    /// Logical name
    #[serde(default)]
    pub name: String,

    /// Advertised host (defaults to the instance address)
    #[serde(default)]
    pub address: Option<String>,

    /// Advertised port
    pub port: u16,
}

/// Advertised messaging topic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicConfig {
    /// Topic name
    pub name: String,

    /// Broker kind
    #[serde(default)]
    pub kind: String,

    /// Consumer group
    #[serde(default)]
    pub group: String,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservabilityConfig {
    /// Default log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub json_logs: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mdns_service_types() {
        let config = MdnsConfig::default();
        assert_eq!(config.meta_query(), "_services._dns-sd._udp.local.");
        assert_eq!(config.service_type("grpc", "tcp"), "_sicky._grpc._tcp.local.");
    }

    #[test]
    fn test_redis_url() {
        let mut config = RedisConfig::default();
        assert_eq!(config.url(), "redis://127.0.0.1:6379/0");

        config.password = Some("secret".to_string());
        config.db = 2;
        assert_eq!(config.url(), "redis://:secret@127.0.0.1:6379/2");
        assert_eq!(config.instance_key("a"), "sicky:instance:a");
    }

    #[test]
    fn test_reconcile_disabled() {
        let config = ReconcileConfig { interval_secs: 0 };
        assert!(config.interval().is_zero());
    }

    #[test]
    fn test_enabled_count() {
        let registries = RegistriesConfig {
            consul: Some(ConsulConfig::default()),
            mdns: None,
            redis: Some(RedisConfig::default()),
        };
        assert_eq!(registries.enabled_count(), 2);
    }
}
