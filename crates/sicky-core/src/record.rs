//! Backend-neutral advertisement record
//!
//! Every registry backend stores instances in its own native shape (Consul
//! agent services, mDNS TXT records, Redis values). [`ServiceRecord`] is the
//! common denominator: a flat id/name/address/port tuple plus string
//! metadata, with the richer instance fields encoded into well-known
//! metadata keys.

use crate::address::Address;
use crate::metadata::{self, Metadata};
use crate::types::{Instance, InstanceStatus, Server, Topic};
use std::time::Duration;
use tracing::{debug, warn};

/// Metadata key holding the JSON-encoded server list
pub const SERVERS: &str = "servers";
/// Metadata key holding the JSON-encoded topic list
pub const TOPICS: &str = "topics";
/// Metadata key holding the load-balancing weight
pub const WEIGHT: &str = "weight";
/// Metadata key holding the instance status
pub const STATUS: &str = "status";
/// Metadata key holding the management port
pub const MANAGER_PORT: &str = "manager_port";
/// Metadata key holding the health-check entry point
pub const CHECK: &str = "check";
/// Metadata key holding the advertisement ttl
pub const TTL: &str = "ttl";

const DEFAULT_NETWORK: &str = "tcp";
const DEFAULT_ADDRESS: &str = ":0";

/// Flat advertisement record exchanged with registry backends
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceRecord {
    /// Instance id
    pub id: String,
    /// Service name
    pub service: String,
    /// Backend-reported host (may be empty)
    pub address: String,
    /// Backend-reported port
    pub port: u16,
    /// Tags
    pub tags: Vec<String>,
    /// Metadata, including the encoded instance fields
    pub metadata: Metadata,
}

impl ServiceRecord {
    /// Encode an instance for advertisement
    pub fn from_instance(instance: &Instance) -> Self {
        let mut md = instance.metadata.copy();
        md.set(metadata::ID, instance.id.as_str());
        md.set(metadata::NAME, instance.service.as_str());
        md.set(WEIGHT, instance.weight.to_string());
        md.set(STATUS, instance.status.to_string());

        if instance.manager_port != 0 {
            md.set(MANAGER_PORT, instance.manager_port.to_string());
        }
        if let Some(check) = &instance.check {
            md.set(CHECK, check.as_str());
        }
        if let Some(ttl) = instance.ttl {
            md.set(TTL, humantime_serde::re::humantime::format_duration(ttl).to_string());
        }

        let (address, port) = match &instance.address {
            Some(addr) => {
                md.set(metadata::NETWORK, addr.network());
                md.set(metadata::ADDRESS, addr.to_string());
                match addr.socket_addr() {
                    Some(sock) => (sock.ip().to_string(), sock.port()),
                    None => (String::new(), 0),
                }
            }
            None => (String::new(), 0),
        };

        if !instance.servers.is_empty() {
            let mut servers: Vec<&Server> = instance.servers.values().collect();
            servers.sort_by(|a, b| a.id.cmp(&b.id));
            if let Ok(json) = serde_json::to_string(&servers) {
                md.set(SERVERS, json);
            }
        }
        if !instance.topics.is_empty() {
            let mut topics: Vec<&Topic> = instance.topics.values().collect();
            topics.sort_by(|a, b| a.name.cmp(&b.name));
            if let Ok(json) = serde_json::to_string(&topics) {
                md.set(TOPICS, json);
            }
        }

        Self {
            id: instance.id.clone(),
            service: instance.service.clone(),
            address,
            port,
            tags: instance.tags.clone(),
            metadata: md,
        }
    }

    /// Network hint, defaulting to `tcp`
    pub fn network(&self) -> &str {
        self.metadata
            .get(metadata::NETWORK)
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_NETWORK)
    }

    /// Address hint: the `address` metadata entry, else the backend's own
    /// `address:port`, else `":0"`
    pub fn address_hint(&self) -> String {
        if let Some(addr) = self.metadata.get(metadata::ADDRESS).filter(|a| !a.is_empty()) {
            return addr.to_string();
        }
        if !self.address.is_empty() {
            return Server::new("", "", self.address.as_str(), self.port).endpoint();
        }
        DEFAULT_ADDRESS.to_string()
    }

    /// Decode into an instance.
    ///
    /// Bad address data leaves `address` empty instead of failing; malformed
    /// server/topic/weight entries are skipped with a warning.
    pub async fn into_instance(self) -> Instance {
        let network = self.network().to_string();
        let hint = self.address_hint();

        let id = if self.id.is_empty() {
            self.metadata.get(metadata::ID).unwrap_or_default().to_string()
        } else {
            self.id.clone()
        };
        let service = self
            .metadata
            .get(metadata::NAME)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.service.clone());

        let mut instance = Instance::with_id(id, service);
        instance.tags = self.tags;

        instance.address = match Address::resolve(&network, &hint).await {
            Ok(addr) => Some(addr),
            Err(e) => {
                warn!(
                    instance = %instance.id,
                    network = %network,
                    address = %hint,
                    error = %e,
                    "Unresolvable instance address, registering without one"
                );
                None
            }
        };

        let mut md = self.metadata;
        for key in [metadata::ID, metadata::NAME, metadata::NETWORK, metadata::ADDRESS] {
            md.delete(key);
        }

        if let Some(weight) = md.delete(WEIGHT) {
            match weight.parse() {
                Ok(w) => instance.weight = w,
                Err(_) => warn!(instance = %instance.id, weight = %weight, "Ignoring invalid weight"),
            }
        }
        if let Some(status) = md.delete(STATUS) {
            instance.status = status.parse().unwrap_or(InstanceStatus::Unknown);
        }
        if let Some(port) = md.delete(MANAGER_PORT) {
            instance.manager_port = port.parse().unwrap_or_default();
        }
        instance.check = md.delete(CHECK).filter(|c| !c.is_empty());
        if let Some(ttl) = md.delete(TTL) {
            instance.ttl = parse_ttl(&ttl);
        }

        if let Some(json) = md.delete(SERVERS) {
            match serde_json::from_str::<Vec<Server>>(&json) {
                Ok(servers) => {
                    for server in servers {
                        instance = instance.with_server(server);
                    }
                }
                Err(e) => warn!(instance = %instance.id, error = %e, "Ignoring malformed servers entry"),
            }
        }
        if let Some(json) = md.delete(TOPICS) {
            match serde_json::from_str::<Vec<Topic>>(&json) {
                Ok(topics) => {
                    for topic in topics {
                        instance = instance.with_topic(topic);
                    }
                }
                Err(e) => warn!(instance = %instance.id, error = %e, "Ignoring malformed topics entry"),
            }
        }

        debug!(
            instance = %instance.id,
            service = %instance.service,
            address = ?instance.address,
            servers = instance.servers.len(),
            "Decoded service record"
        );

        instance.metadata = md;
        instance
    }
}

fn parse_ttl(value: &str) -> Option<Duration> {
    humantime_serde::re::humantime::parse_duration(value)
        .ok()
        .or_else(|| value.parse::<u64>().ok().map(Duration::from_secs))
}
