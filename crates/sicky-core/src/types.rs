//! Service, instance, server and topic definitions

use crate::address::Address;
use crate::metadata::{self, Metadata};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A logical, deployable unit under which instances are discoverable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    /// Service name (unique key in the pool)
    pub name: String,

    /// Service kind (free-form, e.g. "grpc", "worker")
    #[serde(default)]
    pub kind: String,

    /// Whether the current process is a member of this service
    #[serde(default)]
    pub is_self: bool,

    /// Service tags
    #[serde(default)]
    pub tags: Vec<String>,

    /// Service metadata
    #[serde(default)]
    pub metadata: Metadata,

    /// Known instances keyed by instance id
    #[serde(default)]
    pub instances: HashMap<String, Instance>,
}

impl Service {
    /// Create a new service with no instances
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: String::new(),
            is_self: false,
            tags: Vec::new(),
            metadata: Metadata::new(),
            instances: HashMap::new(),
        }
    }

    /// Set the service kind
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Mark this service as one the current process belongs to
    pub fn as_self(mut self) -> Self {
        self.is_self = true;
        self
    }

    /// Add a tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Get instance count
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}

/// Instance lifecycle status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Status not reported
    #[default]
    Unknown,
    /// Instance is starting up
    Starting,
    /// Instance is serving
    Up,
    /// Instance is shutting down or failed
    Down,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Unknown => write!(f, "unknown"),
            InstanceStatus::Starting => write!(f, "starting"),
            InstanceStatus::Up => write!(f, "up"),
            InstanceStatus::Down => write!(f, "down"),
        }
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unknown" => Ok(InstanceStatus::Unknown),
            "starting" => Ok(InstanceStatus::Starting),
            "up" | "passing" => Ok(InstanceStatus::Up),
            "down" | "critical" => Ok(InstanceStatus::Down),
            _ => Err(format!("Unknown instance status: {s}")),
        }
    }
}

/// One running process of a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Globally unique instance id
    pub id: String,

    /// Owning service name
    pub service: String,

    /// Advertised address; `None` when discovery data could not be resolved
    #[serde(default)]
    pub address: Option<Address>,

    /// Management port (0 when not exposed)
    #[serde(default)]
    pub manager_port: u16,

    /// Instance tags
    #[serde(default)]
    pub tags: Vec<String>,

    /// Instance metadata
    #[serde(default)]
    pub metadata: Metadata,

    /// Load-balancing weight
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Lifecycle status
    #[serde(default)]
    pub status: InstanceStatus,

    /// Health-check entry point (usually an HTTP URL)
    #[serde(default)]
    pub check: Option<String>,

    /// Advertisement time-to-live
    #[serde(default, with = "humantime_serde")]
    pub ttl: Option<Duration>,

    /// Protocol servers keyed by server id
    #[serde(default)]
    pub servers: HashMap<String, Server>,

    /// Messaging topics keyed by topic name
    #[serde(default)]
    pub topics: HashMap<String, Topic>,

    /// Pool-assigned revision, bumped on every upsert
    #[serde(skip)]
    pub revision: u64,
}

fn default_weight() -> u32 {
    1
}

impl Instance {
    /// Create a new instance with a generated id
    pub fn new(service: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), service)
    }

    /// Create a new instance with an explicit id
    pub fn with_id(id: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            service: service.into(),
            address: None,
            manager_port: 0,
            tags: Vec::new(),
            metadata: Metadata::new(),
            weight: default_weight(),
            status: InstanceStatus::Unknown,
            check: None,
            ttl: None,
            servers: HashMap::new(),
            topics: HashMap::new(),
            revision: 0,
        }
    }

    /// Set the advertised address
    pub fn with_address(mut self, address: Address) -> Self {
        self.address = Some(address);
        self
    }

    /// Set the management port
    pub fn with_manager_port(mut self, port: u16) -> Self {
        self.manager_port = port;
        self
    }

    /// Set the status
    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status = status;
        self
    }

    /// Set the weight
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.set(key, value);
        self
    }

    /// Attach a protocol server. The server's owner is rewritten to this instance.
    pub fn with_server(mut self, mut server: Server) -> Self {
        server.instance = self.id.clone();
        self.servers.insert(server.id.clone(), server);
        self
    }

    /// Attach a messaging topic. The topic's owner is rewritten to this instance.
    pub fn with_topic(mut self, mut topic: Topic) -> Self {
        topic.instance = self.id.clone();
        self.topics.insert(topic.name.clone(), topic);
        self
    }

    /// Equality ignoring the pool revision
    pub fn same_record(&self, other: &Instance) -> bool {
        let mut other = other.clone();
        other.revision = self.revision;
        self == &other
    }
}

/// One protocol listener owned by an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// Server id
    pub id: String,

    /// Owning instance id
    #[serde(default)]
    pub instance: String,

    /// Protocol tag (grpc, http, websocket, udp, tcp)
    pub kind: String,

    /// Logical name
    #[serde(default)]
    pub name: String,

    /// Advertised host
    pub address: String,

    /// Advertised port
    pub port: u16,
}

impl Server {
    /// Create a new server
    pub fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            instance: String::new(),
            kind: kind.into(),
            name: String::new(),
            address: address.into(),
            port,
        }
    }

    /// Set the logical name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Network the server's protocol runs on
    pub fn network(&self) -> &'static str {
        if self.kind.eq_ignore_ascii_case("udp") {
            "udp"
        } else {
            "tcp"
        }
    }

    /// `host:port` form of the advertised endpoint
    pub fn endpoint(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

/// One messaging subject an instance participates in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    /// Owning instance id (back-reference)
    #[serde(default)]
    pub instance: String,

    /// Topic name
    pub name: String,

    /// Topic type (broker kind)
    #[serde(default)]
    pub kind: String,

    /// Consumer group
    #[serde(default)]
    pub group: String,
}

impl Topic {
    /// Create a new topic
    pub fn new(name: impl Into<String>, kind: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            instance: String::new(),
            name: name.into(),
            kind: kind.into(),
            group: group.into(),
        }
    }
}

/// The record a protocol server hands to the registry to advertise itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    /// Server id
    pub id: String,
    /// Logical name
    pub name: String,
    /// Advertised host
    pub address: String,
    /// Advertised port
    pub port: u16,
    /// Extra metadata; a `network` entry overrides the protocol's default
    #[serde(default)]
    pub metadata: Metadata,
}

impl Advertisement {
    /// Turn the advertisement into a server record of the given protocol
    pub fn into_server(self, kind: impl Into<String>) -> Server {
        let mut kind = kind.into();
        if let Some(network) = self.metadata.get(metadata::NETWORK) {
            if network.starts_with("udp") {
                kind = "udp".to_string();
            }
        }
        Server {
            id: self.id,
            instance: String::new(),
            kind,
            name: self.name,
            address: self.address,
            port: self.port,
        }
    }
}
