//! String key/value metadata carried on services, instances and servers

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Network hint key (`tcp`, `udp`, `unix`, ...)
pub const NETWORK: &str = "network";
/// Advertised address hint key (`host:port` or a socket path)
pub const ADDRESS: &str = "address";
/// Service name hint key
pub const NAME: &str = "name";
/// Instance identifier hint key
pub const ID: &str = "id";

/// Free-form string tags.
///
/// Keys are kept sorted so the `key=value` rendering is stable, which keeps
/// Consul metadata and mDNS TXT records from flapping between identical
/// registrations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    /// Create empty metadata
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Set a value, replacing any previous one
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder-style [`Metadata::set`]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Remove a value
    pub fn delete(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Independent copy of this metadata
    pub fn copy(&self) -> Metadata {
        self.clone()
    }

    /// Whether a key is present
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no entries
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Render as `key=value` lines
    pub fn to_lines(&self) -> Vec<String> {
        self.0.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    /// Parse `key=value` lines.
    ///
    /// Only the first `=` separates key from value. Lines without a `=` or
    /// with an empty key are skipped.
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut metadata = Metadata::new();
        for line in lines {
            if let Some((key, value)) = line.as_ref().split_once('=') {
                if !key.is_empty() {
                    metadata.set(key, value);
                }
            }
        }
        metadata
    }
}

impl From<std::collections::HashMap<String, String>> for Metadata {
    fn from(map: std::collections::HashMap<String, String>) -> Self {
        Metadata(map.into_iter().collect())
    }
}

impl From<Metadata> for std::collections::HashMap<String, String> {
    fn from(metadata: Metadata) -> Self {
        metadata.0.into_iter().collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Metadata(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}
