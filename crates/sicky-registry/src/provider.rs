//! Registry capability contract

use crate::pool::Pool;
use async_trait::async_trait;
use sicky_core::{Instance, Metadata, Result};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Identity of a registry adapter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryOptions {
    /// Adapter id (unique per process)
    pub id: String,

    /// Backend kind (`consul`, `mdns`, `redis`)
    pub name: String,

    /// Free-form adapter metadata
    pub metadata: Metadata,
}

impl RegistryOptions {
    /// Options with a generated id
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            metadata: Metadata::new(),
        }
    }

    /// Set an explicit id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.set(key, value);
        self
    }
}

/// A registry backend.
///
/// Backends advertise local instances (`register`/`deregister`), confirm
/// instances on demand (`check_instance`) and feed the pool from a
/// background watch. Cancelling [`Registry::context`] through
/// [`Registry::stop`] is the only way to end a watch.
#[async_trait]
pub trait Registry: Send + Sync + fmt::Debug {
    /// Adapter lifetime token
    fn context(&self) -> &CancellationToken;

    /// Adapter identity
    fn options(&self) -> &RegistryOptions;

    /// Adapter id
    fn id(&self) -> &str {
        &self.options().id
    }

    /// Backend kind
    fn name(&self) -> &str {
        &self.options().name
    }

    /// Advertise an instance
    async fn register(&self, instance: &Instance) -> Result<()>;

    /// Withdraw an advertisement
    async fn deregister(&self, id: &str) -> Result<()>;

    /// Whether the backend currently knows the instance.
    ///
    /// Backend errors are logged and reported as `false`.
    async fn check_instance(&self, id: &str) -> bool;

    /// Start feeding the pool from this backend
    async fn watch(&self, pool: Arc<Pool>) -> Result<()>;

    /// Stop the watch
    fn stop(&self) {
        self.context().cancel();
    }
}

impl fmt::Display for dyn Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name(), self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options() {
        let options = RegistryOptions::new("consul").with_metadata("dc", "eu-1");
        assert_eq!(options.name, "consul");
        assert_eq!(options.id.len(), 36);
        assert_eq!(options.metadata.get("dc"), Some("eu-1"));

        let options = options.with_id("c1");
        assert_eq!(options.id, "c1");
    }
}
