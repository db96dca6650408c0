//! Instance pool and registry backends
//!
//! The [`Pool`] is the live picture of every known service instance. Registry
//! backends ([`ConsulRegistry`], [`MdnsRegistry`], [`RedisRegistry`]) feed it
//! from their watches and confirm instances during purges; the
//! [`Reconciler`] runs those purges on a schedule.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

#[cfg(feature = "consul")]
pub mod consul;
#[cfg(feature = "mdns")]
pub mod mdns;
pub mod pool;
pub mod provider;
pub mod reconcile;
#[cfg(feature = "redis-backend")]
pub mod redis_backend;

pub use pool::{Pool, PoolEvent, PurgeReport, PURGE_CONCURRENCY};
pub use provider::{Registry, RegistryOptions};
pub use reconcile::Reconciler;

#[cfg(feature = "consul")]
pub use consul::ConsulRegistry;

#[cfg(feature = "mdns")]
pub use mdns::{MdnsRegistry, TypeWatchSet};

#[cfg(feature = "redis-backend")]
pub use crate::redis_backend::RedisRegistry;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::pool::{Pool, PoolEvent, PurgeReport};
    pub use crate::provider::{Registry, RegistryOptions};
    pub use crate::reconcile::Reconciler;

    #[cfg(feature = "consul")]
    pub use crate::consul::ConsulRegistry;

    #[cfg(feature = "mdns")]
    pub use crate::mdns::MdnsRegistry;

    #[cfg(feature = "redis-backend")]
    pub use crate::redis_backend::RedisRegistry;
}
