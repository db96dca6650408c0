//! # Sicky Core
//!
//! Core types, traits, and error handling for the sicky discovery runtime.
//!
//! This crate provides the foundational abstractions shared by the pool,
//! the registry backends and the resolver bridge:
//! - Error types
//! - [`Metadata`] key/value tags and their `key=value` line codec
//! - Network-aware [`Address`] resolution
//! - The data model: [`Service`], [`Instance`], [`Server`], [`Topic`]
//! - [`ServiceRecord`], the backend-neutral advertisement every registry reads and writes

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod address;
pub mod error;
pub mod metadata;
pub mod record;
pub mod types;

pub use address::Address;
pub use error::{Error, Result};
pub use metadata::Metadata;
pub use record::ServiceRecord;
pub use types::{Advertisement, Instance, InstanceStatus, Server, Service, Topic};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::address::Address;
    pub use crate::error::{Error, Result};
    pub use crate::metadata::Metadata;
    pub use crate::record::ServiceRecord;
    pub use crate::types::{Advertisement, Instance, InstanceStatus, Server, Service, Topic};
}
