//! Resolver bridge
//!
//! Turns pool change notifications into address-list updates for RPC
//! client resolvers, so a balanced channel follows instances as they come
//! and go without reconnecting.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod bridge;
pub mod resolver;

pub use bridge::{service_addresses, ResolverBridge};
pub use resolver::{BalancedResolver, ManualResolver, ResolverState};
