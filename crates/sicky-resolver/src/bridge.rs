//! Pool-to-resolver bridge

use crate::resolver::ResolverState;
use sicky_core::{Address, Service};
use sicky_registry::Pool;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Keeps a resolver in step with one service's instances
#[derive(Debug)]
pub struct ResolverBridge;

impl ResolverBridge {
    /// Start forwarding the service's addresses to the resolver.
    ///
    /// The service is declared in the pool when missing. The resolver is
    /// primed with the current addresses and updated on every change
    /// notification; an empty address list never reaches it. A no-change
    /// event only reaches it when the addresses differ from the last
    /// update, which covers a change notification dropped behind it. The
    /// task ends when the pool drops the subscription or the token is
    /// cancelled.
    pub fn spawn(
        pool: Arc<Pool>,
        service: impl Into<String>,
        resolver: Arc<dyn ResolverState>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let service = service.into();
        if pool.get_service(&service).is_none() {
            pool.register_service(Service::new(service.as_str()));
        }
        let mut events = pool.subscribe();

        tokio::spawn(async move {
            info!(service = %service, "Starting resolver bridge");
            let mut last = push(&pool, &service, resolver.as_ref(), &[]).await;

            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => event,
                };

                let Some(event) = event else { break };
                let known = if event.changed { &[][..] } else { &last[..] };
                let pushed = push(&pool, &service, resolver.as_ref(), known).await;
                if !pushed.is_empty() {
                    last = pushed;
                }
            }

            debug!(service = %service, "Resolver bridge stopped");
        })
    }
}

/// Addresses of a service's instances, in a stable order
pub fn service_addresses(pool: &Pool, service: &str) -> Vec<Address> {
    let mut addresses: Vec<Address> = pool
        .instances(service)
        .into_iter()
        .filter_map(|instance| instance.address)
        .collect();
    addresses.sort_by_key(|addr| addr.to_string());
    addresses
}

/// Send the current addresses unless empty or equal to `known`.
///
/// Returns what was sent, empty when nothing was.
async fn push(
    pool: &Pool,
    service: &str,
    resolver: &dyn ResolverState,
    known: &[Address],
) -> Vec<Address> {
    let addresses = service_addresses(pool, service);
    if addresses.is_empty() {
        debug!(service = %service, "No addresses, leaving resolver untouched");
        return Vec::new();
    }
    if addresses == known {
        return Vec::new();
    }

    let count = addresses.len();
    match resolver.update_state(addresses.clone()).await {
        Ok(()) => {
            debug!(service = %service, count, "Resolver updated");
            addresses
        }
        Err(e) => {
            warn!(service = %service, error = %e, "Failed to update resolver");
            Vec::new()
        }
    }
}
