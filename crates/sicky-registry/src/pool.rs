//! Central instance store

use crate::provider::Registry;
use futures::{stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use sicky_core::{Error, Instance, Result, Service};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, trace};

/// Most `check_instance` calls a purge keeps in flight
pub const PURGE_CONCURRENCY: usize = 32;

/// Change notification delivered to pool subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolEvent {
    /// Whether the instance set changed
    pub changed: bool,
}

/// Outcome of a purge sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Instances checked
    pub checked: usize,

    /// Removed `(service, instance id)` pairs
    pub removed: Vec<(String, String)>,
}

impl PurgeReport {
    /// Number of removed instances
    pub fn removed_count(&self) -> usize {
        self.removed.len()
    }
}

/// Live picture of every known service and instance.
///
/// Shared as `Arc<Pool>`. All mutation happens under one write lock and
/// holds it only for the in-memory change; backend checks run outside it.
#[derive(Debug, Default)]
pub struct Pool {
    services: RwLock<HashMap<String, Service>>,
    registries: RwLock<Vec<Arc<dyn Registry>>>,
    subscribers: Mutex<Vec<mpsc::Sender<PoolEvent>>>,
    revision: AtomicU64,
}

impl Pool {
    /// Create an empty pool
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Insert or replace a service.
    ///
    /// A replacement that carries no instances keeps the instances already
    /// known for that name.
    pub fn register_service(&self, mut service: Service) {
        for instance in service.instances.values_mut() {
            instance.revision = self.next_revision();
        }

        let mut services = self.services.write();
        if service.instances.is_empty() {
            if let Some(existing) = services.get_mut(&service.name) {
                service.instances = std::mem::take(&mut existing.instances);
            }
        }

        debug!(
            service = %service.name,
            instances = service.instances.len(),
            "Registered service"
        );
        services.insert(service.name.clone(), service);
    }

    /// Snapshot of a service
    pub fn get_service(&self, name: &str) -> Option<Service> {
        self.services.read().get(name).cloned()
    }

    /// Names of all registered services
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot of a service's instances (empty for unknown services)
    pub fn instances(&self, service: &str) -> Vec<Instance> {
        self.services
            .read()
            .get(service)
            .map(|svc| svc.instances.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Insert or replace an instance of an already registered service.
    ///
    /// The whole record is replaced; the last writer wins. Returns
    /// [`Error::UnknownService`] and changes nothing when the service is
    /// not registered.
    pub fn register_instance(&self, mut instance: Instance) -> Result<()> {
        {
            let mut services = self.services.write();
            let service = services
                .get_mut(&instance.service)
                .ok_or_else(|| Error::UnknownService(instance.service.clone()))?;

            instance.revision = self.next_revision();
            trace!(
                service = %instance.service,
                instance = %instance.id,
                revision = instance.revision,
                "Upserting instance"
            );
            service.instances.insert(instance.id.clone(), instance);
        }

        self.notify();
        Ok(())
    }

    /// Snapshot of one instance
    pub fn get_instance(&self, service: &str, id: &str) -> Option<Instance> {
        self.services
            .read()
            .get(service)
            .and_then(|svc| svc.instances.get(id))
            .cloned()
    }

    /// Remove an instance after an explicit deregistration
    pub fn deregister_instance(&self, service: &str, id: &str) -> Option<Instance> {
        let removed = self
            .services
            .write()
            .get_mut(service)
            .and_then(|svc| svc.instances.remove(id));

        if removed.is_some() {
            debug!(service = %service, instance = %id, "Deregistered instance");
            self.notify();
        }
        removed
    }

    /// Add a backend consulted by [`Pool::purge_instances`]
    pub fn add_registry(&self, registry: Arc<dyn Registry>) {
        info!(registry = %registry, "Added registry to pool");
        self.registries.write().push(registry);
    }

    /// Registered backends
    pub fn registries(&self) -> Vec<Arc<dyn Registry>> {
        self.registries.read().clone()
    }

    /// Remove every instance that no backend confirms.
    ///
    /// Backend checks run without holding the pool lock, at most
    /// [`PURGE_CONCURRENCY`] at a time. An instance upserted while the checks
    /// were in flight is kept. Services are never removed, only emptied.
    /// Every completed sweep attempts a notification whose `changed` flag
    /// tells whether anything was removed. The sweep is skipped when no
    /// backend is registered.
    pub async fn purge_instances(&self) -> PurgeReport {
        let registries = self.registries();
        if registries.is_empty() {
            debug!("No registries configured, skipping purge");
            return PurgeReport::default();
        }

        let snapshot: Vec<(String, String, u64)> = {
            let services = self.services.read();
            services
                .values()
                .flat_map(|svc| {
                    svc.instances
                        .values()
                        .map(|ins| (svc.name.clone(), ins.id.clone(), ins.revision))
                })
                .collect()
        };

        let results: Vec<Option<(String, String, u64)>> = stream::iter(snapshot)
            .map(|(service, id, revision)| {
                let registries = &registries;
                async move {
                    for registry in registries {
                        if registry.check_instance(&id).await {
                            return None;
                        }
                    }
                    Some((service, id, revision))
                }
            })
            .buffer_unordered(PURGE_CONCURRENCY)
            .collect()
            .await;
        let checked = results.len();
        let stale: Vec<(String, String, u64)> = results.into_iter().flatten().collect();

        let mut removed = Vec::new();
        if !stale.is_empty() {
            let mut services = self.services.write();
            for (service, id, revision) in stale {
                let Some(svc) = services.get_mut(&service) else {
                    continue;
                };
                let unchanged = svc
                    .instances
                    .get(&id)
                    .is_some_and(|ins| ins.revision == revision);
                if unchanged {
                    svc.instances.remove(&id);
                    info!(service = %service, instance = %id, "Purged unconfirmed instance");
                    removed.push((service, id));
                } else {
                    debug!(service = %service, instance = %id, "Instance updated during purge, keeping it");
                }
            }
        }

        self.notify_with(!removed.is_empty());

        PurgeReport { checked, removed }
    }

    /// Subscribe to change notifications.
    ///
    /// Each subscriber owns a one-slot channel. A notification that finds
    /// the slot full is dropped, so a slow consumer sees at most one
    /// pending event and writers never wait.
    pub fn subscribe(&self) -> mpsc::Receiver<PoolEvent> {
        let (tx, rx) = mpsc::channel(1);
        self.subscribers.lock().push(tx);
        rx
    }

    fn notify(&self) {
        self.notify_with(true);
    }

    fn notify_with(&self, changed: bool) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(PoolEvent { changed }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!("Subscriber has a pending event, dropping notification");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sicky_core::Address;

    fn instance(id: &str, port: u16) -> Instance {
        Instance::with_id(id, "orders")
            .with_address(Address::Tcp(format!("10.0.0.1:{port}").parse().unwrap()))
    }

    #[test]
    fn test_register_service_keeps_instances() {
        let pool = Pool::new();
        pool.register_service(Service::new("orders"));
        pool.register_instance(instance("a", 9000)).unwrap();

        pool.register_service(Service::new("orders").with_kind("grpc"));

        let service = pool.get_service("orders").unwrap();
        assert_eq!(service.kind, "grpc");
        assert_eq!(service.instance_count(), 1);
    }

    #[test]
    fn test_revision_bumps_on_upsert() {
        let pool = Pool::new();
        pool.register_service(Service::new("orders"));

        pool.register_instance(instance("a", 9000)).unwrap();
        let first = pool.get_instance("orders", "a").unwrap().revision;
        pool.register_instance(instance("a", 9000)).unwrap();
        let second = pool.get_instance("orders", "a").unwrap().revision;

        assert!(second > first);
    }

    #[test]
    fn test_deregister_instance() {
        let pool = Pool::new();
        pool.register_service(Service::new("orders"));
        pool.register_instance(instance("a", 9000)).unwrap();

        assert!(pool.deregister_instance("orders", "a").is_some());
        assert!(pool.deregister_instance("orders", "a").is_none());
        assert!(pool.deregister_instance("billing", "a").is_none());
        assert!(pool.get_service("orders").is_some());
    }

    #[tokio::test]
    async fn test_purge_without_registries_is_skipped() {
        let pool = Pool::new();
        pool.register_service(Service::new("orders"));
        pool.register_instance(instance("a", 9000)).unwrap();

        let report = pool.purge_instances().await;
        assert_eq!(report, PurgeReport::default());
        assert_eq!(pool.instances("orders").len(), 1);
    }

    #[test]
    fn test_closed_subscribers_are_pruned() {
        let pool = Pool::new();
        pool.register_service(Service::new("orders"));

        let rx = pool.subscribe();
        drop(rx);
        let mut live = pool.subscribe();

        pool.register_instance(instance("a", 9000)).unwrap();
        assert_eq!(pool.subscribers.lock().len(), 1);
        assert_eq!(live.try_recv().unwrap(), PoolEvent { changed: true });
    }
}
