//! Integration tests for the instance pool

use async_trait::async_trait;
use parking_lot::Mutex;
use sicky_core::{Address, Error, Instance, Result, Service};
use sicky_registry::{Pool, PoolEvent, Registry, RegistryOptions, PURGE_CONCURRENCY};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Registry that confirms a fixed set of ids
#[derive(Debug)]
struct StaticRegistry {
    token: CancellationToken,
    options: RegistryOptions,
    known: Mutex<HashSet<String>>,
    check_delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl StaticRegistry {
    fn new(known: &[&str]) -> Arc<Self> {
        Self::with_delay(known, Duration::ZERO)
    }

    fn with_delay(known: &[&str], check_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            token: CancellationToken::new(),
            options: RegistryOptions::new("static").with_id("s1"),
            known: Mutex::new(known.iter().map(|id| id.to_string()).collect()),
            check_delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Registry for StaticRegistry {
    fn context(&self) -> &CancellationToken {
        &self.token
    }

    fn options(&self) -> &RegistryOptions {
        &self.options
    }

    async fn register(&self, instance: &Instance) -> Result<()> {
        self.known.lock().insert(instance.id.clone());
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        self.known.lock().remove(id);
        Ok(())
    }

    async fn check_instance(&self, id: &str) -> bool {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.check_delay.is_zero() {
            tokio::time::sleep(self.check_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.known.lock().contains(id)
    }

    async fn watch(&self, _pool: Arc<Pool>) -> Result<()> {
        Ok(())
    }
}

fn instance(id: &str, port: u16) -> Instance {
    Instance::with_id(id, "orders")
        .with_address(Address::Tcp(format!("10.0.0.1:{port}").parse().unwrap()))
}

fn orders_pool() -> Arc<Pool> {
    let pool = Pool::new();
    pool.register_service(Service::new("orders"));
    pool
}

#[test]
fn test_last_write_wins() {
    let pool = orders_pool();

    pool.register_instance(instance("a", 9000).with_metadata("zone", "eu"))
        .unwrap();
    pool.register_instance(instance("a", 9001)).unwrap();

    let stored = pool.get_instance("orders", "a").unwrap();
    assert!(stored.same_record(&instance("a", 9001)));
    assert!(stored.metadata.is_empty());
    assert_eq!(pool.instances("orders").len(), 1);
}

#[test]
fn test_unknown_service_has_no_effect() {
    let pool = Pool::new();
    let mut events = pool.subscribe();

    let err = pool
        .register_instance(Instance::with_id("a", "billing"))
        .unwrap_err();

    assert!(matches!(err, Error::UnknownService(ref name) if name == "billing"));
    assert!(pool.get_service("billing").is_none());
    assert!(pool.service_names().is_empty());
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_purge_removes_unconfirmed_only() {
    let pool = orders_pool();
    pool.add_registry(StaticRegistry::new(&["a", "c"]));

    for (id, port) in [("a", 9000), ("b", 9001), ("c", 9002)] {
        pool.register_instance(instance(id, port)).unwrap();
    }
    let before_a = pool.get_instance("orders", "a").unwrap();

    let report = pool.purge_instances().await;

    assert_eq!(report.checked, 3);
    assert_eq!(report.removed, vec![("orders".to_string(), "b".to_string())]);
    assert!(pool.get_instance("orders", "b").is_none());
    assert_eq!(pool.get_instance("orders", "a").unwrap(), before_a);
    assert!(pool.get_instance("orders", "c").is_some());
}

#[tokio::test]
async fn test_purge_confirmed_by_any_registry() {
    let pool = orders_pool();
    pool.add_registry(StaticRegistry::new(&[]));
    pool.add_registry(StaticRegistry::new(&["a"]));
    pool.register_instance(instance("a", 9000)).unwrap();

    let report = pool.purge_instances().await;
    assert_eq!(report.removed_count(), 0);
    assert!(pool.get_instance("orders", "a").is_some());
}

#[tokio::test]
async fn test_purge_keeps_empty_service() {
    let pool = orders_pool();
    pool.add_registry(StaticRegistry::new(&[]));
    pool.register_instance(instance("a", 9000)).unwrap();

    pool.purge_instances().await;

    let service = pool.get_service("orders").unwrap();
    assert_eq!(service.instance_count(), 0);
}

#[tokio::test]
async fn test_purge_keeps_instance_updated_during_check() {
    let pool = orders_pool();
    pool.add_registry(StaticRegistry::with_delay(&[], Duration::from_millis(100)));
    pool.register_instance(instance("a", 9000)).unwrap();

    let purge = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.purge_instances().await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    pool.register_instance(instance("a", 9001)).unwrap();

    let report = purge.await.unwrap();
    assert_eq!(report.removed_count(), 0);
    assert_eq!(
        pool.get_instance("orders", "a").unwrap().address.unwrap().port(),
        Some(9001)
    );
}

#[tokio::test]
async fn test_every_sweep_notifies_with_changed_flag() {
    let pool = orders_pool();
    pool.add_registry(StaticRegistry::new(&["a"]));
    pool.register_instance(instance("a", 9000)).unwrap();

    let mut events = pool.subscribe();
    pool.purge_instances().await;
    assert_eq!(events.try_recv().unwrap(), PoolEvent { changed: false });

    pool.register_instance(instance("b", 9001)).unwrap();
    assert_eq!(events.recv().await, Some(PoolEvent { changed: true }));

    pool.purge_instances().await;
    assert_eq!(events.recv().await, Some(PoolEvent { changed: true }));
}

#[test]
fn test_rapid_mutations_leave_one_pending_event() {
    let pool = orders_pool();
    let mut events = pool.subscribe();

    for port in 0..100 {
        pool.register_instance(instance("a", 9000 + port)).unwrap();
    }

    assert_eq!(events.try_recv().unwrap(), PoolEvent { changed: true });
    assert!(events.try_recv().is_err());
}

#[test]
fn test_every_subscriber_is_notified() {
    let pool = orders_pool();
    let mut first = pool.subscribe();
    let mut second = pool.subscribe();

    pool.register_instance(instance("a", 9000)).unwrap();

    assert!(first.try_recv().is_ok());
    assert!(second.try_recv().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_never_see_partial_updates() {
    let pool = orders_pool();
    pool.register_instance(instance("a", 9000).with_metadata("port", "9000"))
        .unwrap();

    let writer = {
        let pool = pool.clone();
        tokio::spawn(async move {
            for port in 9001..11000u16 {
                pool.register_instance(
                    instance("a", port).with_metadata("port", port.to_string()),
                )
                .unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move {
                for _ in 0..2000 {
                    let ins = pool.get_instance("orders", "a").unwrap();
                    let port = ins.address.unwrap().port().unwrap().to_string();
                    assert_eq!(ins.metadata.get("port"), Some(port.as_str()));
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    writer.await.unwrap();
    for reader in readers {
        reader.await.unwrap();
    }
}

#[test]
fn test_registry_display() {
    let registry: Arc<dyn Registry> = StaticRegistry::new(&[]);
    assert_eq!(registry.to_string(), "static:s1");
    assert_eq!(registry.name(), "static");

    registry.stop();
    assert!(registry.context().is_cancelled());
}

#[tokio::test]
async fn test_purge_bounds_concurrent_checks() {
    let pool = orders_pool();
    let registry = StaticRegistry::with_delay(&[], Duration::from_millis(5));
    pool.add_registry(registry.clone());
    for n in 0..500u16 {
        pool.register_instance(instance(&format!("i{n}"), 9000 + n)).unwrap();
    }

    let report = pool.purge_instances().await;

    assert_eq!(report.checked, 500);
    assert_eq!(report.removed_count(), 500);
    let peak = registry.peak.load(Ordering::SeqCst);
    assert!(peak <= PURGE_CONCURRENCY, "peak {peak} exceeds limit");
    assert!(peak > 1, "checks ran sequentially");
}
