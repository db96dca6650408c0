//! Self-advertisement

use sicky_config::{AdvertiseConfig, Config};
use sicky_core::metadata;
use sicky_core::{
    Address, Advertisement, Instance, InstanceStatus, Metadata, Result, Service, Topic,
};
use sicky_registry::{Pool, Registry};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Declare every configured service in the pool
pub(crate) fn declare_services(pool: &Pool, config: &Config) {
    let own = config.advertise.as_ref().map(|a| a.service.as_str());

    for svc in &config.services {
        let mut service = Service::new(svc.name.as_str()).with_kind(svc.kind.as_str());
        for tag in &svc.tags {
            service = service.with_tag(tag.as_str());
        }
        for (key, value) in &svc.metadata {
            service.metadata.set(key.as_str(), value.as_str());
        }
        if own == Some(svc.name.as_str()) {
            service = service.as_self();
        }
        pool.register_service(service);
    }
}

/// Build the instance this process advertises.
///
/// The instance address takes the port of the first configured server, or
/// the management port when there are no servers.
pub(crate) async fn build_instance(config: &AdvertiseConfig) -> Result<Instance> {
    let mut instance = match config.id {
        Some(ref id) => Instance::with_id(id.as_str(), config.service.as_str()),
        None => Instance::new(config.service.as_str()),
    };

    let port = config
        .servers
        .first()
        .map(|s| s.port)
        .unwrap_or(config.manager_port);
    let address = Address::resolve(&config.network, &join_host_port(&config.address, port)).await?;

    instance = instance
        .with_address(address)
        .with_manager_port(config.manager_port)
        .with_weight(config.weight)
        .with_status(InstanceStatus::Up)
        .with_metadata(metadata::NETWORK, config.network.as_str());
    instance.check = config.check.clone();
    instance.ttl = config.ttl;

    for (key, value) in &config.metadata {
        instance = instance.with_metadata(key.as_str(), value.as_str());
    }

    for server in &config.servers {
        let advertisement = Advertisement {
            id: server
                .id
                .clone()
                .unwrap_or_else(|| format!("{}-{}", server.kind, server.port)),
            name: server.name.clone(),
            address: server
                .address
                .clone()
                .unwrap_or_else(|| config.address.clone()),
            port: server.port,
            metadata: Metadata::new(),
        };
        instance = instance.with_server(advertisement.into_server(server.kind.as_str()));
    }

    for topic in &config.topics {
        instance = instance.with_topic(Topic::new(
            topic.name.as_str(),
            topic.kind.as_str(),
            topic.group.as_str(),
        ));
    }

    Ok(instance)
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Register the instance in the pool and in every backend
pub(crate) async fn advertise(pool: &Pool, instance: &Instance) {
    if let Err(e) = pool.register_instance(instance.clone()) {
        tracing::warn!(instance = %instance.id, error = %e, "Failed to add advertised instance to the pool");
    }

    for registry in pool.registries() {
        match registry.register(instance).await {
            Ok(()) => tracing::debug!(registry = %registry, instance = %instance.id, "Advertised"),
            Err(e) => {
                tracing::warn!(registry = %registry, instance = %instance.id, error = %e, "Advertisement failed")
            }
        }
    }
}

/// Bring the backends online around our own advertisement.
///
/// Every backend joins the pool and the instance is registered before any
/// watch starts, so the first sync or purge already sees it.
pub(crate) async fn start_backends(
    pool: &Arc<Pool>,
    registries: Vec<Arc<dyn Registry>>,
    instance: Option<&Instance>,
) {
    for registry in &registries {
        pool.add_registry(registry.clone());
    }

    if let Some(instance) = instance {
        advertise(pool, instance).await;
    }

    for registry in registries {
        if let Err(e) = registry.watch(pool.clone()).await {
            tracing::error!(registry = %registry, error = %e, "Failed to start watch");
        }
    }
}

/// Remove the instance from every backend
pub(crate) async fn withdraw(pool: &Pool, instance: &Instance) {
    for registry in pool.registries() {
        if let Err(e) = registry.deregister(&instance.id).await {
            tracing::warn!(registry = %registry, instance = %instance.id, error = %e, "Deregistration failed");
        }
    }
    pool.deregister_instance(&instance.service, &instance.id);
}

/// Re-advertise every `ttl/2` until cancelled
pub(crate) fn spawn_refresh(
    pool: Arc<Pool>,
    instance: Instance,
    token: CancellationToken,
) -> Option<JoinHandle<()>> {
    let period = refresh_period(instance.ttl)?;

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    tracing::trace!(instance = %instance.id, "Refreshing advertisement");
                    advertise(&pool, &instance).await;
                }
            }
        }
    }))
}

fn refresh_period(ttl: Option<Duration>) -> Option<Duration> {
    ttl.map(|ttl| ttl / 2).filter(|p| !p.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use sicky_config::{load_from_str, ConfigFormat};
    use sicky_registry::RegistryOptions;

    const CONFIG: &str = r#"
services:
  - name: orders
    kind: grpc
    tags: [v2]
  - name: billing
advertise:
  service: orders
  id: orders-1
  address: "10.0.0.1"
  manager_port: 9100
  ttl: 10s
  servers:
    - kind: grpc
      name: api
      port: 9000
    - id: events
      kind: udp
      address: "10.0.0.2"
      port: 9500
  topics:
    - name: orders.created
      kind: kafka
      group: billing
  metadata:
    zone: eu-1
"#;

    fn config() -> Config {
        load_from_str(CONFIG, ConfigFormat::Yaml).unwrap()
    }

    /// Registry that records the calls it receives
    #[derive(Debug)]
    struct RecordingRegistry {
        token: CancellationToken,
        options: RegistryOptions,
        calls: Mutex<Vec<String>>,
    }

    impl RecordingRegistry {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                token: CancellationToken::new(),
                options: RegistryOptions::new("recording").with_id("r1"),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Registry for RecordingRegistry {
        fn context(&self) -> &CancellationToken {
            &self.token
        }

        fn options(&self) -> &RegistryOptions {
            &self.options
        }

        async fn register(&self, instance: &Instance) -> Result<()> {
            self.calls.lock().push(format!("register {}", instance.id));
            Ok(())
        }

        async fn deregister(&self, id: &str) -> Result<()> {
            self.calls.lock().push(format!("deregister {id}"));
            Ok(())
        }

        async fn check_instance(&self, _id: &str) -> bool {
            true
        }

        async fn watch(&self, pool: Arc<Pool>) -> Result<()> {
            let seen = pool.get_instance("orders", "orders-1").is_some();
            self.calls.lock().push(format!("watch seen={seen}"));
            Ok(())
        }
    }

    #[test]
    fn test_declare_services() {
        let pool = Pool::new();
        declare_services(&pool, &config());

        assert_eq!(pool.service_names(), vec!["billing", "orders"]);
        let orders = pool.get_service("orders").unwrap();
        assert!(orders.is_self);
        assert_eq!(orders.kind, "grpc");
        assert_eq!(orders.tags, vec!["v2"]);
        assert!(!pool.get_service("billing").unwrap().is_self);
    }

    #[tokio::test]
    async fn test_build_instance() {
        let config = config();
        let instance = build_instance(config.advertise.as_ref().unwrap())
            .await
            .unwrap();

        assert_eq!(instance.id, "orders-1");
        assert_eq!(instance.service, "orders");
        assert_eq!(instance.address.unwrap().to_string(), "10.0.0.1:9000");
        assert_eq!(instance.manager_port, 9100);
        assert_eq!(instance.status, InstanceStatus::Up);
        assert_eq!(instance.metadata.get("zone"), Some("eu-1"));
        assert_eq!(instance.metadata.get(metadata::NETWORK), Some("tcp"));

        let grpc = &instance.servers["grpc-9000"];
        assert_eq!(grpc.address, "10.0.0.1");
        assert_eq!(grpc.name, "api");
        assert_eq!(grpc.instance, "orders-1");

        let events = &instance.servers["events"];
        assert_eq!(events.endpoint(), "10.0.0.2:9500");
        assert_eq!(events.network(), "udp");

        assert_eq!(instance.topics["orders.created"].group, "billing");
    }

    #[tokio::test]
    async fn test_build_instance_without_servers_uses_manager_port() {
        let mut advertise = config().advertise.unwrap();
        advertise.servers.clear();
        advertise.id = None;

        let instance = build_instance(&advertise).await.unwrap();
        assert_eq!(instance.address.unwrap().to_string(), "10.0.0.1:9100");
        assert!(!instance.id.is_empty());
    }

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("10.0.0.1", 80), "10.0.0.1:80");
        assert_eq!(join_host_port("::1", 80), "[::1]:80");
        assert_eq!(join_host_port("[::1]", 80), "[::1]:80");
    }

    #[test]
    fn test_refresh_period() {
        assert_eq!(refresh_period(None), None);
        assert_eq!(
            refresh_period(Some(Duration::from_secs(10))),
            Some(Duration::from_secs(5))
        );
        assert_eq!(refresh_period(Some(Duration::ZERO)), None);
    }

    #[tokio::test]
    async fn test_advertise_and_withdraw_without_backends() {
        let pool = Pool::new();
        declare_services(&pool, &config());
        let instance = build_instance(config().advertise.as_ref().unwrap())
            .await
            .unwrap();

        advertise(&pool, &instance).await;
        assert!(pool.get_instance("orders", "orders-1").is_some());

        withdraw(&pool, &instance).await;
        assert!(pool.get_instance("orders", "orders-1").is_none());
    }

    #[tokio::test]
    async fn test_backends_watch_after_self_registration() {
        let pool = Pool::new();
        declare_services(&pool, &config());
        let instance = build_instance(config().advertise.as_ref().unwrap())
            .await
            .unwrap();
        let first = RecordingRegistry::new();
        let second = RecordingRegistry::new();

        start_backends(
            &pool,
            vec![first.clone() as Arc<dyn Registry>, second.clone() as Arc<dyn Registry>],
            Some(&instance),
        )
        .await;

        assert_eq!(pool.registries().len(), 2);
        for registry in [&first, &second] {
            assert_eq!(
                *registry.calls.lock(),
                vec!["register orders-1", "watch seen=true"]
            );
        }
    }

    #[tokio::test]
    async fn test_backends_start_without_advertisement() {
        let pool = Pool::new();
        let registry = RecordingRegistry::new();

        start_backends(&pool, vec![registry.clone() as Arc<dyn Registry>], None).await;

        assert_eq!(*registry.calls.lock(), vec!["watch seen=false"]);
    }
}
