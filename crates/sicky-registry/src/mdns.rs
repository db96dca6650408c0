//! mDNS/Bonjour registry backend
//!
//! Every protocol server of an instance is announced as its own DNS-SD
//! service of type `_sicky._<protocol>._<network>.<domain>`, labelled with the
//! instance id. All announcements carry the same instance record as TXT
//! properties plus a few keys naming their server; a browser merges them
//! back into one instance. Topics are not carried over mDNS.
//!
//! Watching is two-level: a browse of the DNS-SD meta-query lists every
//! advertised service type, and each recognised type gets one instance
//! browse of its own.

use crate::pool::Pool;
use crate::provider::{Registry, RegistryOptions};
use async_trait::async_trait;
use dashmap::DashMap;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use sicky_config::MdnsConfig;
use sicky_core::{metadata, record, Error, Instance, Metadata, Result, Server, ServiceRecord};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Admits each recognised service type once.
///
/// A type is recognised when it starts with the configured prefix label,
/// continues with one of the configured protocol labels and a `_tcp`/`_udp`
/// network label. The set lives inside the type-browse task.
#[derive(Debug, Clone)]
pub struct TypeWatchSet {
    prefix: String,
    protocols: Vec<String>,
    admitted: HashSet<String>,
}

impl TypeWatchSet {
    /// Create a set for the given prefix and protocol names
    pub fn new(prefix: impl Into<String>, protocols: &[String]) -> Self {
        Self {
            prefix: prefix.into(),
            protocols: protocols
                .iter()
                .map(|p| p.trim_start_matches('_').to_ascii_lowercase())
                .collect(),
            admitted: HashSet::new(),
        }
    }

    /// Whether a service type belongs to sicky
    pub fn is_recognised(&self, service_type: &str) -> bool {
        let mut labels = service_type.split('.');
        let (Some(prefix), Some(protocol), Some(network)) =
            (labels.next(), labels.next(), labels.next())
        else {
            return false;
        };

        prefix.eq_ignore_ascii_case(&self.prefix)
            && protocol
                .strip_prefix('_')
                .is_some_and(|p| self.protocols.iter().any(|known| p.eq_ignore_ascii_case(known)))
            && matches!(network.to_ascii_lowercase().as_str(), "_tcp" | "_udp")
    }

    /// Admit a type. True only the first time a recognised type is seen.
    pub fn admit(&mut self, service_type: &str) -> bool {
        self.is_recognised(service_type) && self.admitted.insert(service_type.to_ascii_lowercase())
    }

    /// Number of admitted types
    pub fn len(&self) -> usize {
        self.admitted.len()
    }

    /// Whether no type has been admitted
    pub fn is_empty(&self) -> bool {
        self.admitted.is_empty()
    }
}

/// TXT key naming the announced server
const SERVER_ID: &str = "server";
/// TXT key holding the announced server's logical name
const SERVER_NAME: &str = "server_name";
/// TXT key holding the host the server advertises
const SERVER_HOST: &str = "server_host";

/// Longest `key=value` string one TXT entry can hold
const MAX_TXT_PROPERTY: usize = 255;

/// One resolved announcement: the instance it describes (without servers)
/// and the server it carries
#[derive(Debug, Clone)]
struct Announcement {
    instance: Instance,
    server: Server,
    seq: u64,
}

#[derive(Debug, Default)]
struct MdnsState {
    /// Fullnames announced by this adapter, by instance id
    registered: DashMap<String, Vec<String>>,

    /// Resolved announcements by fullname
    resolved: DashMap<String, Announcement>,

    seq: AtomicU64,
}

impl MdnsState {
    /// Whether the id is announced by us or resolved from the network
    fn check(&self, id: &str) -> bool {
        self.registered.contains_key(id)
            || self.resolved.iter().any(|entry| entry.value().instance.id == id)
    }

    /// Record a resolved announcement and upsert its instance with every
    /// server currently announced for it
    async fn on_resolved(&self, info: &ServiceInfo, enable_ipv6: bool, pool: &Pool) {
        let fullname = info.get_fullname();
        let lines: Vec<String> = info
            .get_properties()
            .iter()
            .map(|prop| format!("{}={}", prop.key(), prop.val_str()))
            .collect();
        let ip = info
            .get_addresses()
            .iter()
            .copied()
            .find(|addr| enable_ipv6 || addr.is_ipv4());

        let Some((record, server)) =
            decode_announcement(fullname, info.get_type(), &lines, ip, info.get_port())
        else {
            debug!(fullname = %fullname, "Ignoring mDNS service without a sicky record");
            return;
        };

        let mut instance = record.into_instance().await;
        instance.servers.clear();
        let id = instance.id.clone();

        self.resolved.insert(
            fullname.to_string(),
            Announcement {
                instance,
                server,
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
            },
        );

        if let Some(instance) = self.assemble(&id) {
            upsert(pool, instance);
        }
    }

    /// Forget a withdrawn announcement. The instance leaves the pool with
    /// its last announcement; until then it keeps the remaining servers.
    fn on_removed(&self, fullname: &str, pool: &Pool) {
        let Some((_, gone)) = self.resolved.remove(fullname) else {
            return;
        };
        let (service, id) = (&gone.instance.service, &gone.instance.id);

        match self.assemble(id) {
            Some(instance) => {
                debug!(
                    fullname = %fullname,
                    instance = %id,
                    servers = instance.servers.len(),
                    "Server withdrawn, instance still announced"
                );
                upsert(pool, instance);
            }
            None => {
                if pool.deregister_instance(service, id).is_some() {
                    info!(service = %service, instance = %id, "Instance removed via mDNS");
                }
            }
        }
    }

    /// The newest decoded record for `id` with every resolved server attached
    fn assemble(&self, id: &str) -> Option<Instance> {
        let mut newest: Option<(u64, Instance)> = None;
        let mut servers = Vec::new();

        for entry in self.resolved.iter() {
            let announcement = entry.value();
            if announcement.instance.id != id {
                continue;
            }
            if newest.as_ref().map_or(true, |(seq, _)| announcement.seq > *seq) {
                newest = Some((announcement.seq, announcement.instance.clone()));
            }
            servers.push(announcement.server.clone());
        }

        let (_, mut instance) = newest?;
        for server in servers {
            instance = instance.with_server(server);
        }
        Some(instance)
    }
}

fn upsert(pool: &Pool, instance: Instance) {
    let (service, id) = (instance.service.clone(), instance.id.clone());
    match pool.register_instance(instance) {
        Ok(()) => debug!(service = %service, instance = %id, "Instance resolved via mDNS"),
        Err(Error::UnknownService(_)) => {
            debug!(service = %service, instance = %id, "Skipping instance of undeclared service");
        }
        Err(e) => warn!(instance = %id, error = %e, "Failed to register mDNS instance"),
    }
}

/// mDNS registry backend
#[derive(Clone)]
pub struct MdnsRegistry {
    config: MdnsConfig,
    options: RegistryOptions,
    daemon: ServiceDaemon,
    state: Arc<MdnsState>,
    token: CancellationToken,
}

impl fmt::Debug for MdnsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MdnsRegistry")
            .field("config", &self.config)
            .field("options", &self.options)
            .field("registered", &self.state.registered.len())
            .field("resolved", &self.state.resolved.len())
            .finish()
    }
}

impl MdnsRegistry {
    /// Create the registry and its mDNS daemon
    pub fn new(config: &MdnsConfig, options: RegistryOptions) -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| Error::connection("mdns", format!("Failed to create mDNS daemon: {e}")))?;

        debug!(domain = %config.domain, "mDNS daemon started");

        Ok(Self {
            config: config.clone(),
            options,
            daemon,
            state: Arc::new(MdnsState::default()),
            token: CancellationToken::new(),
        })
    }

    fn browse_instances(&self, service_type: String, pool: Arc<Pool>) -> Result<()> {
        let receiver = self
            .daemon
            .browse(&service_type)
            .map_err(|e| Error::Discovery(format!("Failed to browse {service_type}: {e}")))?;

        info!(service_type = %service_type, "Browsing mDNS instances");

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = this.token.cancelled() => break,
                    event = receiver.recv_async() => event,
                };

                match event {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        this.state
                            .on_resolved(&info, this.config.enable_ipv6, &pool)
                            .await
                    }
                    Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                        this.state.on_removed(&fullname, &pool)
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(service_type = %service_type, error = %e, "mDNS receiver error");
                        break;
                    }
                }
            }

            if let Err(e) = this.daemon.stop_browse(&service_type) {
                debug!(error = %e, "mDNS stop_browse returned error");
            }
        });

        Ok(())
    }
}

/// Build one DNS-SD announcement per server of the instance.
///
/// Every announcement carries the same instance record; the server it
/// stands for is named by the `server*` keys and the SRV port. Server and
/// topic lists are left out of TXT. Fails when the instance has no
/// servers, when two servers map to the same service type, or when a
/// property does not fit one TXT string.
fn announcements(config: &MdnsConfig, instance: &Instance) -> Result<Vec<ServiceInfo>> {
    if instance.servers.is_empty() {
        return Err(Error::Registry(format!(
            "instance {} has no servers to announce over mDNS",
            instance.id
        )));
    }

    let mut base = ServiceRecord::from_instance(instance).metadata;
    base.delete(record::SERVERS);
    base.delete(record::TOPICS);
    let host = format!("{}.{}", host_label(&instance.id), config.domain);

    let mut servers: Vec<&Server> = instance.servers.values().collect();
    servers.sort_by(|a, b| a.id.cmp(&b.id));

    let mut types = HashSet::new();
    let mut infos = Vec::with_capacity(servers.len());
    for server in servers {
        let service_type = config.service_type(&server.kind, server.network());
        if !types.insert(service_type.clone()) {
            return Err(Error::Registry(format!(
                "instance {} announces more than one server as {service_type}",
                instance.id
            )));
        }

        let md = base
            .copy()
            .with(SERVER_ID, server.id.as_str())
            .with(SERVER_NAME, server.name.as_str())
            .with(SERVER_HOST, server.address.as_str());
        for (key, value) in md.iter() {
            let size = key.len() + 1 + value.len();
            if size > MAX_TXT_PROPERTY {
                return Err(Error::Registry(format!(
                    "TXT property '{key}' of instance {} is {size} bytes, over the {MAX_TXT_PROPERTY}-byte limit",
                    instance.id
                )));
            }
        }
        let properties: HashMap<String, String> = md.into();

        let ip = match server.address.parse::<IpAddr>() {
            Ok(ip) if !ip.is_unspecified() => ip.to_string(),
            _ => String::new(),
        };

        let info = ServiceInfo::new(
            &service_type,
            &instance.id,
            &host,
            ip.as_str(),
            server.port,
            properties,
        )
        .map_err(|e| Error::Registry(format!("Invalid mDNS service info: {e}")))?;

        infos.push(if ip.is_empty() {
            info.enable_addr_auto()
        } else {
            info
        });
    }

    Ok(infos)
}

/// Label usable as a host name
fn host_label(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

/// Split a resolved announcement into the instance record and the server
/// it carries. `None` when the TXT properties do not name a service.
///
/// An unspecified instance address takes the resolved ip; a server without
/// an advertised host takes it too.
fn decode_announcement(
    fullname: &str,
    service_type: &str,
    lines: &[String],
    ip: Option<IpAddr>,
    port: u16,
) -> Option<(ServiceRecord, Server)> {
    let mut metadata = Metadata::from_lines(lines);
    let service = metadata.get(metadata::NAME).filter(|n| !n.is_empty())?.to_string();
    let kind = service_type
        .split('.')
        .nth(1)
        .and_then(|label| label.strip_prefix('_'))
        .filter(|kind| !kind.is_empty())?
        .to_ascii_lowercase();

    let id = match metadata.get(metadata::ID).filter(|id| !id.is_empty()) {
        Some(id) => id.to_string(),
        None => fullname
            .strip_suffix(service_type)
            .map(|label| label.trim_end_matches('.'))
            .unwrap_or(fullname)
            .to_string(),
    };

    let server_id = metadata
        .delete(SERVER_ID)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("{kind}-{port}"));
    let server_name = metadata.delete(SERVER_NAME).unwrap_or_default();
    let server_host = metadata
        .delete(SERVER_HOST)
        .filter(|host| !host.is_empty() && !host.parse::<IpAddr>().is_ok_and(|ip| ip.is_unspecified()))
        .or_else(|| ip.map(|ip| ip.to_string()))
        .unwrap_or_default();

    if let (Some(ip), Some(advertised)) = (
        ip,
        metadata
            .get(metadata::ADDRESS)
            .and_then(|a| a.parse::<SocketAddr>().ok()),
    ) {
        if advertised.ip().is_unspecified() {
            metadata.set(metadata::ADDRESS, SocketAddr::new(ip, advertised.port()).to_string());
        }
    }

    let server = Server::new(server_id, kind, server_host, port).with_name(server_name);
    let record = ServiceRecord {
        id,
        service,
        address: ip.map(|ip| ip.to_string()).unwrap_or_default(),
        port,
        tags: Vec::new(),
        metadata,
    };
    Some((record, server))
}

impl fmt::Display for MdnsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.options.name, self.options.id)
    }
}

#[async_trait]
impl Registry for MdnsRegistry {
    fn context(&self) -> &CancellationToken {
        &self.token
    }

    fn options(&self) -> &RegistryOptions {
        &self.options
    }

    async fn register(&self, instance: &Instance) -> Result<()> {
        let infos = announcements(&self.config, instance).map_err(|e| {
            error!(instance = %instance.id, error = %e, "mDNS register failed");
            e
        })?;

        let mut fullnames = Vec::with_capacity(infos.len());
        for info in infos {
            let fullname = info.get_fullname().to_string();
            self.daemon.register(info).map_err(|e| {
                error!(instance = %instance.id, fullname = %fullname, error = %e, "mDNS register failed");
                Error::Registry(format!("Failed to register {fullname}: {e}"))
            })?;
            fullnames.push(fullname);
        }

        info!(
            service = %instance.service,
            instance = %instance.id,
            announcements = fullnames.len(),
            "Registered instance via mDNS"
        );
        self.state.registered.insert(instance.id.clone(), fullnames);
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        let Some((_, fullnames)) = self.state.registered.remove(id) else {
            debug!(instance = %id, "Instance was not announced via mDNS");
            return Ok(());
        };

        for fullname in fullnames {
            self.daemon.unregister(&fullname).map_err(|e| {
                error!(instance = %id, fullname = %fullname, error = %e, "mDNS unregister failed");
                Error::Registry(format!("Failed to unregister {fullname}: {e}"))
            })?;
        }

        info!(instance = %id, "Deregistered instance from mDNS");
        Ok(())
    }

    async fn check_instance(&self, id: &str) -> bool {
        self.state.check(id)
    }

    async fn watch(&self, pool: Arc<Pool>) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Discovery(format!("{self} has been stopped")));
        }

        let meta_query = self.config.meta_query();
        let receiver = self
            .daemon
            .browse(&meta_query)
            .map_err(|e| Error::Discovery(format!("Failed to browse mDNS service types: {e}")))?;

        info!(registry = %self, query = %meta_query, "Starting mDNS watch");

        let this = self.clone();
        tokio::spawn(async move {
            let mut types = TypeWatchSet::new(&this.config.service_prefix, &this.config.protocols);

            loop {
                let event = tokio::select! {
                    _ = this.token.cancelled() => break,
                    event = receiver.recv_async() => event,
                };

                match event {
                    Ok(ServiceEvent::ServiceFound(_, service_type)) => {
                        if !types.admit(&service_type) {
                            continue;
                        }
                        if let Err(e) = this.browse_instances(service_type, pool.clone()) {
                            warn!(error = %e, "Failed to start instance browse");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "mDNS receiver error");
                        break;
                    }
                }
            }

            if let Err(e) = this.daemon.stop_browse(&meta_query) {
                debug!(error = %e, "mDNS stop_browse returned error");
            }
            info!(types = types.len(), "mDNS watch stopped");
        });

        Ok(())
    }

    fn stop(&self) {
        self.token.cancel();
        if let Err(e) = self.daemon.shutdown() {
            // "sending on a closed channel" when the daemon is already gone
            debug!(error = %e, "mDNS daemon shutdown returned error");
        }
    }
}
