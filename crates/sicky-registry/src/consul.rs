//! Consul registry backend

use crate::pool::Pool;
use crate::provider::{Registry, RegistryOptions};
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderValue, Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use sicky_config::ConsulConfig;
use sicky_core::{metadata, Error, Instance, Metadata, Result, Server, ServiceRecord};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";
const CHECK_INTERVAL: &str = "10s";
const CHECK_TIMEOUT: &str = "5s";
const DEFAULT_DEREGISTER_AFTER: Duration = Duration::from_secs(60);

/// Consul registry backend
#[derive(Debug, Clone)]
pub struct ConsulRegistry {
    /// Consul HTTP API address without trailing slash
    address: String,

    config: ConsulConfig,

    options: RegistryOptions,

    /// HTTP client
    client: Client<HttpConnector, Full<Bytes>>,

    token: CancellationToken,
}

/// Entry of `GET /v1/agent/services`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    service: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    port: u16,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    meta: Option<HashMap<String, String>>,
}

impl From<AgentService> for ServiceRecord {
    fn from(svc: AgentService) -> Self {
        ServiceRecord {
            id: svc.id,
            service: svc.service,
            address: svc.address,
            port: svc.port,
            tags: svc.tags.unwrap_or_default(),
            metadata: svc.meta.map(Metadata::from).unwrap_or_default(),
        }
    }
}

/// Body of `PUT /v1/agent/service/register`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceRegistration {
    #[serde(rename = "ID")]
    id: String,
    name: String,
    tags: Vec<String>,
    address: String,
    port: u16,
    meta: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    check: Option<AgentServiceCheck>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceCheck {
    #[serde(rename = "HTTP")]
    http: String,
    interval: String,
    timeout: String,
    deregister_critical_service_after: String,
}

struct ConsulResponse {
    status: StatusCode,
    index: Option<u64>,
    body: Bytes,
}

impl ConsulRegistry {
    /// Create a Consul registry without contacting the agent
    pub fn new(config: &ConsulConfig, options: RegistryOptions) -> Result<Self> {
        let url = url::Url::parse(&config.address)
            .map_err(|e| Error::connection("consul", format!("Invalid address: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::connection(
                "consul",
                format!("Unsupported scheme '{}'", url.scheme()),
            ));
        }

        let client = Client::builder(TokioExecutor::new()).build_http();

        Ok(Self {
            address: config.address.trim_end_matches('/').to_string(),
            config: config.clone(),
            options,
            client,
            token: CancellationToken::new(),
        })
    }

    /// Create a Consul registry and make sure the agent answers
    pub async fn connect(config: &ConsulConfig, options: RegistryOptions) -> Result<Self> {
        let registry = Self::new(config, options)?;

        let uri = registry.build_url("/v1/status/leader", &[])?;
        let res = registry
            .request(Method::GET, uri, None)
            .await
            .map_err(|e| Error::connection("consul", e.to_string()))?;
        if !res.status.is_success() {
            return Err(Error::connection(
                "consul",
                format!("Leader check returned {}", res.status),
            ));
        }

        info!(address = %registry.address, "Connected to Consul");
        Ok(registry)
    }

    fn base_url(&self, path: &str) -> Result<url::Url> {
        url::Url::parse(&format!("{}{}", self.address, path))
            .map_err(|e| Error::Registry(format!("Invalid Consul URL: {e}")))
    }

    fn finish_url(&self, mut url: url::Url, query: &[(&str, String)]) -> Result<Uri> {
        let mut pairs: Vec<(&str, String)> = query.to_vec();
        if let Some(dc) = &self.config.datacenter {
            pairs.push(("dc", dc.clone()));
        }
        if !pairs.is_empty() {
            url.query_pairs_mut().extend_pairs(pairs);
        }

        url.as_str()
            .parse()
            .map_err(|e| Error::Registry(format!("Invalid Consul URL: {e}")))
    }

    /// Build Consul API URL
    fn build_url(&self, path: &str, query: &[(&str, String)]) -> Result<Uri> {
        self.finish_url(self.base_url(path)?, query)
    }

    /// Build an agent URL ending in an instance id, percent-encoded as one
    /// path segment
    fn instance_url(&self, path: &str, id: &str) -> Result<Uri> {
        let mut url = self.base_url(path)?;
        url.path_segments_mut()
            .map_err(|()| Error::Registry(format!("Consul address {} cannot take a path", self.address)))?
            .pop_if_empty()
            .push(id);
        self.finish_url(url, &[])
    }

    /// Make HTTP request to Consul
    async fn request(&self, method: Method, uri: Uri, body: Option<Vec<u8>>) -> Result<ConsulResponse> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = self.config.token.as_deref().filter(|t| !t.is_empty()) {
            let value = HeaderValue::from_str(token)
                .map_err(|e| Error::Registry(format!("Invalid Consul token: {e}")))?;
            builder = builder.header(TOKEN_HEADER, value);
        }
        if body.is_some() {
            builder = builder.header(http::header::CONTENT_TYPE, "application/json");
        }

        let req = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| Error::Registry(format!("Failed to build request: {e}")))?;

        let res = self
            .client
            .request(req)
            .await
            .map_err(|e| Error::Registry(format!("Consul request failed: {e}")))?;

        let status = res.status();
        let index = res
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let body = res
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Registry(format!("Failed to read response: {e}")))?
            .to_bytes();

        Ok(ConsulResponse { status, index, body })
    }

    /// Build the registration payload for an instance
    fn registration(&self, instance: &Instance) -> AgentServiceRegistration {
        let mut record = ServiceRecord::from_instance(instance);

        if let Ok(ip) = record.address.parse::<IpAddr>() {
            if ip.is_unspecified() {
                let loopback = if ip.is_ipv4() {
                    IpAddr::V4(Ipv4Addr::LOCALHOST)
                } else {
                    IpAddr::V6(Ipv6Addr::LOCALHOST)
                };
                record.address = loopback.to_string();
                let endpoint = Server::new("", "", record.address.as_str(), record.port).endpoint();
                record.metadata.set(metadata::ADDRESS, endpoint);
            }
        }

        let check = instance.check.as_ref().map(|url| AgentServiceCheck {
            http: url.clone(),
            interval: CHECK_INTERVAL.to_string(),
            timeout: CHECK_TIMEOUT.to_string(),
            deregister_critical_service_after: go_duration(
                instance.ttl.unwrap_or(DEFAULT_DEREGISTER_AFTER),
            ),
        });

        AgentServiceRegistration {
            id: record.id,
            name: record.service,
            tags: record.tags,
            address: record.address,
            port: record.port,
            meta: record.metadata.into(),
            check,
        }
    }

    /// List the agent's services and upsert every one into the pool.
    ///
    /// Entries of services the pool does not know are skipped. Returns the
    /// number of upserted instances.
    pub async fn sync(&self, pool: &Pool) -> Result<usize> {
        let uri = self.build_url("/v1/agent/services", &[])?;
        let res = self.request(Method::GET, uri, None).await?;
        if !res.status.is_success() {
            return Err(Error::Discovery(format!(
                "Consul agent services returned {}",
                res.status
            )));
        }

        let services: HashMap<String, AgentService> = serde_json::from_slice(&res.body)
            .map_err(|e| Error::Discovery(format!("Failed to parse services: {e}")))?;

        let mut count = 0;
        for svc in services.into_values() {
            let instance = ServiceRecord::from(svc).into_instance().await;
            match pool.register_instance(instance) {
                Ok(()) => count += 1,
                Err(Error::UnknownService(name)) => {
                    debug!(service = %name, "Skipping instance of undeclared service");
                }
                Err(e) => warn!(error = %e, "Failed to register instance from Consul"),
            }
        }

        debug!(count, "Synced instances from Consul");
        Ok(count)
    }

    /// One blocking query on the catalog; returns the reported index
    async fn blocking_query(&self, index: u64) -> Result<u64> {
        let wait = self.config.wait_time;
        let uri = self.build_url(
            "/v1/catalog/services",
            &[
                ("index", index.to_string()),
                ("wait", go_duration(wait)),
            ],
        )?;

        // Consul adds up to wait/16 of jitter to blocking queries
        let deadline = wait + wait / 16 + Duration::from_secs(5);
        let res = tokio::time::timeout(deadline, self.request(Method::GET, uri, None))
            .await
            .map_err(|_| Error::Discovery("Consul blocking query timed out".to_string()))??;

        if !res.status.is_success() {
            return Err(Error::Discovery(format!(
                "Consul catalog returned {}",
                res.status
            )));
        }

        res.index
            .ok_or_else(|| Error::Discovery(format!("Missing {INDEX_HEADER} header")))
    }

    async fn watch_loop(self, pool: Arc<Pool>) {
        info!(registry = %self, "Starting Consul watch");
        let mut index = 0u64;

        loop {
            let result = tokio::select! {
                _ = self.token.cancelled() => break,
                result = self.blocking_query(index) => result,
            };

            match result {
                Ok(reported) => {
                    let (next, changed) = next_index(index, reported);
                    index = next;
                    if !changed {
                        continue;
                    }

                    debug!(index, "Consul catalog changed");
                    if let Err(e) = self.sync(&pool).await {
                        warn!(error = %e, "Consul sync failed");
                    }
                    let report = pool.purge_instances().await;
                    if report.removed_count() > 0 {
                        info!(removed = report.removed_count(), "Purged instances after Consul change");
                    }
                }
                Err(e) => {
                    error!(error = %e, retry_in = ?self.config.retry_interval, "Consul watch request failed");
                    tokio::select! {
                        _ = self.token.cancelled() => break,
                        _ = tokio::time::sleep(self.config.retry_interval) => {}
                    }
                }
            }
        }

        info!(registry = %self, "Consul watch stopped");
    }
}

/// Next blocking-query index and whether the catalog moved.
///
/// An index that goes backwards resets to 0; the index sent to Consul is
/// never 0 after the first answer.
fn next_index(previous: u64, reported: u64) -> (u64, bool) {
    if reported < previous {
        return (0, true);
    }
    (reported.max(1), previous == 0 || reported != previous)
}

/// Render a duration the way Consul parses it (`"90s"`)
fn go_duration(duration: Duration) -> String {
    format!("{}s", duration.as_secs().max(1))
}

impl fmt::Display for ConsulRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.options.name, self.options.id)
    }
}

#[async_trait]
impl Registry for ConsulRegistry {
    fn context(&self) -> &CancellationToken {
        &self.token
    }

    fn options(&self) -> &RegistryOptions {
        &self.options
    }

    async fn register(&self, instance: &Instance) -> Result<()> {
        let payload = serde_json::to_vec(&self.registration(instance))?;
        let uri = self.build_url("/v1/agent/service/register", &[])?;

        let res = self.request(Method::PUT, uri, Some(payload)).await.map_err(|e| {
            error!(instance = %instance.id, error = %e, "Consul register failed");
            e
        })?;

        if !res.status.is_success() {
            let body = String::from_utf8_lossy(&res.body);
            error!(instance = %instance.id, status = %res.status, body = %body, "Consul rejected registration");
            return Err(Error::Registry(format!(
                "Consul register returned {}: {body}",
                res.status
            )));
        }

        info!(service = %instance.service, instance = %instance.id, "Registered instance in Consul");
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        let uri = self.instance_url("/v1/agent/service/deregister", id)?;

        let res = self.request(Method::PUT, uri, None).await.map_err(|e| {
            error!(instance = %id, error = %e, "Consul deregister failed");
            e
        })?;

        if !res.status.is_success() {
            error!(instance = %id, status = %res.status, "Consul rejected deregistration");
            return Err(Error::Registry(format!(
                "Consul deregister returned {}",
                res.status
            )));
        }

        info!(instance = %id, "Deregistered instance from Consul");
        Ok(())
    }

    async fn check_instance(&self, id: &str) -> bool {
        let uri = match self.instance_url("/v1/agent/service", id) {
            Ok(uri) => uri,
            Err(e) => {
                warn!(instance = %id, error = %e, "Cannot check instance");
                return false;
            }
        };

        match self.request(Method::GET, uri, None).await {
            Ok(res) if res.status == StatusCode::OK => true,
            Ok(res) => {
                debug!(instance = %id, status = %res.status, "Instance not known to Consul");
                false
            }
            Err(e) => {
                warn!(instance = %id, error = %e, "Consul instance check failed");
                false
            }
        }
    }

    async fn watch(&self, pool: Arc<Pool>) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Discovery(format!("{self} has been stopped")));
        }

        tokio::spawn(self.clone().watch_loop(pool));
        Ok(())
    }
}
