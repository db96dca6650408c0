//! Redis registry backend
//!
//! Instances are stored as JSON under `<key_prefix><id>` (optionally with an
//! expiry) and every change is announced on the `notify_key` pub/sub
//! channel.

use crate::pool::Pool;
use crate::provider::{Registry, RegistryOptions};
use async_trait::async_trait;
use futures::{stream, StreamExt};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sicky_config::RedisConfig;
use sicky_core::{Error, Instance, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const SCAN_COUNT: usize = 100;
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// Change notice published on the notify channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Notice {
    op: NoticeOp,
    service: String,
    id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum NoticeOp {
    Put,
    Del,
}

/// Redis registry backend
#[derive(Clone)]
pub struct RedisRegistry {
    config: RedisConfig,
    options: RegistryOptions,
    client: redis::Client,
    conn: ConnectionManager,
    token: CancellationToken,
}

impl fmt::Debug for RedisRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisRegistry")
            .field("address", &self.config.address)
            .field("db", &self.config.db)
            .field("key_prefix", &self.config.key_prefix)
            .field("options", &self.options)
            .finish()
    }
}

fn redis_err(e: redis::RedisError) -> Error {
    Error::Registry(format!("Redis error: {e}"))
}

/// Instance id stored under `key`, if the key carries the prefix
fn id_from_key<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix).filter(|id| !id.is_empty())
}

fn parse_notice(payload: &str) -> Result<Notice> {
    let notice: Notice = serde_json::from_str(payload)?;
    if notice.service.is_empty() || notice.id.is_empty() {
        return Err(Error::Discovery(format!("Redis notice without service or id: {payload}")));
    }
    Ok(notice)
}

/// `SET key value [EX ttl]`
fn set_command(config: &RedisConfig, key: &str, value: &str) -> redis::Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(value);
    if let Some(ttl) = config.ttl {
        cmd.arg("EX").arg(ttl.as_secs().max(1));
    }
    cmd
}

/// Add a stored instance to the pool; instances of undeclared services are skipped
fn upsert(pool: &Pool, instance: Instance) -> bool {
    let (service, id) = (instance.service.clone(), instance.id.clone());
    match pool.register_instance(instance) {
        Ok(()) => true,
        Err(Error::UnknownService(_)) => {
            debug!(service = %service, instance = %id, "Skipping instance of undeclared service");
            false
        }
        Err(e) => {
            warn!(instance = %id, error = %e, "Failed to register Redis instance");
            false
        }
    }
}

/// Load the listed entries into the pool, returning how many were upserted
fn upsert_all(pool: &Pool, loaded: Vec<(String, Result<Option<Instance>>)>) -> usize {
    let mut count = 0;
    for (id, result) in loaded {
        match result {
            Ok(Some(instance)) => {
                if upsert(pool, instance) {
                    count += 1;
                }
            }
            Ok(None) => trace!(instance = %id, "Key expired during sync"),
            Err(e) => warn!(instance = %id, error = %e, "Skipping unreadable Redis entry"),
        }
    }
    count
}

fn apply_delete(pool: &Pool, notice: &Notice) {
    if pool.deregister_instance(&notice.service, &notice.id).is_some() {
        info!(service = %notice.service, instance = %notice.id, "Instance removed via Redis");
    }
}

impl RedisRegistry {
    /// Connect to Redis
    pub async fn connect(config: &RedisConfig, options: RegistryOptions) -> Result<Self> {
        let client = redis::Client::open(config.url())
            .map_err(|e| Error::connection("redis", e.to_string()))?;

        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| Error::connection("redis", e.to_string()))?;

        info!(address = %config.address, db = config.db, "Connected to Redis");

        Ok(Self {
            config: config.clone(),
            options,
            client,
            conn,
            token: CancellationToken::new(),
        })
    }

    async fn load(&self, id: &str) -> Result<Option<Instance>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn
            .get(self.config.instance_key(id))
            .await
            .map_err(redis_err)?;

        value
            .map(|json| serde_json::from_str::<Instance>(&json))
            .transpose()
            .map_err(Error::from)
    }

    async fn publish(&self, notice: &Notice) -> Result<()> {
        let payload = serde_json::to_string(notice)?;
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(&self.config.notify_key, payload)
            .await
            .map_err(redis_err)
    }

    async fn scan_keys(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", self.config.key_prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(|e| Error::Discovery(format!("Redis SCAN failed: {e}")))?;

            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }

    /// Load every stored instance into the pool.
    ///
    /// Reads run at most `pool_size` at a time. Returns the number of
    /// upserted instances.
    pub async fn sync(&self, pool: &Pool) -> Result<usize> {
        let keys = self.scan_keys().await?;
        let ids: Vec<String> = keys
            .iter()
            .filter_map(|key| id_from_key(&self.config.key_prefix, key))
            .map(str::to_string)
            .collect();

        let loaded: Vec<(String, Result<Option<Instance>>)> = stream::iter(ids)
            .map(|id| async move {
                let result = self.load(&id).await;
                (id, result)
            })
            .buffer_unordered(self.config.pool_size.max(1))
            .collect()
            .await;

        let count = upsert_all(pool, loaded);
        debug!(count, "Synced instances from Redis");
        Ok(count)
    }

    async fn apply(&self, pool: &Pool, payload: &str) {
        let notice = match parse_notice(payload) {
            Ok(notice) => notice,
            Err(e) => {
                warn!(payload = %payload, error = %e, "Ignoring malformed Redis notice");
                return;
            }
        };

        match notice.op {
            NoticeOp::Put => match self.load(&notice.id).await {
                Ok(Some(instance)) => {
                    upsert(pool, instance);
                }
                Ok(None) => debug!(instance = %notice.id, "Announced instance already gone"),
                Err(e) => warn!(instance = %notice.id, error = %e, "Failed to read announced instance"),
            },
            NoticeOp::Del => apply_delete(pool, &notice),
        }
    }

    async fn subscribe(&self) -> Result<redis::aio::PubSub> {
        let mut pubsub = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| Error::Discovery(format!("Redis pub/sub connection failed: {e}")))?
            .into_pubsub();

        pubsub
            .subscribe(&self.config.notify_key)
            .await
            .map_err(|e| Error::Discovery(format!("Redis SUBSCRIBE failed: {e}")))?;

        Ok(pubsub)
    }

    async fn notify_loop(self, mut pubsub: redis::aio::PubSub, pool: Arc<Pool>) {
        loop {
            {
                let mut messages = Box::pin(pubsub.on_message());
                loop {
                    let msg = tokio::select! {
                        _ = self.token.cancelled() => {
                            info!(registry = %self, "Redis watch stopped");
                            return;
                        }
                        msg = messages.next() => msg,
                    };

                    let Some(msg) = msg else {
                        warn!("Redis notify subscription closed");
                        break;
                    };

                    match msg.get_payload::<String>() {
                        Ok(payload) => self.apply(&pool, &payload).await,
                        Err(e) => warn!(error = %e, "Unreadable Redis notice payload"),
                    }
                }
            }

            pubsub = loop {
                tokio::select! {
                    _ = self.token.cancelled() => return,
                    _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                }

                match self.subscribe().await {
                    Ok(pubsub) => break pubsub,
                    Err(e) => error!(error = %e, retry_in = ?RESUBSCRIBE_DELAY, "Redis resubscribe failed"),
                }
            };

            // notices published while disconnected are lost
            if let Err(e) = self.sync(&pool).await {
                warn!(error = %e, "Redis resync failed");
            }
        }
    }
}

impl fmt::Display for RedisRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.options.name, self.options.id)
    }
}

#[async_trait]
impl Registry for RedisRegistry {
    fn context(&self) -> &CancellationToken {
        &self.token
    }

    fn options(&self) -> &RegistryOptions {
        &self.options
    }

    async fn register(&self, instance: &Instance) -> Result<()> {
        let key = self.config.instance_key(&instance.id);
        let value = serde_json::to_string(instance)?;

        let cmd = set_command(&self.config, &key, &value);

        let mut conn = self.conn.clone();
        cmd.query_async::<_, ()>(&mut conn).await.map_err(|e| {
            error!(instance = %instance.id, error = %e, "Redis register failed");
            redis_err(e)
        })?;

        self.publish(&Notice {
            op: NoticeOp::Put,
            service: instance.service.clone(),
            id: instance.id.clone(),
        })
        .await?;

        info!(service = %instance.service, instance = %instance.id, "Registered instance in Redis");
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        let Some(instance) = self.load(id).await? else {
            debug!(instance = %id, "Instance not stored in Redis");
            return Ok(());
        };

        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.config.instance_key(id))
            .await
            .map_err(|e| {
                error!(instance = %id, error = %e, "Redis deregister failed");
                redis_err(e)
            })?;

        self.publish(&Notice {
            op: NoticeOp::Del,
            service: instance.service,
            id: id.to_string(),
        })
        .await?;

        info!(instance = %id, "Deregistered instance from Redis");
        Ok(())
    }

    async fn check_instance(&self, id: &str) -> bool {
        let mut conn = self.conn.clone();
        match conn.exists::<_, bool>(self.config.instance_key(id)).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(instance = %id, error = %e, "Redis instance check failed");
                false
            }
        }
    }

    async fn watch(&self, pool: Arc<Pool>) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Discovery(format!("{self} has been stopped")));
        }

        let pubsub = self.subscribe().await?;
        let count = self.sync(&pool).await?;

        info!(registry = %self, instances = count, channel = %self.config.notify_key, "Starting Redis watch");
        tokio::spawn(self.clone().notify_loop(pubsub, pool));
        Ok(())
    }
}
