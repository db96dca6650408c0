//! Manually-updatable resolvers

use async_trait::async_trait;
use sicky_core::{Address, Error, Result};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tonic::transport::{Channel, Endpoint};
use tower::discover::Change;
use tracing::{debug, trace};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A resolver whose address list is pushed from outside
#[async_trait]
pub trait ResolverState: Send + Sync {
    /// Replace the resolved address list
    async fn update_state(&self, addresses: Vec<Address>) -> Result<()>;
}

/// Resolver that just publishes the latest address list
#[derive(Debug)]
pub struct ManualResolver {
    tx: watch::Sender<Vec<Address>>,
}

impl Default for ManualResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualResolver {
    /// Create an empty resolver
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Vec::new());
        Self { tx }
    }

    /// Follow address list updates
    pub fn subscribe(&self) -> watch::Receiver<Vec<Address>> {
        self.tx.subscribe()
    }

    /// Current address list
    pub fn addresses(&self) -> Vec<Address> {
        self.tx.borrow().clone()
    }
}

#[async_trait]
impl ResolverState for ManualResolver {
    async fn update_state(&self, addresses: Vec<Address>) -> Result<()> {
        trace!(count = addresses.len(), "Manual resolver updated");
        self.tx.send_replace(addresses);
        Ok(())
    }
}

/// Resolver feeding a tonic balanced channel.
///
/// Each update is diffed against the current endpoint set and only the
/// difference is sent to the balancer, so unchanged backends keep their
/// connections.
#[derive(Debug)]
pub struct BalancedResolver {
    channel: Channel,
    changes: mpsc::Sender<Change<SocketAddr, Endpoint>>,
    current: Mutex<HashSet<SocketAddr>>,
    scheme: String,
    connect_timeout: Duration,
}

impl BalancedResolver {
    /// Create a balanced channel buffering up to `capacity` changes
    pub fn new(capacity: usize) -> Self {
        let (channel, changes) = Channel::balance_channel::<SocketAddr>(capacity.max(1));
        Self {
            channel,
            changes,
            current: Mutex::new(HashSet::new()),
            scheme: "http".to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Use `https` endpoints
    pub fn with_tls(mut self) -> Self {
        self.scheme = "https".to_string();
        self
    }

    /// Set the per-endpoint connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Client channel balancing over the resolved endpoints
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// Endpoints currently handed to the balancer
    pub async fn endpoints(&self) -> Vec<SocketAddr> {
        let mut endpoints: Vec<SocketAddr> = self.current.lock().await.iter().copied().collect();
        endpoints.sort();
        endpoints
    }

    fn endpoint(&self, addr: SocketAddr) -> Result<Endpoint> {
        Endpoint::from_shared(format!("{}://{addr}", self.scheme))
            .map(|endpoint| endpoint.connect_timeout(self.connect_timeout))
            .map_err(|e| Error::InvalidAddress(format!("{addr}: {e}")))
    }
}

/// Socket addresses to insert and to remove to go from `current` to `next`
pub fn diff(
    current: &HashSet<SocketAddr>,
    next: &HashSet<SocketAddr>,
) -> (Vec<SocketAddr>, Vec<SocketAddr>) {
    let mut inserts: Vec<SocketAddr> = next.difference(current).copied().collect();
    let mut removes: Vec<SocketAddr> = current.difference(next).copied().collect();
    inserts.sort();
    removes.sort();
    (inserts, removes)
}

#[async_trait]
impl ResolverState for BalancedResolver {
    async fn update_state(&self, addresses: Vec<Address>) -> Result<()> {
        let next: HashSet<SocketAddr> = addresses
            .iter()
            .filter_map(|addr| {
                let sock = addr.socket_addr();
                if sock.is_none() {
                    debug!(address = %addr, "Skipping non-IP address for balanced channel");
                }
                sock
            })
            .collect();

        let mut current = self.current.lock().await;
        let (inserts, removes) = diff(&current, &next);

        for addr in removes {
            self.changes
                .send(Change::Remove(addr))
                .await
                .map_err(|_| Error::Internal("balanced channel closed".to_string()))?;
            current.remove(&addr);
            debug!(endpoint = %addr, "Removed endpoint from balancer");
        }

        for addr in inserts {
            let endpoint = self.endpoint(addr)?;
            self.changes
                .send(Change::Insert(addr, endpoint))
                .await
                .map_err(|_| Error::Internal("balanced channel closed".to_string()))?;
            current.insert(addr);
            debug!(endpoint = %addr, "Added endpoint to balancer");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn set(addrs: &[&str]) -> HashSet<SocketAddr> {
        addrs.iter().map(|a| a.parse().unwrap()).collect()
    }

    #[test]
    fn test_diff() {
        let current = set(&["10.0.0.1:9000", "10.0.0.2:9000"]);
        let next = set(&["10.0.0.2:9000", "10.0.0.3:9000"]);

        let (inserts, removes) = diff(&current, &next);
        assert_eq!(inserts, vec!["10.0.0.3:9000".parse::<SocketAddr>().unwrap()]);
        assert_eq!(removes, vec!["10.0.0.1:9000".parse::<SocketAddr>().unwrap()]);

        let (inserts, removes) = diff(&next, &next);
        assert!(inserts.is_empty() && removes.is_empty());
    }

    #[tokio::test]
    async fn test_manual_resolver() {
        let resolver = ManualResolver::new();
        let mut rx = resolver.subscribe();

        let addrs = vec![Address::Tcp("10.0.0.1:9000".parse().unwrap())];
        resolver.update_state(addrs.clone()).await.unwrap();

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), addrs);
        assert_eq!(resolver.addresses(), addrs);
    }

    #[tokio::test]
    async fn test_balanced_resolver_tracks_endpoints() {
        let resolver = BalancedResolver::new(16);

        resolver
            .update_state(vec![
                Address::Tcp("127.0.0.1:9000".parse().unwrap()),
                Address::Tcp("127.0.0.1:9001".parse().unwrap()),
                Address::Unix(PathBuf::from("/tmp/sicky.sock")),
            ])
            .await
            .unwrap();
        assert_eq!(resolver.endpoints().await.len(), 2);

        resolver
            .update_state(vec![Address::Tcp("127.0.0.1:9001".parse().unwrap())])
            .await
            .unwrap();
        assert_eq!(
            resolver.endpoints().await,
            vec!["127.0.0.1:9001".parse::<SocketAddr>().unwrap()]
        );
    }
}
