//! Network-aware advertised addresses

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Address an instance advertises, tagged by network
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "network", content = "address", rename_all = "lowercase")]
pub enum Address {
    /// TCP endpoint
    Tcp(SocketAddr),
    /// UDP endpoint
    Udp(SocketAddr),
    /// Unix domain socket path
    Unix(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Any,
    V4,
    V6,
}

impl Family {
    fn from_network(network: &str) -> Self {
        if network.ends_with('4') {
            Family::V4
        } else if network.ends_with('6') {
            Family::V6
        } else {
            Family::Any
        }
    }

    fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Family::Any => true,
            Family::V4 => addr.is_ipv4(),
            Family::V6 => addr.is_ipv6(),
        }
    }
}

impl Address {
    /// Resolve `address` on `network`.
    ///
    /// Dispatches on the network prefix: `tcp*` and `udp*` go through host
    /// resolution (a trailing `4`/`6` restricts the address family), `unix*`
    /// takes the address as a socket path. A host-less address such as
    /// `":9000"` binds the unspecified address.
    pub async fn resolve(network: &str, address: &str) -> Result<Self> {
        let network = network.to_ascii_lowercase();

        if network.starts_with("unix") {
            if address.is_empty() {
                return Err(Error::InvalidAddress("empty unix socket path".to_string()));
            }
            return Ok(Address::Unix(PathBuf::from(address)));
        }

        let wrap: fn(SocketAddr) -> Address = if network.starts_with("tcp") {
            Address::Tcp
        } else if network.starts_with("udp") {
            Address::Udp
        } else {
            return Err(Error::InvalidAddress(format!(
                "unsupported network '{network}' for {address}"
            )));
        };

        let family = Family::from_network(&network);
        let target = with_default_host(address, family);

        if let Ok(addr) = target.parse::<SocketAddr>() {
            return if family.accepts(&addr) {
                Ok(wrap(addr))
            } else {
                Err(Error::InvalidAddress(format!(
                    "{address} does not match network {network}"
                )))
            };
        }

        let mut candidates = tokio::net::lookup_host(target.as_str())
            .await
            .map_err(|e| Error::InvalidAddress(format!("{address}: {e}")))?;

        candidates
            .find(|addr| family.accepts(addr))
            .map(wrap)
            .ok_or_else(|| {
                Error::InvalidAddress(format!("no {network} address found for {address}"))
            })
    }

    /// Network name (`tcp`, `udp` or `unix`)
    pub fn network(&self) -> &'static str {
        match self {
            Address::Tcp(_) => "tcp",
            Address::Udp(_) => "udp",
            Address::Unix(_) => "unix",
        }
    }

    /// Socket address for IP networks
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Address::Tcp(addr) | Address::Udp(addr) => Some(*addr),
            Address::Unix(_) => None,
        }
    }

    /// Port for IP networks
    pub fn port(&self) -> Option<u16> {
        self.socket_addr().map(|addr| addr.port())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp(addr) | Address::Udp(addr) => write!(f, "{addr}"),
            Address::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

fn with_default_host(address: &str, family: Family) -> String {
    if address.starts_with(':') {
        match family {
            Family::V6 => format!("[::]{address}"),
            _ => format!("0.0.0.0{address}"),
        }
    } else {
        address.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_tcp() {
        let addr = Address::resolve("tcp", "10.0.0.1:9000").await.unwrap();
        assert_eq!(addr, Address::Tcp("10.0.0.1:9000".parse().unwrap()));
        assert_eq!(addr.network(), "tcp");
        assert_eq!(addr.to_string(), "10.0.0.1:9000");
        assert_eq!(addr.port(), Some(9000));
    }

    #[tokio::test]
    async fn test_resolve_udp() {
        let addr = Address::resolve("udp4", "127.0.0.1:53").await.unwrap();
        assert!(matches!(addr, Address::Udp(_)));
    }

    #[tokio::test]
    async fn test_resolve_unix() {
        let addr = Address::resolve("unix", "/tmp/sicky.sock").await.unwrap();
        assert_eq!(addr, Address::Unix(PathBuf::from("/tmp/sicky.sock")));
        assert_eq!(addr.socket_addr(), None);
    }

    #[tokio::test]
    async fn test_resolve_hostless() {
        let addr = Address::resolve("tcp", ":0").await.unwrap();
        assert_eq!(addr, Address::Tcp("0.0.0.0:0".parse().unwrap()));

        let addr = Address::resolve("tcp6", ":8080").await.unwrap();
        assert_eq!(addr, Address::Tcp("[::]:8080".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_resolve_family_mismatch() {
        assert!(Address::resolve("tcp4", "[::1]:80").await.is_err());
    }

    #[tokio::test]
    async fn test_resolve_unknown_network() {
        let err = Address::resolve("sctp", "10.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, Error::InvalidAddress(_)));
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let addr = Address::resolve("tcp4", "localhost:7000").await.unwrap();
        assert_eq!(addr.socket_addr().unwrap().port(), 7000);
    }

    #[test]
    fn test_serde_shape() {
        let addr = Address::Tcp("10.0.0.1:9000".parse().unwrap());
        let json = serde_json::to_value(&addr).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"network": "tcp", "address": "10.0.0.1:9000"})
        );
    }
}
