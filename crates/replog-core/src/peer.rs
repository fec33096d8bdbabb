//! Peers and cluster configuration
//!
//! A peer URL must be `tcp://<ip>:<port>` with a literal, non-wildcard
//! IP and a non-zero port; hostnames, paths, queries, fragments and
//! userinfo are rejected. Cluster configuration travels through the log
//! as a distinguished `Config` entry carrying the encoded peer list.

use crate::{CoreError, PeerId, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Validated `tcp://ip:port` endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerUrl(String);

impl PeerUrl {
    /// Parse and validate a peer URL
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("tcp://")
            .ok_or_else(|| CoreError::InvalidUrl(format!("{}: scheme must be tcp", url)))?;

        if rest.contains(['/', '?', '#', '@']) {
            return Err(CoreError::InvalidUrl(format!(
                "{}: path, query, fragment and userinfo are not allowed",
                url
            )));
        }

        let addr = SocketAddr::from_str(rest)
            .map_err(|_| CoreError::InvalidUrl(format!("{}: expected literal ip:port", url)))?;

        if addr.ip().is_unspecified() {
            return Err(CoreError::InvalidUrl(format!(
                "{}: wildcard address not allowed",
                url
            )));
        }
        if addr.port() == 0 {
            return Err(CoreError::InvalidUrl(format!("{}: port must be non-zero", url)));
        }

        Ok(Self(format!("tcp://{}", addr)))
    }

    /// The socket address the URL names
    pub fn socket_addr(&self) -> SocketAddr {
        let rest = &self.0["tcp://".len()..];
        SocketAddr::from_str(rest).expect("validated at construction")
    }

    /// The IP portion
    pub fn ip(&self) -> IpAddr {
        self.socket_addr().ip()
    }

    /// String form, `tcp://ip:port`
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerUrl {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// One cluster member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Stable identifier
    pub id: PeerId,

    /// RPC endpoint
    pub url: PeerUrl,
}

impl Peer {
    /// Create a peer from an id and a URL string
    pub fn new(id: impl Into<PeerId>, url: &str) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            url: PeerUrl::parse(url)?,
        })
    }
}

/// The peer set of a cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// All members, leader included
    pub peers: Vec<Peer>,
}

impl ClusterConfig {
    /// Build a config, rejecting duplicate ids or URLs
    pub fn new(peers: Vec<Peer>) -> Result<Self> {
        for (i, peer) in peers.iter().enumerate() {
            for other in &peers[..i] {
                if other.id == peer.id {
                    return Err(CoreError::InvalidArgument(format!(
                        "duplicate peer id: {}",
                        peer.id
                    )));
                }
                if other.url == peer.url {
                    return Err(CoreError::InvalidArgument(format!(
                        "duplicate peer url: {}",
                        peer.url
                    )));
                }
            }
        }
        Ok(Self { peers })
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True when no members are configured
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Votes needed for quorum in this cluster
    pub fn majority(&self) -> usize {
        majority_of(self.peers.len())
    }

    /// Look up a peer by id
    pub fn peer(&self, id: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == id)
    }

    /// Serialize for a `Config` log entry payload
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        use bincode::config;
        Ok(bincode::encode_to_vec(
            bincode::serde::Compat(self),
            config::standard(),
        )?)
    }

    /// Deserialize from a `Config` log entry payload
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        use bincode::config;
        let (compat, _): (bincode::serde::Compat<Self>, _) =
            bincode::decode_from_slice(bytes, config::standard())?;
        Ok(compat.0)
    }
}

/// Votes needed for a majority of `n` members; a lone peer is its own
/// majority, as is an unconfigured cluster of zero
pub fn majority_of(n: usize) -> usize {
    if n == 0 {
        1
    } else {
        n / 2 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_urls() {
        for url in ["tcp://127.0.0.1:8047", "tcp://[::1]:9001", "tcp://10.0.0.3:65535"] {
            assert!(PeerUrl::parse(url).is_ok(), "{} should parse", url);
        }
    }

    #[test]
    fn test_invalid_urls() {
        for url in [
            "http://127.0.0.1:8047",
            "tcp://localhost:8047",
            "tcp://127.0.0.1",
            "tcp://127.0.0.1:0",
            "tcp://0.0.0.0:8047",
            "tcp://127.0.0.1:8047/path",
            "tcp://user@127.0.0.1:8047",
            "tcp://127.0.0.1:8047?q=1",
        ] {
            assert!(PeerUrl::parse(url).is_err(), "{} should be rejected", url);
        }
    }

    #[test]
    fn test_socket_addr() {
        let url = PeerUrl::parse("tcp://127.0.0.1:8047").unwrap();
        assert_eq!(url.socket_addr().port(), 8047);
        assert!(url.ip().is_loopback());
    }

    #[test]
    fn test_majority() {
        assert_eq!(majority_of(0), 1);
        assert_eq!(majority_of(1), 1);
        assert_eq!(majority_of(2), 2);
        assert_eq!(majority_of(3), 2);
        assert_eq!(majority_of(4), 3);
        assert_eq!(majority_of(5), 3);
    }

    #[test]
    fn test_config_rejects_duplicates() {
        let a = Peer::new("a", "tcp://127.0.0.1:8047").unwrap();
        let b = Peer::new("a", "tcp://127.0.0.1:8048").unwrap();
        assert!(ClusterConfig::new(vec![a.clone(), b]).is_err());

        let c = Peer::new("c", "tcp://127.0.0.1:8047").unwrap();
        assert!(ClusterConfig::new(vec![a, c]).is_err());
    }

    #[test]
    fn test_config_roundtrip() {
        let config = ClusterConfig::new(vec![
            Peer::new("a", "tcp://127.0.0.1:8047").unwrap(),
            Peer::new("b", "tcp://127.0.0.1:8147").unwrap(),
        ])
        .unwrap();

        let bytes = config.to_bytes().unwrap();
        let decoded = ClusterConfig::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, config);
        assert_eq!(decoded.majority(), 2);
        assert!(decoded.peer("b").is_some());
    }
}
