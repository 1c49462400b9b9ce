//! # Peer Identity and Addressing
//!
//! This module defines the data model shared by every layer of the node:
//!
//! - [`Guid`]: 128-bit identifier used for both peers and lookup targets
//! - [`Endpoint`]: host/port pair a peer can be reached at
//! - [`PeerKey`]: the identity used for equality and registry lookups
//! - [`Peer`]: a remote (or the local) node's contact record
//!
//! ## Identity Model
//!
//! A peer's identity is its `Guid` once known. Before first contact (the
//! bootstrap case) the `Guid` is unknown and the peer is identified by its
//! endpoint instead. Address and port are not part of identity once the
//! `Guid` is known: two records with the same `Guid` and different addresses
//! describe the same peer.
//!
//! ## Distance
//!
//! Nearest-peer queries use the Kademlia XOR metric:
//! `distance(a, b) = a XOR b`, compared as an unsigned integer.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Identifier in the overlay keyspace.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Guid(u128);

impl Guid {
    #[inline]
    pub const fn new(value: u128) -> Self {
        Self(value)
    }

    /// Draw a fresh identifier uniformly from the keyspace.
    pub fn random() -> Self {
        Self(rand::random())
    }

    #[inline]
    pub fn as_u128(&self) -> u128 {
        self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &Guid) -> u128 {
        self.0 ^ other.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0.to_be_bytes())
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({})", &self.to_hex()[..8])
    }
}

/// Guids are rendered in decimal, the form operators type on the command line.
impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Guid {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u128>().map(Self)
    }
}

impl From<u128> for Guid {
    fn from(value: u128) -> Self {
        Self(value)
    }
}

/// A reachable host/port pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.contains(':') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Parses `HOST:PORT`, or `[V6]:PORT` for IPv6 literals.
impl FromStr for Endpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .context("endpoint must have the form HOST:PORT")?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            anyhow::bail!("endpoint host must not be empty");
        }
        let port: u16 = port.parse().context("invalid endpoint port")?;
        Ok(Self::new(host, port))
    }
}

/// The identity a peer is compared and indexed by.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PeerKey {
    /// A peer whose `Guid` is known.
    Id(Guid),
    /// A peer that has not identified itself yet.
    Endpoint(Endpoint),
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerKey::Id(id) => write!(f, "{}", id),
            PeerKey::Endpoint(endpoint) => write!(f, "{}", endpoint),
        }
    }
}

impl From<Guid> for PeerKey {
    fn from(id: Guid) -> Self {
        PeerKey::Id(id)
    }
}

impl From<Endpoint> for PeerKey {
    fn from(endpoint: Endpoint) -> Self {
        PeerKey::Endpoint(endpoint)
    }
}

/// Contact record for a node in the overlay.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Peer {
    /// `None` until the peer has identified itself.
    pub id: Option<Guid>,
    pub address: String,
    pub port: u16,
    /// Whether this side opened the connection to the peer.
    pub is_initiator: bool,
}

impl Peer {
    pub fn new(id: Guid, address: impl Into<String>, port: u16, is_initiator: bool) -> Self {
        Self {
            id: Some(id),
            address: address.into(),
            port,
            is_initiator,
        }
    }

    /// A peer known only by where it can be reached, e.g. a configured
    /// bootstrap contact.
    pub fn unidentified(endpoint: Endpoint) -> Self {
        Self {
            id: None,
            address: endpoint.address,
            port: endpoint.port,
            is_initiator: false,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.address.clone(), self.port)
    }

    pub fn key(&self) -> PeerKey {
        match self.id {
            Some(id) => PeerKey::Id(id),
            None => PeerKey::Endpoint(self.endpoint()),
        }
    }

    #[inline]
    pub fn is_identified(&self) -> bool {
        self.id.is_some()
    }

    /// Short human-readable description used in log lines.
    pub fn info(&self) -> String {
        match self.id {
            Some(id) => format!("{}@{}", id, self.endpoint()),
            None => format!("?@{}", self.endpoint()),
        }
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn peers_with_same_id_are_equal_regardless_of_address() {
        let a = Peer::new(Guid::new(7), "10.0.0.1", 4000, false);
        let b = Peer::new(Guid::new(7), "10.0.0.2", 5000, true);
        let c = Peer::new(Guid::new(8), "10.0.0.1", 4000, false);

        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<Peer> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn unidentified_peer_is_keyed_by_endpoint() {
        let endpoint = Endpoint::new("127.0.0.1", 4000);
        let peer = Peer::unidentified(endpoint.clone());

        assert!(!peer.is_identified());
        assert!(!peer.is_initiator);
        assert_eq!(peer.key(), PeerKey::Endpoint(endpoint));

        let identified = Peer::new(Guid::new(1), "127.0.0.1", 4000, false);
        assert_ne!(peer, identified, "an unknown id never equals a known one");
    }

    #[test]
    fn xor_distance_is_symmetric() {
        let a = Guid::new(0b1100);
        let b = Guid::new(0b1010);

        assert_eq!(a.xor_distance(&b), 0b0110);
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        assert_eq!(a.xor_distance(&a), 0);
    }

    #[test]
    fn guid_display_round_trips_through_from_str() {
        let id = Guid::new(340282366920938463463374607431768211455);
        let parsed: Guid = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(format!("{:?}", Guid::new(0)), "Guid(00000000)");
    }

    #[test]
    fn endpoint_parsing() {
        let e: Endpoint = "example.org:4000".parse().unwrap();
        assert_eq!(e, Endpoint::new("example.org", 4000));

        let v6: Endpoint = "[::1]:9000".parse().unwrap();
        assert_eq!(v6.address, "::1");
        assert_eq!(v6.to_string(), "[::1]:9000");

        assert!("no-port".parse::<Endpoint>().is_err());
        assert!(":4000".parse::<Endpoint>().is_err());
        assert!("host:99999".parse::<Endpoint>().is_err());
    }

    #[test]
    fn endpoint_from_socket_addr_has_bare_host() {
        let v4: SocketAddr = "10.0.0.5:4000".parse().unwrap();
        assert_eq!(Endpoint::from(v4), Endpoint::new("10.0.0.5", 4000));

        let v6: SocketAddr = "[::1]:4000".parse().unwrap();
        assert_eq!(Endpoint::from(v6).address, "::1");
    }
}
