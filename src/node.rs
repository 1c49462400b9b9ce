//! # High-Level Node API
//!
//! This module provides the main entry point for running an overlay node. A
//! [`Node`] combines the UDP transport, the in-memory routing table and the
//! protocol engine into a single interface.
//!
//! ## Quick Start
//!
//! ```ignore
//! // Start a node on a fixed port
//! let node = Node::bind("0.0.0.0:4000", None, ProtocolConfig::default()).await?;
//!
//! // Join an existing overlay through a known peer
//! let status = node.join_network(Some("10.0.0.1:4000".parse()?)).await;
//!
//! // Query and probe peers
//! node.find_node(target_guid, known_peer_guid).await;
//! node.ping(known_peer_guid).await;
//! ```
//!
//! ## Component Integration
//!
//! - **UdpServer**: moves datagrams between the wire and the engine's channels
//! - **MemoryRouting**: peer bookkeeping and nearest-peer queries
//! - **ProtocolEngine**: message handling, liveness tracking, bootstrap

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::engine::{ProtocolConfig, ProtocolEngine, DEFAULT_CHANNEL_CAPACITY};
use crate::identity::{Endpoint, Guid, Peer, PeerKey};
use crate::protocols::{RoutingLayer, Status};
use crate::routing::MemoryRouting;
use crate::transport::UdpServer;

pub struct Node {
    engine: ProtocolEngine<MemoryRouting>,
    routing: Arc<MemoryRouting>,
    server: Arc<UdpServer>,
}

impl Node {
    /// Bind a node with a fresh random identity.
    ///
    /// `advertise` is the host other peers should use to reach this node. It
    /// defaults to the bound IP, or loopback when bound to an unspecified
    /// address.
    pub async fn bind(addr: &str, advertise: Option<&str>, config: ProtocolConfig) -> Result<Self> {
        Self::bind_with_id(addr, advertise, Guid::random(), config).await
    }

    pub async fn bind_with_id(
        addr: &str,
        advertise: Option<&str>,
        id: Guid,
        config: ProtocolConfig,
    ) -> Result<Self> {
        let addr: SocketAddr = addr.parse().context("invalid socket address")?;

        let (server, inbound, outbound) = UdpServer::bind(addr, DEFAULT_CHANNEL_CAPACITY).await?;
        let local_addr = server.local_addr();

        let host = match advertise {
            Some(host) => host.to_string(),
            None => advertised_host(local_addr.ip()),
        };
        let myself = Peer::new(id, host, local_addr.port(), false);

        let routing = Arc::new(MemoryRouting::new(myself.clone()).with_server(server.clone()));
        let engine = ProtocolEngine::spawn(routing.clone(), inbound, outbound, config);

        info!("Node {} at {}", id, myself.endpoint());

        Ok(Self {
            engine,
            routing,
            server,
        })
    }

    pub fn identity(&self) -> Guid {
        self.engine.get_myself().id.unwrap_or_default()
    }

    pub fn get_myself(&self) -> Peer {
        self.engine.get_myself()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn engine(&self) -> &ProtocolEngine<MemoryRouting> {
        &self.engine
    }

    /// Snapshot of the routing table.
    pub async fn known_peers(&self) -> Vec<Peer> {
        self.routing.get_all_peers().await
    }

    pub fn is_server_running(&self) -> bool {
        self.routing.is_server_running()
    }

    pub async fn join_network(&self, bootstrap: Option<Endpoint>) -> Status {
        self.engine.join_network(bootstrap).await
    }

    pub async fn ping(&self, target: impl Into<PeerKey>) -> Status {
        self.engine.ping(target).await
    }

    pub async fn find_node(&self, guid: Guid, target: impl Into<PeerKey>) -> Status {
        self.engine.find_node(guid, target).await
    }

    pub async fn start_server(&self) -> Result<()> {
        self.engine.start_server().await
    }

    pub async fn stop_server(&self) {
        self.engine.stop_server().await
    }

    pub async fn leave_network(&self) -> Status {
        self.engine.leave_network().await
    }

    pub async fn shutdown(&self) {
        self.engine.shutdown().await
    }
}

fn advertised_host(ip: IpAddr) -> String {
    if ip.is_unspecified() {
        if ip.is_ipv6() {
            "::1".to_string()
        } else {
            "127.0.0.1".to_string()
        }
    } else {
        ip.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unspecified_bind_advertises_loopback() {
        assert_eq!(advertised_host("0.0.0.0".parse().unwrap()), "127.0.0.1");
        assert_eq!(advertised_host("::".parse().unwrap()), "::1");
        assert_eq!(advertised_host("10.1.2.3".parse().unwrap()), "10.1.2.3");
    }

    #[tokio::test]
    async fn bind_rejects_invalid_address() {
        assert!(Node::bind("not-an-address", None, ProtocolConfig::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn bind_with_id_uses_given_identity() {
        let node = Node::bind_with_id("127.0.0.1:0", Some("node.local"), Guid::new(5), ProtocolConfig::default())
            .await
            .unwrap();

        assert_eq!(node.identity(), Guid::new(5));
        assert_eq!(node.get_myself().address, "node.local");
        assert_eq!(node.get_myself().port, node.local_addr().port());
        assert!(!node.is_server_running());
        node.shutdown().await;
    }
}
