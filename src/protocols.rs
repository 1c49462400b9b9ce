//! Collaborator trait definitions for the protocol engine.
//!
//! The engine never owns the routing table or the socket. It reaches them
//! through the traits in this module, which keeps the engine testable with
//! in-memory doubles and lets the node facade plug in real implementations.
//!
//! | Collaborator | Trait | Purpose |
//! |--------------|-------|---------|
//! | Routing table | [`RoutingLayer`] | Peer bookkeeping, nearest-peer queries, server lifecycle |
//! | Server | [`ServerControl`] | Start/stop moving bytes between the wire and the engine |
//!
//! The transport side of the engine is a plain pair of `tokio::sync::mpsc`
//! channels of [`Message`](crate::messages::Message): one inbound, one outbound.

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::{Guid, Peer, PeerKey};

/// Outcome of an engine operation. Diagnostics are logged, not returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    Failure,
}

impl Status {
    #[inline]
    pub fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Success => f.write_str("SUCCESS"),
            Status::Failure => f.write_str("FAILURE"),
        }
    }
}

/// Routing table and local identity owner.
#[async_trait]
pub trait RoutingLayer: Send + Sync + 'static {
    /// The local node. Stable for the lifetime of the process.
    fn get_myself(&self) -> Peer;

    /// Insert or refresh a peer. Re-adding a known peer is never an error.
    async fn add_peer(&self, peer: Peer);

    /// Remove a peer. No-op if absent.
    async fn remove_peer(&self, peer: &Peer);

    async fn get_peer_by_id(&self, key: &PeerKey) -> Option<Peer>;

    /// Known peers ordered by XOR distance to `target`, closest first.
    async fn get_nearest_peers(&self, target: Guid) -> Vec<Peer>;

    /// Every known peer, in a stable order.
    async fn get_all_peers(&self) -> Vec<Peer>;

    async fn start_server(&self) -> Result<()>;

    async fn stop_server(&self);
}

/// Lifecycle of the component that bridges the wire to the engine's channels.
#[async_trait]
pub trait ServerControl: Send + Sync + 'static {
    async fn start(&self) -> Result<()>;

    async fn stop(&self);
}
