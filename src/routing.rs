//! # In-Memory Routing Table
//!
//! [`MemoryRouting`] is the [`RoutingLayer`] used by the node facade. It keeps
//! a flat, insertion-ordered list of peers and answers nearest-peer queries by
//! sorting on XOR distance. Bucket splitting and per-bucket eviction belong to
//! a full k-bucket table and are not modelled here.
//!
//! ## Invariants
//!
//! - The local node is never stored.
//! - At most one entry per [`PeerKey`]; re-adding refreshes the entry.
//! - Unidentified peers (no `Guid`) are stored and resolvable by endpoint but
//!   never appear in nearest-peer results.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, trace};

use crate::identity::{Guid, Peer, PeerKey};
use crate::protocols::{RoutingLayer, ServerControl};

/// Default number of peers returned by a nearest-peer query.
pub const DEFAULT_K: usize = 20;

/// Default maximum number of tracked peers.
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug)]
struct PeerTable {
    myself: Peer,
    k: usize,
    capacity: usize,
    peers: Vec<Peer>,
}

impl PeerTable {
    fn new(myself: Peer, k: usize, capacity: usize) -> Self {
        Self {
            myself,
            k,
            capacity,
            peers: Vec::new(),
        }
    }

    fn position(&self, key: &PeerKey) -> Option<usize> {
        match key {
            PeerKey::Id(id) => self.peers.iter().position(|p| p.id == Some(*id)),
            PeerKey::Endpoint(endpoint) => self
                .peers
                .iter()
                .position(|p| p.address == endpoint.address && p.port == endpoint.port),
        }
    }

    /// Returns `true` if the peer is stored after the call.
    fn upsert(&mut self, peer: Peer) -> bool {
        if peer == self.myself {
            return false;
        }
        let key = peer.key();
        let existing = self.peers.iter().position(|p| p.key() == key);
        if let Some(idx) = existing {
            // Refresh: most recently seen goes to the back.
            self.peers.remove(idx);
            self.peers.push(peer);
            return true;
        }
        if self.peers.len() >= self.capacity {
            trace!(peer = %key, capacity = self.capacity, "routing table full, ignoring peer");
            return false;
        }
        self.peers.push(peer);
        true
    }

    fn remove(&mut self, peer: &Peer) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| p != peer);
        self.peers.len() != before
    }

    fn lookup(&self, key: &PeerKey) -> Option<Peer> {
        self.position(key).map(|idx| self.peers[idx].clone())
    }

    fn closest(&self, target: &Guid) -> Vec<Peer> {
        if self.k == 0 {
            return Vec::new();
        }
        let mut candidates: Vec<(u128, &Peer)> = self
            .peers
            .iter()
            .filter_map(|p| p.id.map(|id| (id.xor_distance(target), p)))
            .collect();
        candidates.sort_by_key(|(dist, _)| *dist);
        candidates
            .into_iter()
            .take(self.k)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

/// Thread-safe in-memory routing table with optional server control.
///
/// Peers are kept in least-recently-seen order, at most `capacity` of them.
/// Nearest-peer queries return up to `k` identified peers by XOR distance;
/// peers whose id is still unknown are reachable only through an endpoint
/// lookup.
///
/// ```ignore
/// let routing = MemoryRouting::new(myself).with_server(udp_server);
/// routing.add_peer(peer).await;
/// let closest = routing.get_nearest_peers(target).await;
/// ```
pub struct MemoryRouting {
    table: RwLock<PeerTable>,
    server: Option<Arc<dyn ServerControl>>,
    running: AtomicBool,
}

impl MemoryRouting {
    /// Table for `myself` with [`DEFAULT_K`] and [`DEFAULT_CAPACITY`].
    pub fn new(myself: Peer) -> Self {
        Self::with_params(myself, DEFAULT_K, DEFAULT_CAPACITY)
    }

    /// Table for `myself` answering nearest-peer queries with up to `k`
    /// peers and holding at most `capacity`.
    pub fn with_params(myself: Peer, k: usize, capacity: usize) -> Self {
        Self {
            table: RwLock::new(PeerTable::new(myself, k, capacity)),
            server: None,
            running: AtomicBool::new(false),
        }
    }

    /// Delegate `start_server`/`stop_server` to a real server.
    pub fn with_server(mut self, server: Arc<dyn ServerControl>) -> Self {
        self.server = Some(server);
        self
    }

    /// Number of known peers, identified or not.
    pub fn len(&self) -> usize {
        self.read().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a peer with this identity is known.
    pub fn contains(&self, key: &PeerKey) -> bool {
        self.read().position(key).is_some()
    }

    /// Whether `start_server` succeeded and `stop_server` has not run since.
    pub fn is_server_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // A poisoned lock only means another task panicked mid-update; the
    // peer list itself is always left consistent.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, PeerTable> {
        self.table.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, PeerTable> {
        self.table.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RoutingLayer for MemoryRouting {
    fn get_myself(&self) -> Peer {
        self.read().myself.clone()
    }

    async fn add_peer(&self, peer: Peer) {
        let info = peer.info();
        if self.write().upsert(peer) {
            trace!(peer = %info, "peer added to routing table");
        }
    }

    async fn remove_peer(&self, peer: &Peer) {
        if self.write().remove(peer) {
            debug!(peer = %peer.info(), "peer removed from routing table");
        }
    }

    async fn get_peer_by_id(&self, key: &PeerKey) -> Option<Peer> {
        self.read().lookup(key)
    }

    async fn get_nearest_peers(&self, target: Guid) -> Vec<Peer> {
        self.read().closest(&target)
    }

    async fn get_all_peers(&self) -> Vec<Peer> {
        self.read().peers.clone()
    }

    async fn start_server(&self) -> Result<()> {
        if let Some(server) = &self.server {
            server.start().await?;
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_server(&self) {
        if let Some(server) = &self.server {
            server.stop().await;
        }
        self.running.store(false, Ordering::SeqCst);
    }
}
