//! # Outstanding-Ping Registry
//!
//! Every PING the engine sends arms a liveness timeout. If the peer answers
//! with a PING_RESPONSE before the grace period elapses the timeout is
//! cancelled; otherwise the peer is evicted from the routing table.
//!
//! ## Design
//!
//! - One entry per [`PeerKey`]. Re-pinging a peer replaces its entry and
//!   cancels the previous timer.
//! - Each entry carries a generation number. A timer only evicts if, after
//!   its sleep, the registry still holds the entry with its own generation.
//!   The registry lock is therefore the single point where "response arrived"
//!   and "timer expired" are ordered, which makes eviction exactly-once and
//!   never concurrent with a cancelling response.
//! - The lock is never held across an `.await`.
//! - A timer that wins the race holds a read guard on `evictions` until its
//!   `remove_peer` completes. [`PingRegistry::cancel_all`] takes the write
//!   guard after draining, so once it returns no eviction is in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::RwLock;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::identity::{Endpoint, Peer, PeerKey};
use crate::protocols::RoutingLayer;

struct PendingPing {
    peer: Peer,
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
pub(crate) struct PingRegistry {
    entries: Mutex<HashMap<PeerKey, PendingPing>>,
    next_generation: AtomicU64,
    evictions: RwLock<()>,
}

impl PingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeerKey, PendingPing>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start the liveness timeout for `peer`, replacing any outstanding one.
    pub fn arm<R: RoutingLayer>(self: &Arc<Self>, peer: Peer, routing: Arc<R>, grace: Duration) {
        let key = peer.key();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        let replaced = self.lock().insert(
            key.clone(),
            PendingPing {
                peer: peer.clone(),
                generation,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = replaced {
            trace!(peer = %key, "replacing outstanding liveness timeout");
            previous.cancel.cancel();
        }

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    trace!(peer = %key, "liveness timeout cancelled");
                }
                _ = tokio::time::sleep(grace) => {
                    let _evicting = registry.evictions.read().await;
                    if registry.expire(&key, generation) {
                        debug!(
                            peer = %peer.info(),
                            grace_ms = grace.as_millis() as u64,
                            "peer did not answer ping in time, evicting"
                        );
                        routing.remove_peer(&peer).await;
                    }
                }
            }
        });
    }

    /// Match a PING_RESPONSE sender against outstanding entries.
    ///
    /// Looks up the sender's key first, then the address the response was
    /// observed to come from, then the endpoint the sender advertises. The
    /// endpoint lookups match a peer pinged before its `Guid` was known.
    /// Returns the peer that was originally pinged.
    pub fn resolve(&self, responder: &Peer, source: Option<&Endpoint>) -> Option<Peer> {
        let mut candidates = vec![responder.key()];
        if let Some(source) = source {
            candidates.push(PeerKey::Endpoint(source.clone()));
        }
        if responder.is_identified() {
            candidates.push(PeerKey::Endpoint(responder.endpoint()));
        }

        let entry = {
            let mut entries = self.lock();
            candidates.iter().find_map(|key| entries.remove(key))
        }?;
        entry.cancel.cancel();
        Some(entry.peer)
    }

    /// Drop the entry for `key` without evicting the peer.
    pub fn forget(&self, key: &PeerKey) -> bool {
        match self.lock().remove(key) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every outstanding timeout and wait out evictions already under
    /// way. Returns how many timeouts were cancelled.
    pub async fn cancel_all(&self) -> usize {
        let drained: Vec<PendingPing> = self.lock().drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.cancel.cancel();
        }
        drop(self.evictions.write().await);
        drained.len()
    }

    pub fn is_pending(&self, key: &PeerKey) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn expire(&self, key: &PeerKey, generation: u64) -> bool {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.generation == generation => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Guid;
    use crate::routing::MemoryRouting;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    const GRACE: Duration = Duration::from_secs(3);

    fn peer(id: u128) -> Peer {
        Peer::new(Guid::new(id), "127.0.0.1", 5000 + id as u16, false)
    }

    async fn setup(peers: &[Peer]) -> (Arc<PingRegistry>, Arc<MemoryRouting>) {
        let routing = Arc::new(MemoryRouting::new(peer(0)));
        for p in peers {
            routing.add_peer(p.clone()).await;
        }
        (Arc::new(PingRegistry::new()), routing)
    }

    #[tokio::test(start_paused = true)]
    async fn expired_timeout_evicts_peer() {
        let (registry, routing) = setup(&[peer(1)]).await;

        registry.arm(peer(1), routing.clone(), GRACE);
        assert!(registry.is_pending(&peer(1).key()));

        tokio::time::sleep(GRACE + Duration::from_millis(10)).await;

        assert!(!routing.contains(&peer(1).key()));
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn resolved_timeout_keeps_peer() {
        let (registry, routing) = setup(&[peer(1)]).await;

        registry.arm(peer(1), routing.clone(), GRACE);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(registry.resolve(&peer(1), None), Some(peer(1)));

        tokio::time::sleep(GRACE * 2).await;
        assert!(routing.contains(&peer(1).key()));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_response_is_noop() {
        let (registry, routing) = setup(&[peer(1)]).await;

        registry.arm(peer(1), routing.clone(), GRACE);
        assert!(registry.resolve(&peer(1), None).is_some());
        assert!(registry.resolve(&peer(1), None).is_none());
        assert!(registry.resolve(&peer(2), None).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_previous_timer() {
        let (registry, routing) = setup(&[peer(1)]).await;

        registry.arm(peer(1), routing.clone(), GRACE);
        tokio::time::sleep(Duration::from_secs(2)).await;
        registry.arm(peer(1), routing.clone(), GRACE);
        assert_eq!(registry.len(), 1);

        // The first timer would have fired at t=3s; only the second may evict.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(routing.contains(&peer(1).key()));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!routing.contains(&peer(1).key()));
    }

    #[tokio::test(start_paused = true)]
    async fn identified_response_matches_endpoint_entry() {
        let endpoint = Endpoint::new("127.0.0.1", 5001);
        let placeholder = Peer::unidentified(endpoint);
        let (registry, routing) = setup(&[placeholder.clone()]).await;

        registry.arm(placeholder.clone(), routing.clone(), GRACE);
        let matched = registry.resolve(&peer(1), None).expect("endpoint fallback should match");
        assert_eq!(matched.id, None);

        tokio::time::sleep(GRACE * 2).await;
        assert!(routing.contains(&placeholder.key()));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_prevents_every_eviction() {
        let (registry, routing) = setup(&[peer(1), peer(2), peer(3)]).await;

        for id in 1..=3 {
            registry.arm(peer(id), routing.clone(), GRACE);
        }
        assert_eq!(registry.cancel_all().await, 3);

        tokio::time::sleep(GRACE * 2).await;
        assert_eq!(routing.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn forget_drops_entry_without_eviction() {
        let (registry, routing) = setup(&[peer(1)]).await;

        registry.arm(peer(1), routing.clone(), GRACE);
        assert!(registry.forget(&peer(1).key()));
        assert!(!registry.forget(&peer(1).key()));

        tokio::time::sleep(GRACE * 2).await;
        assert!(routing.contains(&peer(1).key()));
    }

    #[tokio::test(start_paused = true)]
    async fn observed_source_matches_placeholder_with_other_host_name() {
        let placeholder = Peer::unidentified(Endpoint::new("127.0.0.1", 5001));
        let (registry, routing) = setup(&[placeholder.clone()]).await;
        registry.arm(placeholder.clone(), routing.clone(), GRACE);

        // The responder advertises a host name the joiner never used.
        let responder = Peer::new(Guid::new(1), "seed.example", 5001, false);
        assert!(registry.resolve(&responder, None).is_none());

        let source = Endpoint::new("127.0.0.1", 5001);
        let matched = registry.resolve(&responder, Some(&source));
        assert_eq!(matched, Some(placeholder));
    }

    /// Routing double whose `remove_peer` takes a while to complete.
    struct SlowRemoval {
        table: MemoryRouting,
        delay: Duration,
        removals: AtomicUsize,
    }

    #[async_trait]
    impl RoutingLayer for SlowRemoval {
        fn get_myself(&self) -> Peer {
            self.table.get_myself()
        }

        async fn add_peer(&self, peer: Peer) {
            self.table.add_peer(peer).await
        }

        async fn remove_peer(&self, peer: &Peer) {
            tokio::time::sleep(self.delay).await;
            self.table.remove_peer(peer).await;
            self.removals.fetch_add(1, Ordering::SeqCst);
        }

        async fn get_peer_by_id(&self, key: &PeerKey) -> Option<Peer> {
            self.table.get_peer_by_id(key).await
        }

        async fn get_nearest_peers(&self, target: Guid) -> Vec<Peer> {
            self.table.get_nearest_peers(target).await
        }

        async fn get_all_peers(&self) -> Vec<Peer> {
            self.table.get_all_peers().await
        }

        async fn start_server(&self) -> anyhow::Result<()> {
            self.table.start_server().await
        }

        async fn stop_server(&self) {
            self.table.stop_server().await
        }
    }

    async fn slow_setup(delay: Duration) -> (Arc<PingRegistry>, Arc<SlowRemoval>) {
        let routing = Arc::new(SlowRemoval {
            table: MemoryRouting::new(peer(0)),
            delay,
            removals: AtomicUsize::new(0),
        });
        routing.add_peer(peer(1)).await;
        (Arc::new(PingRegistry::new()), routing)
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_waits_for_eviction_in_progress() {
        let delay = Duration::from_millis(500);
        let (registry, routing) = slow_setup(delay).await;

        registry.arm(peer(1), routing.clone(), GRACE);
        tokio::time::sleep(GRACE + Duration::from_millis(10)).await;
        assert_eq!(routing.removals.load(Ordering::SeqCst), 0, "removal still in flight");

        let started = tokio::time::Instant::now();
        registry.cancel_all().await;

        assert_eq!(routing.removals.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() >= delay - Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_at_grace_instant_leaves_no_eviction_behind() {
        let (registry, routing) = slow_setup(Duration::from_millis(500)).await;

        registry.arm(peer(1), routing.clone(), GRACE);
        tokio::time::sleep(GRACE).await;
        registry.cancel_all().await;
        let removals_at_stop = routing.removals.load(Ordering::SeqCst);

        tokio::time::sleep(GRACE * 2).await;
        assert_eq!(routing.removals.load(Ordering::SeqCst), removals_at_stop);
        assert_eq!(registry.len(), 0);
    }
}
