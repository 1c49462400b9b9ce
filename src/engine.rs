//! # Protocol Engine
//!
//! The engine interprets inbound protocol messages, keeps the routing table
//! up to date through a [`RoutingLayer`], and issues outbound messages onto
//! the transport's channel.
//!
//! ## Message Handling
//!
//! | Type | Handler behaviour |
//! |------|-------------------|
//! | `PING` | register sender, reply `PING_RESPONSE` |
//! | `PING_RESPONSE` | cancel the sender's liveness timeout |
//! | `FIND_NODE` | register sender, reply `FOUND_NODES` (never including the requester) |
//! | `FOUND_NODES` | register and ping every listed peer, in order |
//! | `LEAVE` | drop the sender's timeout and remove it from the routing table |
//!
//! ## Task Model
//!
//! - One inbound task processes messages strictly in arrival order, each to
//!   completion before the next is taken.
//! - One liveness-timeout task per outstanding ping (see [`crate::liveness`]).
//! - Cancellation is cooperative via [`CancellationToken`]; a cancelled task
//!   returns cleanly.
//!
//! ## Failure Policy
//!
//! Handler failures (closed outbound channel, unknown peer) are logged and
//! absorbed. Public operations report [`Status`]; nothing else crosses the
//! engine boundary.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::identity::{Endpoint, Guid, Peer, PeerKey};
use crate::liveness::PingRegistry;
use crate::messages::{Message, MessageBody};
use crate::protocols::{RoutingLayer, Status};

/// Default grace period before an unanswered ping evicts its peer.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(3);

/// Default wait between pinging the bootstrap node and checking it answered.
pub const DEFAULT_BOOTSTRAP_SETTLE: Duration = Duration::from_secs(4);

/// Default capacity of the channels between transport and engine.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Timing parameters of the protocol engine.
///
/// Built with `ProtocolConfig::default()` and adjusted through the `with_*`
/// builders:
///
/// ```ignore
/// let config = ProtocolConfig::default()
///     .with_ping_timeout(Duration::from_millis(500))
///     .with_bootstrap_settle(Duration::from_secs(1));
/// ```
#[derive(Clone, Debug)]
pub struct ProtocolConfig {
    /// Time a pinged peer has to answer before it is evicted.
    pub ping_timeout: Duration,
    /// Time `join_network` waits for the bootstrap node's ping response.
    /// Should exceed `ping_timeout` so an unresponsive bootstrap node has
    /// already been evicted when it is re-resolved.
    pub bootstrap_settle: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            ping_timeout: DEFAULT_PING_TIMEOUT,
            bootstrap_settle: DEFAULT_BOOTSTRAP_SETTLE,
        }
    }
}

impl ProtocolConfig {
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn with_bootstrap_settle(mut self, settle: Duration) -> Self {
        self.bootstrap_settle = settle;
        self
    }
}

struct EngineInner<R: RoutingLayer> {
    routing: Arc<R>,
    myself: Peer,
    outbound: mpsc::Sender<Message>,
    pending: Arc<PingRegistry>,
    config: ProtocolConfig,
    shutdown: CancellationToken,
    /// Set while the server is started; sends fail while it is clear.
    serving: AtomicBool,
    inbound_task: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap-to-clone handle to a running protocol engine.
pub struct ProtocolEngine<R: RoutingLayer> {
    inner: Arc<EngineInner<R>>,
}

impl<R: RoutingLayer> Clone for ProtocolEngine<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: RoutingLayer> ProtocolEngine<R> {
    /// Create the engine and spawn its inbound processing task.
    ///
    /// `inbound` yields messages decoded by the transport; `outbound` is where
    /// the engine enqueues messages for transmission.
    pub fn spawn(
        routing: Arc<R>,
        inbound: mpsc::Receiver<Message>,
        outbound: mpsc::Sender<Message>,
        config: ProtocolConfig,
    ) -> Self {
        let myself = routing.get_myself();
        let engine = Self {
            inner: Arc::new(EngineInner {
                routing,
                myself,
                outbound,
                pending: Arc::new(PingRegistry::new()),
                config,
                shutdown: CancellationToken::new(),
                serving: AtomicBool::new(false),
                inbound_task: Mutex::new(None),
            }),
        };

        let task = tokio::spawn(engine.clone().run(inbound));
        *engine.inbound_task() = Some(task);
        engine
    }

    fn inbound_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner
            .inbound_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_myself(&self) -> Peer {
        self.inner.myself.clone()
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.inner.config
    }

    pub fn routing(&self) -> &Arc<R> {
        &self.inner.routing
    }

    /// Number of pings still waiting for a response.
    pub fn outstanding_pings(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn is_ping_outstanding(&self, key: &PeerKey) -> bool {
        self.inner.pending.is_pending(key)
    }

    // ------------------------------------------------------------------
    // Inbound processing
    // ------------------------------------------------------------------

    async fn run(self, mut inbound: mpsc::Receiver<Message>) {
        let shutdown = self.inner.shutdown.clone();
        loop {
            trace!("waiting for inbound message");
            let message = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("engine cancelled, no longer handling inbound messages");
                    break;
                }
                message = inbound.recv() => message,
            };
            match message {
                Some(message) => self.handle_message(message).await,
                None => {
                    debug!("inbound channel closed, engine stopping");
                    break;
                }
            }
        }
    }

    async fn handle_message(&self, message: Message) {
        trace!(
            kind = %message.message_type(),
            from = %message.sender.info(),
            "handling message"
        );
        let Message {
            sender,
            body,
            source,
            ..
        } = message;
        match body {
            MessageBody::Ping => self.handle_ping(sender).await,
            MessageBody::PingResponse => {
                self.handle_ping_response(sender, source.map(Endpoint::from))
                    .await
            }
            MessageBody::FindNode { guid } => self.handle_find_node(sender, guid).await,
            MessageBody::FoundNodes { nodes } => self.handle_found_nodes(sender, nodes).await,
            MessageBody::Leave => self.handle_leave(sender).await,
        }
    }

    async fn handle_ping(&self, sender: Peer) {
        debug!(from = %sender.info(), "PING received");
        self.inner.routing.add_peer(sender.clone()).await;

        let reply = Message::ping_response(self.get_myself(), sender.clone());
        match self.send(reply).await {
            Status::Success => trace!(to = %sender.info(), "ping answered"),
            Status::Failure => warn!(to = %sender.info(), "failed to answer ping"),
        }
    }

    async fn handle_ping_response(&self, sender: Peer, source: Option<Endpoint>) {
        debug!(from = %sender.info(), "PING_RESPONSE received");
        let Some(pinged) = self.inner.pending.resolve(&sender, source.as_ref()) else {
            trace!(from = %sender.info(), "no outstanding ping for responder");
            return;
        };
        debug!(peer = %sender.info(), "cancelled eviction of responsive peer");

        // A peer pinged before it identified itself now has a known id. Its
        // advertised host may not be reachable from here, so keep the
        // endpoint it actually answered on.
        if let (None, Some(id)) = (pinged.id, sender.id) {
            let promoted = Peer::new(id, pinged.address.clone(), pinged.port, sender.is_initiator);
            debug!(
                endpoint = %pinged.endpoint(),
                %id,
                advertised = %sender.endpoint(),
                "peer identified itself"
            );
            self.inner.routing.remove_peer(&pinged).await;
            self.inner.routing.add_peer(promoted).await;
        }
    }

    async fn handle_find_node(&self, sender: Peer, guid: Guid) {
        debug!(from = %sender.info(), target = %guid, "FIND_NODE received");
        self.inner.routing.add_peer(sender.clone()).await;

        let mut nearest = self.inner.routing.get_nearest_peers(guid).await;
        nearest.retain(|p| *p != sender);

        let count = nearest.len();
        let reply = Message::found_nodes(self.get_myself(), sender.clone(), nearest);
        match self.send(reply).await {
            Status::Success => trace!(to = %sender.info(), count, "FOUND_NODES sent"),
            Status::Failure => warn!(to = %sender.info(), "failed to send FOUND_NODES"),
        }
    }

    async fn handle_found_nodes(&self, sender: Peer, nodes: Vec<Peer>) {
        debug!(from = %sender.info(), count = nodes.len(), "FOUND_NODES received");
        for peer in nodes {
            if peer == self.inner.myself {
                trace!("skipping own contact in FOUND_NODES");
                continue;
            }
            let key = peer.key();
            self.inner.routing.add_peer(peer).await;
            if self.ping(key.clone()).await == Status::Failure {
                debug!(peer = %key, "could not ping discovered peer");
            }
        }
    }

    async fn handle_leave(&self, sender: Peer) {
        debug!(from = %sender.info(), "LEAVE received");
        self.inner.pending.forget(&sender.key());
        self.inner.routing.remove_peer(&sender).await;
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Hand a message to the transport. No retries.
    async fn send(&self, message: Message) -> Status {
        let kind = message.message_type();
        let to = message.receiver.info();
        if !self.is_serving() {
            debug!(%kind, %to, "server stopped, message not enqueued");
            return Status::Failure;
        }
        tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => {
                debug!(%kind, %to, "engine shutting down, message not enqueued");
                Status::Failure
            }
            result = self.inner.outbound.send(message) => match result {
                Ok(()) => {
                    trace!(%kind, %to, "message enqueued");
                    Status::Success
                }
                Err(_) => {
                    debug!(%kind, %to, "outbound channel closed, message not enqueued");
                    Status::Failure
                }
            },
        }
    }

    /// Send a PING to a known peer and start its liveness timeout.
    ///
    /// The timeout is armed even if the send fails, unless the server is
    /// stopped: a stopped node does not probe.
    pub async fn ping(&self, target: impl Into<PeerKey>) -> Status {
        let target = target.into();
        if self.is_shut_down() || !self.is_serving() {
            debug!(peer = %target, "server not running, not pinging");
            return Status::Failure;
        }
        let Some(peer) = self.inner.routing.get_peer_by_id(&target).await else {
            debug!(peer = %target, "cannot ping unknown peer");
            return Status::Failure;
        };

        let status = self.send(Message::ping(self.get_myself(), peer.clone())).await;
        self.inner.pending.arm(
            peer,
            self.inner.routing.clone(),
            self.inner.config.ping_timeout,
        );
        status
    }

    /// Ask the peer identified by `target` for the peers nearest to `guid`.
    pub async fn find_node(&self, guid: Guid, target: impl Into<PeerKey>) -> Status {
        let target = target.into();
        let Some(peer) = self.inner.routing.get_peer_by_id(&target).await else {
            debug!(peer = %target, "cannot send FIND_NODE to unknown peer");
            return Status::Failure;
        };
        self.send(Message::find_node(self.get_myself(), peer, guid)).await
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start the server and, if a bootstrap contact is given, join its network.
    pub async fn join_network(&self, bootstrap: Option<Endpoint>) -> Status {
        if let Err(e) = self.start_server().await {
            warn!(error = %e, "failed to start server");
            return Status::Failure;
        }

        let Some(endpoint) = bootstrap else {
            info!("no bootstrap node given, starting a new network");
            return Status::Success;
        };
        info!(bootstrap = %endpoint, "joining network");

        let endpoint = match self.resolve_bootstrap(&endpoint).await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(bootstrap = %endpoint, error = %e, "cannot resolve bootstrap node");
                self.stop_server().await;
                return Status::Failure;
            }
        };

        let seed = Peer::unidentified(endpoint);
        self.inner.routing.add_peer(seed.clone()).await;
        if self.ping(seed.key()).await == Status::Failure {
            debug!("initial ping to bootstrap node was not enqueued");
        }

        debug!(
            settle_ms = self.inner.config.bootstrap_settle.as_millis() as u64,
            "waiting for bootstrap node to respond"
        );
        tokio::time::sleep(self.inner.config.bootstrap_settle).await;

        let Some(bootstrap) = self.inner.routing.get_peer_by_id(&seed.key()).await else {
            warn!("bootstrap node is not responding, failed to bootstrap");
            self.stop_server().await;
            return Status::Failure;
        };

        let Some(my_id) = self.inner.myself.id else {
            warn!("local node has no id, cannot look up own neighbourhood");
            self.stop_server().await;
            return Status::Failure;
        };

        let status = self
            .send(Message::find_node(self.get_myself(), bootstrap.clone(), my_id))
            .await;
        if status == Status::Failure {
            warn!(bootstrap = %bootstrap.info(), "could not send FIND_NODE to bootstrap node");
            self.stop_server().await;
            return status;
        }
        info!(bootstrap = %bootstrap.info(), "bootstrap node answered, discovery started");
        Status::Success
    }

    /// Resolve a bootstrap contact to the socket address responses will be
    /// observed from, preferring the local node's address family.
    async fn resolve_bootstrap(&self, endpoint: &Endpoint) -> anyhow::Result<Endpoint> {
        let addrs: Vec<SocketAddr> =
            tokio::net::lookup_host((endpoint.address.as_str(), endpoint.port))
                .await
                .with_context(|| format!("failed to resolve {}", endpoint))?
                .map(|addr| SocketAddr::new(addr.ip().to_canonical(), addr.port()))
                .collect();

        let prefer_v6 = self
            .inner
            .myself
            .address
            .parse::<IpAddr>()
            .map(|ip| ip.is_ipv6())
            .unwrap_or(false);
        let chosen = addrs
            .iter()
            .find(|addr| addr.is_ipv6() == prefer_v6)
            .or_else(|| addrs.first())
            .copied()
            .with_context(|| format!("{} resolved to no address", endpoint))?;

        trace!(bootstrap = %endpoint, resolved = %chosen, "bootstrap contact resolved");
        Ok(Endpoint::from(chosen))
    }

    /// Announce departure to every known peer, then stop the server.
    pub async fn leave_network(&self) -> Status {
        let peers = self.inner.routing.get_all_peers().await;
        info!(peers = peers.len(), "leaving network");

        let mut status = Status::Success;
        for peer in peers {
            if self.send(Message::leave(self.get_myself(), peer)).await == Status::Failure {
                status = Status::Failure;
            }
        }
        self.stop_server().await;
        status
    }

    pub async fn start_server(&self) -> anyhow::Result<()> {
        self.inner.routing.start_server().await?;
        self.inner.serving.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop the server and cancel every outstanding liveness timeout.
    ///
    /// Sends fail from here on until the server is started again. Evictions
    /// already in progress complete before this returns.
    pub async fn stop_server(&self) {
        self.inner.serving.store(false, Ordering::SeqCst);
        let cancelled = self.inner.pending.cancel_all().await;
        if cancelled > 0 {
            debug!(cancelled, "cancelled outstanding liveness timeouts");
        }
        self.inner.routing.stop_server().await;
    }

    /// Stop the server and the inbound task, waiting for the latter to exit.
    pub async fn shutdown(&self) {
        self.stop_server().await;
        self.inner.shutdown.cancel();
        let task = self.inbound_task().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "inbound task ended abnormally");
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Whether the server is started and outbound messages are accepted.
    pub fn is_serving(&self) -> bool {
        self.inner.serving.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::MemoryRouting;

    fn peer(id: u128) -> Peer {
        Peer::new(Guid::new(id), "127.0.0.1", 6000 + id as u16, false)
    }

    struct Harness {
        engine: ProtocolEngine<MemoryRouting>,
        routing: Arc<MemoryRouting>,
        inbound: mpsc::Sender<Message>,
        outbound: mpsc::Receiver<Message>,
    }

    async fn harness() -> Harness {
        let routing = Arc::new(MemoryRouting::new(peer(0)));
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        let engine = ProtocolEngine::spawn(
            routing.clone(),
            inbound_rx,
            outbound_tx,
            ProtocolConfig::default(),
        );
        engine.start_server().await.unwrap();
        Harness {
            engine,
            routing,
            inbound: inbound_tx,
            outbound: outbound_rx,
        }
    }

    #[test]
    fn config_defaults_and_builders() {
        let config = ProtocolConfig::default();
        assert_eq!(config.ping_timeout, Duration::from_secs(3));
        assert_eq!(config.bootstrap_settle, Duration::from_secs(4));

        let config = config
            .with_ping_timeout(Duration::from_millis(300))
            .with_bootstrap_settle(Duration::from_millis(400));
        assert_eq!(config.ping_timeout, Duration::from_millis(300));
        assert_eq!(config.bootstrap_settle, Duration::from_millis(400));
    }

    #[tokio::test]
    async fn ping_is_answered_and_sender_registered() {
        let mut h = harness().await;
        h.inbound.send(Message::ping(peer(1), peer(0))).await.unwrap();

        let reply = h.outbound.recv().await.unwrap();
        assert_eq!(reply.body, MessageBody::PingResponse);
        assert_eq!(reply.receiver, peer(1));
        assert_eq!(reply.sender, peer(0));
        assert!(h.routing.contains(&peer(1).key()));
    }

    #[tokio::test]
    async fn ping_unknown_target_fails_without_side_effects() {
        let mut h = harness().await;
        assert_eq!(h.engine.ping(Guid::new(99)).await, Status::Failure);
        assert_eq!(h.engine.outstanding_pings(), 0);
        assert!(h.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn find_node_unknown_target_fails() {
        let mut h = harness().await;
        assert_eq!(h.engine.find_node(Guid::new(5), Guid::new(99)).await, Status::Failure);
        assert!(h.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn find_node_request_is_sent_to_resolved_peer() {
        let mut h = harness().await;
        h.routing.add_peer(peer(3)).await;

        assert_eq!(h.engine.find_node(Guid::new(9), Guid::new(3)).await, Status::Success);
        let sent = h.outbound.recv().await.unwrap();
        assert_eq!(sent.receiver, peer(3));
        assert_eq!(sent.body, MessageBody::FindNode { guid: Guid::new(9) });
    }

    #[tokio::test]
    async fn send_on_closed_channel_reports_failure() {
        let h = harness().await;
        h.routing.add_peer(peer(2)).await;
        drop(h.outbound);

        assert_eq!(h.engine.ping(Guid::new(2)).await, Status::Failure);
        // The timeout is armed regardless of the send outcome.
        assert!(h.engine.is_ping_outstanding(&peer(2).key()));
    }

    #[tokio::test]
    async fn shutdown_stops_inbound_task_and_cancels_timeouts() {
        let h = harness().await;
        h.routing.add_peer(peer(2)).await;
        let _ = h.engine.ping(Guid::new(2)).await;
        assert_eq!(h.engine.outstanding_pings(), 1);

        h.engine.shutdown().await;

        assert!(h.engine.is_shut_down());
        assert_eq!(h.engine.outstanding_pings(), 0);
        assert!(!h.routing.is_server_running());
        assert_eq!(h.engine.ping(Guid::new(2)).await, Status::Failure);
        assert_eq!(h.engine.outstanding_pings(), 0);
    }

    #[tokio::test]
    async fn sends_fail_while_server_is_stopped() {
        let mut h = harness().await;
        h.routing.add_peer(peer(2)).await;
        h.engine.stop_server().await;
        assert!(!h.engine.is_serving());

        assert_eq!(h.engine.ping(Guid::new(2)).await, Status::Failure);
        assert_eq!(h.engine.find_node(Guid::new(1), Guid::new(2)).await, Status::Failure);
        assert_eq!(h.engine.outstanding_pings(), 0);
        assert!(h.outbound.try_recv().is_err());

        // Far more sends than the channel holds must not block.
        for _ in 0..64 {
            assert_eq!(h.engine.find_node(Guid::new(1), Guid::new(2)).await, Status::Failure);
        }

        h.engine.start_server().await.unwrap();
        assert_eq!(h.engine.ping(Guid::new(2)).await, Status::Success);
        let sent = h.outbound.recv().await.unwrap();
        assert_eq!(sent.body, MessageBody::Ping);
        assert!(h.outbound.try_recv().is_err(), "nothing stale is queued");
    }

    #[tokio::test]
    async fn unstarted_engine_does_not_enqueue() {
        let routing = Arc::new(MemoryRouting::new(peer(0)));
        routing.add_peer(peer(2)).await;
        let (_inbound_tx, inbound_rx) = mpsc::channel(4);
        let (outbound_tx, mut outbound_rx) = mpsc::channel(4);
        let engine = ProtocolEngine::spawn(routing, inbound_rx, outbound_tx, ProtocolConfig::default());

        assert!(!engine.is_serving());
        assert_eq!(engine.find_node(Guid::new(1), Guid::new(2)).await, Status::Failure);
        assert!(outbound_rx.try_recv().is_err());
    }
}
