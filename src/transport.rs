//! # UDP Transport
//!
//! [`UdpServer`] bridges a UDP socket to the protocol engine's channel pair:
//!
//! ```text
//!            ┌──────────── UdpServer ────────────┐
//!  wire ───► │ recv pump ─ decode ─► inbound tx  │ ───► engine
//!  wire ◄─── │ send pump ◄─ encode ─ outbound rx │ ◄─── engine
//!            └───────────────────────────────────┘
//! ```
//!
//! The socket is bound at construction so the local address is known before
//! the engine exists. [`ServerControl::start`] spawns both pumps;
//! [`ServerControl::stop`] cancels them and takes back the outbound receiver,
//! so the server can be started again.
//!
//! Each datagram carries exactly one bincode-encoded [`Message`]. Datagrams
//! that fail to decode are logged and dropped. Every decoded message is
//! tagged with the source address it arrived from.
//!
//! Messages already queued when the server stops are flushed before the send
//! pump exits; anything enqueued while stopped is discarded on the next start.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::messages::{deserialize_message, serialize_message, Message, MAX_MESSAGE_SIZE};
use crate::protocols::ServerControl;

struct Running {
    cancel: CancellationToken,
    recv_task: JoinHandle<()>,
    send_task: JoinHandle<mpsc::Receiver<Message>>,
}

pub struct UdpServer {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    inbound_tx: mpsc::Sender<Message>,
    /// Present while stopped; owned by the send pump while running.
    outbound_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    running: Mutex<Option<Running>>,
}

impl UdpServer {
    /// Bind the socket and create the engine-facing channel pair.
    ///
    /// Returns the server together with the receiver the engine reads inbound
    /// messages from and the sender it writes outbound messages to.
    pub async fn bind(
        addr: SocketAddr,
        capacity: usize,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Message>, mpsc::Sender<Message>)> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind UDP socket on {}", addr))?;
        let local_addr = socket.local_addr().context("failed to get local address")?;

        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);

        let server = Arc::new(Self {
            socket: Arc::new(socket),
            local_addr,
            inbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            running: Mutex::new(None),
        });
        Ok((server, inbound_rx, outbound_tx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

async fn recv_pump(socket: Arc<UdpSocket>, inbound: mpsc::Sender<Message>, cancel: CancellationToken) {
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    loop {
        let (len, from) = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    // ICMP errors from earlier sends surface here on some platforms.
                    debug!(error = %e, "UDP receive error");
                    continue;
                }
            },
        };

        let message = match deserialize_message(&buf[..len]) {
            Ok(message) => message,
            Err(e) => {
                debug!(%from, len, error = %e, "dropping undecodable datagram");
                continue;
            }
        };
        trace!(%from, kind = %message.message_type(), "datagram received");
        let message = message.with_source(canonical(from));

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = inbound.send(message) => {
                if sent.is_err() {
                    debug!("engine inbound channel closed, receive pump exiting");
                    break;
                }
            }
        }
    }
}

/// Unmap IPv4-mapped IPv6 sources so they compare equal to resolved IPv4 addresses.
fn canonical(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip().to_canonical(), addr.port())
}

async fn send_pump(
    socket: Arc<UdpSocket>,
    mut outbound: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) -> mpsc::Receiver<Message> {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => return outbound,
            },
        };
        transmit(&socket, message).await;
    }

    // Messages enqueued before the stop (e.g. LEAVE) still go out.
    let mut flushed = 0usize;
    while let Ok(message) = outbound.try_recv() {
        transmit(&socket, message).await;
        flushed += 1;
    }
    if flushed > 0 {
        debug!(flushed, "flushed queued messages on stop");
    }
    outbound
}

async fn transmit(socket: &UdpSocket, message: Message) {
    let bytes = match serialize_message(&message) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "failed to encode outbound message");
            return;
        }
    };
    if bytes.len() > MAX_MESSAGE_SIZE {
        warn!(len = bytes.len(), "outbound message exceeds datagram limit, dropped");
        return;
    }

    let receiver = &message.receiver;
    let target = (receiver.address.as_str(), receiver.port);
    if let Err(e) = socket.send_to(&bytes, target).await {
        debug!(to = %receiver.endpoint(), error = %e, "UDP send failed");
    } else {
        trace!(to = %receiver.endpoint(), kind = %message.message_type(), "datagram sent");
    }
}

#[async_trait]
impl ServerControl for UdpServer {
    async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }
        let mut outbound = self
            .outbound_rx
            .lock()
            .await
            .take()
            .context("outbound channel is not available")?;

        // Anything enqueued while stopped is stale by now.
        let mut stale = 0usize;
        while outbound.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!(stale, "discarded messages queued while stopped");
        }

        let cancel = CancellationToken::new();
        let recv_task = tokio::spawn(recv_pump(
            self.socket.clone(),
            self.inbound_tx.clone(),
            cancel.clone(),
        ));
        let send_task = tokio::spawn(send_pump(self.socket.clone(), outbound, cancel.clone()));

        *running = Some(Running {
            cancel,
            recv_task,
            send_task,
        });
        info!(addr = %self.local_addr, "UDP server started");
        Ok(())
    }

    async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.cancel.cancel();

        if let Err(e) = running.recv_task.await {
            warn!(error = %e, "receive pump ended abnormally");
        }
        match running.send_task.await {
            Ok(outbound) => {
                *self.outbound_rx.lock().await = Some(outbound);
            }
            Err(e) => warn!(error = %e, "send pump ended abnormally"),
        }
        info!(addr = %self.local_addr, "UDP server stopped");
    }
}
