//! # Wire Protocol Messages
//!
//! This module defines the protocol envelope exchanged between overlay nodes.
//! Messages are serialized using bincode with size limits to prevent memory exhaustion.
//!
//! ## Message Types
//!
//! | Type | Payload | Reply |
//! |------|---------|-------|
//! | `PING` | none | `PING_RESPONSE` |
//! | `PING_RESPONSE` | none | none |
//! | `FIND_NODE` | target `guid` | `FOUND_NODES` |
//! | `FOUND_NODES` | nearest peers | none |
//! | `LEAVE` | none | none |
//!
//! The payload lives in [`MessageBody`], so a message can only ever carry the
//! fields its type allows.

use std::fmt;
use std::net::SocketAddr;

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::identity::{Guid, Peer};

/// Largest datagram the transport will read or write.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_SIZE as u64)
        .with_fixint_encoding()
}

pub fn serialize_message(message: &Message) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(message)
}

pub fn deserialize_message(bytes: &[u8]) -> Result<Message, bincode::Error> {
    bincode_options().deserialize(bytes)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    Ping,
    PingResponse,
    FindNode,
    FoundNodes,
    Leave,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Ping => "PING",
            MessageType::PingResponse => "PING_RESPONSE",
            MessageType::FindNode => "FIND_NODE",
            MessageType::FoundNodes => "FOUND_NODES",
            MessageType::Leave => "LEAVE",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    Ping,
    PingResponse,
    FindNode {
        guid: Guid,
    },
    FoundNodes {
        nodes: Vec<Peer>,
    },
    Leave,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub sender: Peer,
    pub receiver: Peer,
    pub body: MessageBody,
    /// Address the datagram actually arrived from. Set by the transport on
    /// receipt, never encoded.
    #[serde(skip)]
    pub source: Option<SocketAddr>,
}

impl Message {
    fn new(sender: Peer, receiver: Peer, body: MessageBody) -> Self {
        Self {
            sender,
            receiver,
            body,
            source: None,
        }
    }

    pub fn ping(sender: Peer, receiver: Peer) -> Self {
        Self::new(sender, receiver, MessageBody::Ping)
    }

    pub fn ping_response(sender: Peer, receiver: Peer) -> Self {
        Self::new(sender, receiver, MessageBody::PingResponse)
    }

    pub fn find_node(sender: Peer, receiver: Peer, guid: Guid) -> Self {
        Self::new(sender, receiver, MessageBody::FindNode { guid })
    }

    pub fn found_nodes(sender: Peer, receiver: Peer, nodes: Vec<Peer>) -> Self {
        Self::new(sender, receiver, MessageBody::FoundNodes { nodes })
    }

    pub fn leave(sender: Peer, receiver: Peer) -> Self {
        Self::new(sender, receiver, MessageBody::Leave)
    }

    /// Record the observed source address of a received datagram.
    pub fn with_source(mut self, source: SocketAddr) -> Self {
        self.source = Some(source);
        self
    }

    pub fn message_type(&self) -> MessageType {
        match self.body {
            MessageBody::Ping => MessageType::Ping,
            MessageBody::PingResponse => MessageType::PingResponse,
            MessageBody::FindNode { .. } => MessageType::FindNode,
            MessageBody::FoundNodes { .. } => MessageType::FoundNodes,
            MessageBody::Leave => MessageType::Leave,
        }
    }
}
