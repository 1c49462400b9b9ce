//! # kadproto - Kademlia-style Overlay Protocol Node
//!
//! kadproto implements the application-protocol layer of a Kademlia-like
//! peer-to-peer overlay:
//!
//! - **Liveness**: PING / PING_RESPONSE probes with cancellable eviction timeouts
//! - **Discovery**: FIND_NODE / FOUND_NODES exchanges that populate the routing table
//! - **Bootstrap**: joining an existing overlay through a well-known peer
//! - **Departure**: LEAVE announcements so peers drop us promptly
//!
//! ## Architecture
//!
//! The protocol engine talks to its collaborators through narrow seams:
//! - The routing table is reached through the [`RoutingLayer`] trait
//! - The transport is a pair of async channels of [`Message`]s
//! - The engine is a cheap-to-clone handle; one task consumes inbound
//!   messages in order and one task per outstanding ping tracks liveness
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining all components |
//! | `engine` | Message dispatch, handlers, ping/find_node/join/leave |
//! | `liveness` | Outstanding-ping registry and eviction timers |
//! | `identity` | Guids, endpoints, peer contacts |
//! | `messages` | Protocol envelope and bincode codec |
//! | `protocols` | Collaborator traits and the `Status` result |
//! | `routing` | In-memory routing table |
//! | `transport` | UDP server bridging datagrams to the engine |

mod engine;
mod identity;
mod liveness;
mod messages;
mod node;
mod protocols;
mod routing;
mod transport;

pub use engine::{
    ProtocolConfig, ProtocolEngine, DEFAULT_BOOTSTRAP_SETTLE, DEFAULT_CHANNEL_CAPACITY,
    DEFAULT_PING_TIMEOUT,
};
pub use identity::{Endpoint, Guid, Peer, PeerKey};
pub use messages::{
    deserialize_message, serialize_message, Message, MessageBody, MessageType, MAX_MESSAGE_SIZE,
};
pub use node::Node;
pub use protocols::{RoutingLayer, ServerControl, Status};
pub use routing::{MemoryRouting, DEFAULT_CAPACITY, DEFAULT_K};
pub use transport::UdpServer;
