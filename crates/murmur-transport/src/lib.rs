//! # murmur-transport
//!
//! The boundary between the room protocol and the peer-to-peer network.
//!
//! The protocol needs three things from a network: subscribe to a topic,
//! publish opaque bytes to a topic on a best-effort basis, and learn when a
//! new peer connects. [`Transport`] captures exactly that. Delivery may drop,
//! duplicate or reorder messages; the protocol is built to tolerate it.
//!
//! ## Architecture
//!
//! ```text
//! Room session
//!     |
//!     v
//! Envelope (wire.rs)        -- tagged JSON: hs, hs-ack, join-req, ...
//!     |
//!     v
//! Transport (this module)   -- publish / subscribe / peer events
//!     |
//!     v
//! MemoryHub (memory.rs)     -- in-process broadcast with fault injection
//! ```

pub mod memory;
pub mod wire;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

/// Error types for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Envelope could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Inbound bytes are not a well-formed envelope.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Protocol violation (oversized payload, etc.).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The peer is no longer attached to the network.
    #[error("transport closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Connectivity change reported by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    /// A peer became reachable.
    Connected { peer_id: String },
    /// A peer went away.
    Disconnected { peer_id: String },
}

/// Inbound payloads for one topic.
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Subscription {
    /// Wrap a receiver fed by a transport implementation.
    pub fn new(topic: impl Into<String>, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    /// The subscribed topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the next payload. `None` once the transport is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

/// A best-effort publish/subscribe network.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Network-level identifier of the local peer. Unrelated to fingerprints.
    fn peer_id(&self) -> &str;

    /// Start receiving payloads published to `topic` by other peers.
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;

    /// Publish `data` to every subscriber of `topic`. Best effort.
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()>;

    /// Stream of connectivity changes.
    fn peer_events(&self) -> broadcast::Receiver<PeerEvent>;
}
