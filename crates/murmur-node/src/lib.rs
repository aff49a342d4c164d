//! # murmur-node
//!
//! The protocol orchestrator: one [`Node`] per local identity, one room
//! session per joined room.
//!
//! ## Modules
//!
//! - [`node`] — Identity bootstrap, room registry, shutdown
//! - [`session`] — Per-room actor and the [`RoomHandle`] used to drive it
//! - [`handlers`] — Envelope dispatch and owner operations for one room
//! - [`rebroadcast`] — Cancellable handshake/join-request rebroadcast
//! - [`events`] — Event bus for surfacing protocol activity
//! - [`config`] — TOML configuration
//! - [`logging`] — `tracing` subscriber setup
//!
//! ## Flow
//!
//! ```text
//! transport bytes -> Envelope::from_bytes -> RoomContext::handle
//!                 -> replies -> Envelope::to_bytes -> transport publish
//! ```
//!
//! Every envelope for a room, including publishing its replies, is handled
//! to completion before the session looks at the next input. Protocol errors
//! are reported on the event bus and in the log; none of them stops a
//! session.

pub mod config;
pub mod events;
pub mod handlers;
pub mod logging;
pub mod node;
pub mod rebroadcast;
pub mod session;

use murmur_room::RoomError;
use murmur_transport::TransportError;
use murmur_trust::TrustError;

pub use config::NodeConfig;
pub use events::{Event, EventBus, EventFilter, EventKind};
pub use node::{Node, RoomMode};
pub use session::{RoomHandle, RoomSnapshot};

/// Per-message and per-command protocol failures. None of these is fatal.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A handshake disagrees with its own key or with the pinned key.
    #[error("trust mismatch for {fingerprint}")]
    TrustMismatch { fingerprint: String },

    /// Authenticated decryption failed.
    #[error("decryption failed for message from {from}: {reason}")]
    DecryptFailure { from: String, reason: String },

    /// A room message names a key other than the current one.
    #[error("stale key from {from}: message uses {received}, current is {}", .current.as_deref().unwrap_or("none"))]
    StaleKey {
        from: String,
        received: String,
        current: Option<String>,
    },

    /// An owner-only operation was attempted by a non-owner.
    #[error("not authorized: the room owner is {owner}")]
    NotAuthorized { owner: String },

    /// The room has no key to seal with.
    #[error("room has no group key")]
    NoGroupKey,

    /// Inbound bytes are not a usable envelope.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// No key is pinned for the peer.
    #[error("no pinned key for {0}")]
    UnknownPeer(String),

    /// The operation does not apply to this fingerprint.
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// Room state could not be read or written.
    #[error("room state error: {0}")]
    Room(#[from] RoomError),

    /// Contact state could not be read or written.
    #[error("trust store error: {0}")]
    Trust(#[from] TrustError),

    /// The room session is no longer running.
    #[error("room session closed")]
    SessionClosed,
}

/// Errors that stop a node or a room from starting.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// The identity store is unusable. Fatal to session start.
    #[error("identity store unusable: {0}")]
    Identity(#[source] TrustError),

    /// The transport refused an operation.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Initial room state could not be set up.
    #[error("room error: {0}")]
    Room(#[from] RoomError),

    /// The node has been shut down.
    #[error("node is shut down")]
    ShutDown,
}
