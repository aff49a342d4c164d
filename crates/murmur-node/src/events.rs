//! Event emission.
//!
//! Everything a user interface needs to show about a room (messages,
//! membership changes, trust warnings, dropped messages) is pushed through
//! the [`EventBus`]. Subscribers that fall behind lose the oldest events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// The room session started.
    Connected { owner: String },
    /// The room session ended.
    Left,
    /// A contact was pinned for the first time.
    ContactPinned { fingerprint: String },
    /// A handshake conflicted with a pin or with its own key.
    TrustMismatch { fingerprint: String },
    /// A join request reached this peer as owner.
    JoinRequested { fingerprint: String },
    /// The owner declined this peer's join request.
    JoinRejected { by: String },
    /// This peer received and installed a room key.
    Admitted { key_id: String, granted_by: String },
    /// This peer, as owner, admitted a member.
    MemberApproved { fingerprint: String },
    /// This peer, as owner, declined a join request.
    MemberRejected { fingerprint: String },
    /// This peer, as owner, removed a member and rotated the key.
    MemberKicked { fingerprint: String, key_id: String },
    /// This peer, as owner, rotated the key.
    KeyRotated { key_id: String },
    /// A room message was decrypted.
    GroupMessage { from: String, text: String },
    /// A direct message was decrypted.
    DirectMessage { from: String, text: String },
    /// A sealed message did not authenticate.
    DecryptFailed { from: String, reason: String },
    /// A room message used a key other than the current one.
    StaleKey {
        from: String,
        key_id: String,
        current: Option<String>,
    },
}

impl EventKind {
    /// Category used by [`EventFilter`]: "chat", "membership", "trust" or
    /// "error".
    pub fn category(&self) -> &'static str {
        match self {
            Self::GroupMessage { .. } | Self::DirectMessage { .. } => "chat",
            Self::ContactPinned { .. } | Self::TrustMismatch { .. } => "trust",
            Self::DecryptFailed { .. } | Self::StaleKey { .. } => "error",
            Self::Connected { .. }
            | Self::Left
            | Self::JoinRequested { .. }
            | Self::JoinRejected { .. }
            | Self::Admitted { .. }
            | Self::MemberApproved { .. }
            | Self::MemberRejected { .. }
            | Self::MemberKicked { .. }
            | Self::KeyRotated { .. } => "membership",
        }
    }
}

/// An event emitted by a room session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Room topic.
    pub room: String,
    /// Unix timestamp.
    pub timestamp: u64,
    /// What happened.
    pub kind: EventKind,
}

impl Event {
    /// Stamp `kind` for `room` with the current time.
    pub fn now(room: impl Into<String>, kind: EventKind) -> Self {
        Self {
            room: room.into(),
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            kind,
        }
    }
}

/// Filter for event subscriptions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// Category filter: "chat", "membership", "trust", "error".
    pub categories: Option<Vec<String>>,
    /// Filter to specific rooms.
    pub rooms: Option<Vec<String>>,
}

impl EventFilter {
    /// Check if an event matches this filter.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref categories) = self.categories {
            let category = event.kind.category();
            if !categories.iter().any(|c| c == category) {
                return false;
            }
        }
        if let Some(ref rooms) = self.rooms {
            if !rooms.iter().any(|r| *r == event.room) {
                return false;
            }
        }
        true
    }
}

/// Event bus for broadcasting events to subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: Event) {
        self.sequence.fetch_add(1, Ordering::SeqCst);
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Get the current sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}
