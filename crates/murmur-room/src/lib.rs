//! # murmur-room
//!
//! Per-room membership and key management.
//!
//! A room is identified by its topic name and holds four pieces of derived,
//! per-peer state in the local store:
//!
//! - `members` — fingerprints admitted to the room (includes self once joined)
//! - `pending` — join requests awaiting the owner's decision
//! - `key` — the current 32-byte symmetric room key, if any
//! - `keyId` — decimal millisecond timestamp naming that key
//!
//! The owner is never stored. It is recomputed on demand as the smallest
//! fingerprint in `members ∪ {self}` (see [`membership::elect_owner`]).
//!
//! ## Modules
//!
//! - [`membership`] — Member and pending sets, owner election
//! - [`keys`] — Key issue, rotation, installation and the key grant payload
//! - [`group`] — Room message encryption bound to the current key id

pub mod group;
pub mod keys;
pub mod membership;

use std::sync::Arc;

use murmur_crypto::CryptoError;
use murmur_db::{keys as store_keys, DbError, KvStore};

/// Errors from room state operations.
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    /// Underlying store failure.
    #[error("store error: {0}")]
    Store(#[from] DbError),

    /// The room has no symmetric key yet.
    #[error("room has no group key")]
    NoGroupKey,

    /// A message names a key other than the current one.
    #[error("stale key: message uses {received}, current is {current}")]
    StaleKey { current: String, received: String },

    /// Authenticated decryption failed.
    #[error("decryption failed: {0}")]
    Decrypt(CryptoError),

    /// Sealing failed.
    #[error("encryption failed: {0}")]
    Encrypt(CryptoError),

    /// A stored key or a key grant cannot be decoded.
    #[error("invalid room key: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, RoomError>;

/// Handle to one room's state in the local store.
///
/// Cloning the handle does not copy state. Callers that mutate a room must
/// serialize their read-modify-write sequences; the node does this by giving
/// each room a single actor.
#[derive(Clone)]
pub struct Room {
    name: String,
    store: Arc<dyn KvStore>,
}

impl Room {
    /// Open the room named `name` in `store`.
    pub fn new(name: impl Into<String>, store: Arc<dyn KvStore>) -> Self {
        Self {
            name: name.into(),
            store,
        }
    }

    /// The room topic.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn store(&self) -> &dyn KvStore {
        self.store.as_ref()
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room").field("name", &self.name).finish()
    }
}

/// Topics of every room that has a stored member set.
pub fn known_rooms(store: &dyn KvStore) -> Result<Vec<String>> {
    Ok(store
        .keys(store_keys::ROOM_PREFIX)?
        .iter()
        .filter_map(|key| store_keys::room_from_members_key(key))
        .map(str::to_string)
        .collect())
}
