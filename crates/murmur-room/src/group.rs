//! Room message encryption.
//!
//! A room message is bound to the key id it was sealed under. A receiver
//! only opens messages whose key id equals its current one; anything else is
//! a [`RoomError::StaleKey`], which is how a rotation shuts out holders of
//! the previous key.

use murmur_crypto::sealed;

use crate::{Result, Room, RoomError};

/// A sealed room message and the key id it was sealed under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupCiphertext {
    /// Sealed body (`{"n","b"}` JSON text).
    pub body: String,
    /// Key id in force when sealing.
    pub key_id: String,
}

impl Room {
    /// Seal `text` under the current room key.
    ///
    /// Returns `None` when the room has no key yet.
    pub fn encrypt_group(&self, text: &str) -> Result<Option<GroupCiphertext>> {
        let Some(key) = self.group_key()? else {
            return Ok(None);
        };
        let body = sealed::seal_group(key.key(), text).map_err(RoomError::Encrypt)?;
        Ok(Some(GroupCiphertext {
            body,
            key_id: key.key_id().to_string(),
        }))
    }

    /// Open a room message sealed under `key_id`.
    pub fn decrypt_group(&self, body: &str, key_id: &str) -> Result<String> {
        let key = self.group_key()?.ok_or(RoomError::NoGroupKey)?;
        if key.key_id() != key_id {
            return Err(RoomError::StaleKey {
                current: key.key_id().to_string(),
                received: key_id.to_string(),
            });
        }
        sealed::open_group(key.key(), body).map_err(RoomError::Decrypt)
    }
}
