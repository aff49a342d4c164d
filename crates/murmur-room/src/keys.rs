//! Room key issue, rotation and installation.
//!
//! Key ids are decimal millisecond timestamps. A new id is never lower than
//! or equal to the id it replaces, even when the clock has not moved or has
//! stepped backwards, so an id names exactly one key for the life of a room.

use murmur_crypto::encoding::{b64_decode_array, b64_encode};
use murmur_crypto::secretbox::{self, KEY_SIZE};
use murmur_db::keys;
use serde::{Deserialize, Serialize};
use tracing::info;
use zeroize::Zeroize;

use crate::{Result, Room, RoomError};

/// A room key together with its identifier.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct RoomKey {
    key: [u8; KEY_SIZE],
    key_id: String,
}

impl RoomKey {
    /// Wrap raw key material.
    pub fn new(key: [u8; KEY_SIZE], key_id: impl Into<String>) -> Self {
        Self {
            key,
            key_id: key_id.into(),
        }
    }

    /// Generate a fresh key whose id follows `previous_id`.
    pub fn generate(previous_id: Option<&str>) -> Self {
        Self::new(secretbox::random_key(), next_key_id(previous_id))
    }

    /// The key bytes.
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// The key id.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Build the grant payload sent to a member.
    pub fn to_grant(&self, members: Option<Vec<String>>) -> KeyGrant {
        KeyGrant {
            key_b64: b64_encode(&self.key),
            key_id: self.key_id.clone(),
            members,
        }
    }
}

impl std::fmt::Debug for RoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomKey")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// Plaintext of a `room-key` direct message.
///
/// `members` is optional on the wire; grants from peers that do not send it
/// still install the key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyGrant {
    /// Base64 room key.
    pub key_b64: String,
    /// Identifier of the key.
    pub key_id: String,
    /// The owner's member set at the time of the grant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<String>>,
}

impl KeyGrant {
    /// Decode the carried key.
    pub fn room_key(&self) -> Result<RoomKey> {
        let key = b64_decode_array::<KEY_SIZE>(&self.key_b64)
            .map_err(|e| RoomError::InvalidKey(e.to_string()))?;
        if self.key_id.is_empty() {
            return Err(RoomError::InvalidKey("empty key id".into()));
        }
        Ok(RoomKey::new(key, self.key_id.clone()))
    }

    /// Serialize to the direct-message plaintext.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| RoomError::InvalidKey(e.to_string()))
    }

    /// Parse a direct-message plaintext.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| RoomError::InvalidKey(e.to_string()))
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The id for a key replacing `previous`.
pub fn next_key_id(previous: Option<&str>) -> String {
    let now = now_millis();
    let floor = previous.and_then(|id| id.parse::<u64>().ok());
    match floor {
        Some(prev) if now <= prev => (prev + 1).to_string(),
        _ => now.to_string(),
    }
}

/// Whether `candidate` names the key `current` names, or a later one.
///
/// A room with no key accepts anything. Ids that are not decimal only
/// compare equal to themselves.
pub fn key_id_at_least(candidate: &str, current: Option<&str>) -> bool {
    let Some(current) = current else {
        return true;
    };
    match (candidate.parse::<u64>(), current.parse::<u64>()) {
        (Ok(candidate), Ok(current)) => candidate >= current,
        _ => candidate == current,
    }
}

impl Room {
    /// The installed key, if both key and id are present.
    pub fn group_key(&self) -> Result<Option<RoomKey>> {
        let key = self.store().get(&keys::room_key(self.name()))?;
        let key_id = self.store().get(&keys::room_key_id(self.name()))?;
        match (key, key_id) {
            (Some(key), Some(key_id)) => {
                let bytes = b64_decode_array::<KEY_SIZE>(&key)
                    .map_err(|e| RoomError::InvalidKey(e.to_string()))?;
                Ok(Some(RoomKey::new(bytes, key_id)))
            }
            _ => Ok(None),
        }
    }

    /// Whether a key is installed.
    pub fn has_key(&self) -> Result<bool> {
        Ok(self.group_key()?.is_some())
    }

    /// Identifier of the installed key.
    pub fn current_key_id(&self) -> Result<Option<String>> {
        Ok(self.group_key()?.map(|k| k.key_id().to_string()))
    }

    fn install(&self, key: &RoomKey) -> Result<()> {
        self.store()
            .set(&keys::room_key_id(self.name()), key.key_id())?;
        self.store()
            .set(&keys::room_key(self.name()), &b64_encode(key.key()))?;
        Ok(())
    }

    /// Return the installed key, creating one if the room has none.
    pub fn ensure_room_key(&self) -> Result<RoomKey> {
        if let Some(key) = self.group_key()? {
            return Ok(key);
        }
        let previous = self.store().get(&keys::room_key_id(self.name()))?;
        let key = RoomKey::generate(previous.as_deref());
        self.install(&key)?;
        info!(room = self.name(), key_id = key.key_id(), "created room key");
        Ok(key)
    }

    /// Install a key received from the owner, replacing whatever is present.
    pub fn set_group_key_from_owner(&self, key: &RoomKey) -> Result<()> {
        self.install(key)?;
        info!(room = self.name(), key_id = key.key_id(), "installed room key from owner");
        Ok(())
    }

    /// Replace the room key with a fresh one. Messages sealed under the old
    /// key no longer decrypt.
    pub fn rotate_group_key(&self) -> Result<RoomKey> {
        let previous = self.current_key_id()?;
        let key = RoomKey::generate(previous.as_deref());
        self.install(&key)?;
        info!(
            room = self.name(),
            previous = previous.as_deref().unwrap_or("none"),
            key_id = key.key_id(),
            "rotated room key"
        );
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use murmur_db::memory::MemoryStore;

    fn room() -> Room {
        Room::new("lobby", Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let room = room();
        assert!(!room.has_key().expect("has"));
        let first = room.ensure_room_key().expect("ensure");
        let second = room.ensure_room_key().expect("ensure again");
        assert_eq!(first.key(), second.key());
        assert_eq!(first.key_id(), second.key_id());
    }

    #[test]
    fn test_rotate_changes_key_and_id() {
        let room = room();
        let first = room.ensure_room_key().expect("ensure");
        let rotated = room.rotate_group_key().expect("rotate");
        assert_ne!(first.key(), rotated.key());
        assert_ne!(first.key_id(), rotated.key_id());
        assert_eq!(
            room.current_key_id().expect("id").as_deref(),
            Some(rotated.key_id())
        );
    }

    #[test]
    fn test_key_ids_strictly_increase() {
        let room = room();
        let mut last: u64 = room
            .ensure_room_key()
            .expect("ensure")
            .key_id()
            .parse()
            .expect("decimal id");
        for _ in 0..20 {
            let id: u64 = room
                .rotate_group_key()
                .expect("rotate")
                .key_id()
                .parse()
                .expect("decimal id");
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn test_next_key_id_bumps_future_previous() {
        let future = (now_millis() + 60_000).to_string();
        let next: u64 = next_key_id(Some(&future)).parse().expect("decimal");
        assert_eq!(next, future.parse::<u64>().expect("decimal") + 1);
        assert!(next_key_id(Some("garbage")).parse::<u64>().is_ok());
    }

    #[test]
    fn test_set_from_owner_overwrites() {
        let room = room();
        room.ensure_room_key().expect("ensure");
        let granted = RoomKey::new([7u8; KEY_SIZE], "42");
        room.set_group_key_from_owner(&granted).expect("set");
        let installed = room.group_key().expect("get").expect("present");
        assert_eq!(installed.key(), &[7u8; KEY_SIZE]);
        assert_eq!(installed.key_id(), "42");
    }

    #[test]
    fn test_grant_wire_shape() {
        let key = RoomKey::new([1u8; KEY_SIZE], "1700000000000");
        let json = key.to_grant(None).to_json().expect("json");
        let value: serde_json::Value = serde_json::from_str(&json).expect("parse");
        assert_eq!(value["keyId"], "1700000000000");
        assert_eq!(value["keyB64"], b64_encode(&[1u8; KEY_SIZE]));
        assert!(value.get("members").is_none());

        let with_members = key
            .to_grant(Some(vec!["pk_a".into(), "pk_b".into()]))
            .to_json()
            .expect("json");
        let parsed = KeyGrant::from_json(&with_members).expect("parse");
        assert_eq!(parsed.members, Some(vec!["pk_a".into(), "pk_b".into()]));
        assert_eq!(parsed.room_key().expect("key").key(), key.key());
    }

    #[test]
    fn test_grant_without_members_field() {
        let grant = KeyGrant::from_json(&format!(
            r#"{{"keyB64":"{}","keyId":"5"}}"#,
            b64_encode(&[3u8; KEY_SIZE])
        ))
        .expect("parse");
        assert!(grant.members.is_none());
        assert_eq!(grant.room_key().expect("key").key_id(), "5");
    }

    #[test]
    fn test_grant_with_short_key_rejected() {
        let grant = KeyGrant {
            key_b64: b64_encode(&[1u8; 16]),
            key_id: "1".into(),
            members: None,
        };
        assert!(matches!(grant.room_key(), Err(RoomError::InvalidKey(_))));
    }

    #[test]
    fn test_key_id_ordering() {
        assert!(key_id_at_least("5", None));
        assert!(key_id_at_least("1700000000001", Some("1700000000000")));
        assert!(key_id_at_least("1700000000000", Some("1700000000000")));
        assert!(!key_id_at_least("999", Some("1000")));
        assert!(key_id_at_least("abc", Some("abc")));
        assert!(!key_id_at_least("abc", Some("1000")));
    }
}
