//! Store key layout.
//!
//! Room-scoped keys embed the room topic so concurrent rooms operate on
//! disjoint namespaces.

/// The local identity key pair.
pub const IDENTITY: &str = "identity";

/// The pinned contact map (fingerprint to base64 public key).
pub const CONTACTS: &str = "contacts";

/// Prefix shared by every room-scoped key.
pub const ROOM_PREFIX: &str = "room:";

/// Member set of `room`.
pub fn room_members(room: &str) -> String {
    format!("{ROOM_PREFIX}{room}:members")
}

/// Pending join requests of `room`.
pub fn room_pending(room: &str) -> String {
    format!("{ROOM_PREFIX}{room}:pending")
}

/// Symmetric key of `room`.
pub fn room_key(room: &str) -> String {
    format!("{ROOM_PREFIX}{room}:key")
}

/// Identifier of the current symmetric key of `room`.
pub fn room_key_id(room: &str) -> String {
    format!("{ROOM_PREFIX}{room}:keyid")
}

/// Extract the room topic from a member-set key, if it is one.
pub fn room_from_members_key(key: &str) -> Option<&str> {
    key.strip_prefix(ROOM_PREFIX)?.strip_suffix(":members")
}
