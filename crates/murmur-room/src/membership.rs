//! Member and pending sets, and owner election.
//!
//! Both sets are stored as sorted JSON arrays. Every mutation is idempotent:
//! adding a present fingerprint or removing an absent one is a no-op, which
//! is what lets rebroadcast and reordered delivery converge.

use std::collections::BTreeSet;

use murmur_db::{keys, KvStoreExt};
use tracing::debug;

use crate::{Result, Room};

/// A sorted set of fingerprints.
pub type FingerprintSet = BTreeSet<String>;

/// The owner of a room: the smallest fingerprint in `members ∪ {self}`.
///
/// Pure and order-independent, so every peer holding the same member set
/// elects the same owner.
pub fn elect_owner<'a, I>(members: I, self_fingerprint: &'a str) -> String
where
    I: IntoIterator<Item = &'a String>,
{
    members
        .into_iter()
        .map(String::as_str)
        .chain(std::iter::once(self_fingerprint))
        .min()
        .unwrap_or(self_fingerprint)
        .to_string()
}

impl Room {
    fn load_set(&self, key: &str) -> Result<FingerprintSet> {
        Ok(self.store().get_json(key)?.unwrap_or_default())
    }

    fn save_set(&self, key: &str, set: &FingerprintSet) -> Result<()> {
        self.store().set_json(key, set)?;
        Ok(())
    }

    fn insert_into(&self, key: &str, fingerprint: &str) -> Result<bool> {
        let mut set = self.load_set(key)?;
        let inserted = set.insert(fingerprint.to_string());
        if inserted {
            self.save_set(key, &set)?;
        }
        Ok(inserted)
    }

    fn remove_from(&self, key: &str, fingerprint: &str) -> Result<bool> {
        let mut set = self.load_set(key)?;
        let removed = set.remove(fingerprint);
        if removed {
            self.save_set(key, &set)?;
        }
        Ok(removed)
    }

    /// Current member set.
    pub fn members(&self) -> Result<FingerprintSet> {
        self.load_set(&keys::room_members(self.name()))
    }

    /// Whether `fingerprint` is a member.
    pub fn is_member(&self, fingerprint: &str) -> Result<bool> {
        Ok(self.members()?.contains(fingerprint))
    }

    /// Add a member. Returns `true` if it was not already present.
    pub fn add_member(&self, fingerprint: &str) -> Result<bool> {
        let added = self.insert_into(&keys::room_members(self.name()), fingerprint)?;
        if added {
            debug!(room = self.name(), fingerprint, "member added");
        }
        Ok(added)
    }

    /// Remove a member. Returns `true` if it was present.
    pub fn remove_member(&self, fingerprint: &str) -> Result<bool> {
        let removed = self.remove_from(&keys::room_members(self.name()), fingerprint)?;
        if removed {
            debug!(room = self.name(), fingerprint, "member removed");
        }
        Ok(removed)
    }

    /// Replace the whole member set.
    pub fn set_members<I, S>(&self, members: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: FingerprintSet = members.into_iter().map(Into::into).collect();
        debug!(room = self.name(), count = set.len(), "member set replaced");
        self.save_set(&keys::room_members(self.name()), &set)
    }

    /// Current pending-join set.
    pub fn pending(&self) -> Result<FingerprintSet> {
        self.load_set(&keys::room_pending(self.name()))
    }

    /// Record a join request. Returns `true` if it was not already pending.
    pub fn add_pending(&self, fingerprint: &str) -> Result<bool> {
        self.insert_into(&keys::room_pending(self.name()), fingerprint)
    }

    /// Drop a join request. Returns `true` if it was pending.
    pub fn remove_pending(&self, fingerprint: &str) -> Result<bool> {
        self.remove_from(&keys::room_pending(self.name()), fingerprint)
    }

    /// The owner as seen from `self_fingerprint`, recomputed from the stored
    /// member set on every call.
    pub fn owner_fingerprint(&self, self_fingerprint: &str) -> Result<String> {
        Ok(elect_owner(&self.members()?, self_fingerprint))
    }

    /// Whether `self_fingerprint` is the owner.
    pub fn is_owner(&self, self_fingerprint: &str) -> Result<bool> {
        Ok(self.owner_fingerprint(self_fingerprint)? == self_fingerprint)
    }
}
