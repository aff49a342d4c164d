//! Pinned contacts.
//!
//! The contact map is shared by every room the peer takes part in, so all
//! read-modify-write cycles on it go through the [`TrustStore`] lock.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use murmur_crypto::fingerprint;
use murmur_crypto::x25519::X25519PublicKey;
use murmur_db::{keys, DbError, KvStore, KvStoreExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::Result;

/// Fingerprint to base64 public key.
pub type ContactMap = BTreeMap<String, String>;

/// Outcome of [`TrustStore::add_or_verify_contact`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    /// The fingerprint was unknown and is now pinned to the key.
    Added,
    /// The fingerprint was already pinned to this exact key.
    Exists,
    /// The claim disagrees with the key or with the existing pin.
    Mismatch,
}

/// Trust-on-first-use address book over a [`KvStore`].
pub struct TrustStore {
    store: Arc<dyn KvStore>,
    lock: Mutex<()>,
}

impl TrustStore {
    /// Create a trust store over `store`.
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Pin or check a claimed `(fingerprint, public key)` pair.
    ///
    /// The fingerprint is recomputed from the key; a claim that disagrees with
    /// its own key is a mismatch and nothing is stored.
    pub fn add_or_verify_contact(
        &self,
        claimed_fingerprint: &str,
        public_key: &X25519PublicKey,
    ) -> Result<ContactStatus> {
        if !fingerprint::matches(claimed_fingerprint, public_key) {
            warn!(
                claimed = claimed_fingerprint,
                actual = %fingerprint::fingerprint(public_key),
                "handshake fingerprint does not match its key"
            );
            return Ok(ContactStatus::Mismatch);
        }

        let _guard = self.lock.lock().map_err(|_| DbError::LockPoisoned)?;
        let mut contacts = self.load()?;
        let encoded = public_key.to_base64();

        match contacts.get(claimed_fingerprint) {
            Some(pinned) if *pinned == encoded => Ok(ContactStatus::Exists),
            Some(_) => {
                warn!(
                    fingerprint = claimed_fingerprint,
                    "pinned key differs from claimed key"
                );
                Ok(ContactStatus::Mismatch)
            }
            None => {
                contacts.insert(claimed_fingerprint.to_string(), encoded);
                self.save(&contacts)?;
                debug!(fingerprint = claimed_fingerprint, "pinned new contact");
                Ok(ContactStatus::Added)
            }
        }
    }

    /// The public key pinned for `fingerprint`, if any.
    pub fn get_pinned_public_key(&self, fingerprint: &str) -> Result<Option<X25519PublicKey>> {
        let _guard = self.lock.lock().map_err(|_| DbError::LockPoisoned)?;
        self.load()?
            .get(fingerprint)
            .map(|encoded| X25519PublicKey::from_base64(encoded).map_err(Into::into))
            .transpose()
    }

    /// All pinned fingerprints, sorted.
    pub fn list_contacts(&self) -> Result<Vec<String>> {
        let _guard = self.lock.lock().map_err(|_| DbError::LockPoisoned)?;
        Ok(self.load()?.into_keys().collect())
    }

    /// Snapshot of the whole contact map.
    pub fn contacts(&self) -> Result<ContactMap> {
        let _guard = self.lock.lock().map_err(|_| DbError::LockPoisoned)?;
        self.load()
    }

    /// Run `f` over the contact map while holding the lock, saving the result.
    pub(crate) fn update<T>(&self, f: impl FnOnce(&mut ContactMap) -> T) -> Result<T> {
        let _guard = self.lock.lock().map_err(|_| DbError::LockPoisoned)?;
        let mut contacts = self.load()?;
        let out = f(&mut contacts);
        self.save(&contacts)?;
        Ok(out)
    }

    /// Hold the lock while `f` runs against the raw store.
    pub(crate) fn with_lock<T>(&self, f: impl FnOnce(&dyn KvStore) -> Result<T>) -> Result<T> {
        let _guard = self.lock.lock().map_err(|_| DbError::LockPoisoned)?;
        f(self.store.as_ref())
    }

    fn load(&self) -> Result<ContactMap> {
        Ok(self.store.get_json(keys::CONTACTS)?.unwrap_or_default())
    }

    fn save(&self, contacts: &ContactMap) -> Result<()> {
        self.store.set_json(keys::CONTACTS, contacts)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_crypto::x25519::X25519StaticSecret;
    use murmur_db::memory::MemoryStore;

    fn trust() -> TrustStore {
        TrustStore::new(Arc::new(MemoryStore::new()))
    }

    fn keypair() -> (String, X25519PublicKey) {
        let pk = X25519StaticSecret::random().public_key();
        (fingerprint::fingerprint(&pk), pk)
    }

    #[test]
    fn test_added_then_exists() {
        let trust = trust();
        let (fp, pk) = keypair();
        assert_eq!(
            trust.add_or_verify_contact(&fp, &pk).expect("add"),
            ContactStatus::Added
        );
        assert_eq!(
            trust.add_or_verify_contact(&fp, &pk).expect("verify"),
            ContactStatus::Exists
        );
        assert_eq!(
            trust.get_pinned_public_key(&fp).expect("get"),
            Some(pk)
        );
    }

    #[test]
    fn test_claim_not_matching_key_is_mismatch() {
        let trust = trust();
        let (fp, _) = keypair();
        let (_, other_pk) = keypair();
        assert_eq!(
            trust.add_or_verify_contact(&fp, &other_pk).expect("verify"),
            ContactStatus::Mismatch
        );
        assert!(trust.get_pinned_public_key(&fp).expect("get").is_none());
    }

    #[test]
    fn test_pinned_key_never_overwritten() {
        let trust = trust();
        let (fp, pk) = keypair();
        trust.add_or_verify_contact(&fp, &pk).expect("add");

        // A different key whose fingerprint collides with the pin. Real
        // collisions need grinding, so forge the stored pin instead.
        let (_, impostor) = keypair();
        trust
            .update(|contacts| contacts.insert(fp.clone(), impostor.to_base64()))
            .expect("forge");
        assert_eq!(
            trust.add_or_verify_contact(&fp, &pk).expect("verify"),
            ContactStatus::Mismatch
        );
        assert_eq!(
            trust.get_pinned_public_key(&fp).expect("get"),
            Some(impostor)
        );
    }

    #[test]
    fn test_unknown_contact_absent() {
        let trust = trust();
        assert!(trust
            .get_pinned_public_key("pk_AAAAAAAAAA")
            .expect("get")
            .is_none());
    }

    #[test]
    fn test_list_contacts_sorted() {
        let trust = trust();
        let mut expected = Vec::new();
        for _ in 0..3 {
            let (fp, pk) = keypair();
            trust.add_or_verify_contact(&fp, &pk).expect("add");
            expected.push(fp);
        }
        expected.sort();
        assert_eq!(trust.list_contacts().expect("list"), expected);
    }

    #[test]
    fn test_contacts_shared_across_handles() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let a = TrustStore::new(store.clone());
        let b = TrustStore::new(store);
        let (fp, pk) = keypair();
        a.add_or_verify_contact(&fp, &pk).expect("add");
        assert_eq!(
            b.add_or_verify_contact(&fp, &pk).expect("verify"),
            ContactStatus::Exists
        );
    }
}
