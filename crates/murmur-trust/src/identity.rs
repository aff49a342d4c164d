//! Local identity.
//!
//! The identity is generated on first use and persisted under
//! [`murmur_db::keys::IDENTITY`] as `{"publicKey", "secretKey"}` in standard
//! base64, the same shape the backup file uses. It is never transmitted.

use std::fmt;

use murmur_crypto::encoding::{b64_decode_array, b64_encode};
use murmur_crypto::fingerprint::fingerprint;
use murmur_crypto::x25519::{X25519PublicKey, X25519StaticSecret, KEY_SIZE};
use murmur_db::{keys, DbError, KvStore, KvStoreExt};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Result, TrustError};

/// Persisted form of an identity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredIdentity {
    /// Base64 public key.
    #[serde(default)]
    pub public_key: String,
    /// Base64 secret key.
    #[serde(default)]
    pub secret_key: String,
}

impl StoredIdentity {
    /// Whether both halves are present. Backups written without an identity
    /// carry empty strings here.
    pub fn is_complete(&self) -> bool {
        !self.public_key.is_empty() && !self.secret_key.is_empty()
    }
}

/// The local peer's key pair and its fingerprint.
#[derive(Clone)]
pub struct Identity {
    secret: X25519StaticSecret,
    public: X25519PublicKey,
    fingerprint: String,
}

impl Identity {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        Self::from_secret(X25519StaticSecret::random())
    }

    /// Build an identity around an existing secret.
    pub fn from_secret(secret: X25519StaticSecret) -> Self {
        let public = secret.public_key();
        let fingerprint = fingerprint(&public);
        Self {
            secret,
            public,
            fingerprint,
        }
    }

    /// Decode a persisted identity.
    ///
    /// The stored public key must be the one derived from the stored secret.
    pub fn from_stored(stored: &StoredIdentity) -> Result<Self> {
        let secret_bytes = b64_decode_array::<KEY_SIZE>(&stored.secret_key)
            .map_err(|e| TrustError::CorruptIdentity(format!("secret key: {e}")))?;
        let public = X25519PublicKey::from_base64(&stored.public_key)
            .map_err(|e| TrustError::CorruptIdentity(format!("public key: {e}")))?;
        let identity = Self::from_secret(X25519StaticSecret::from_bytes(secret_bytes));
        if identity.public != public {
            return Err(TrustError::CorruptIdentity(
                "public key does not match secret key".into(),
            ));
        }
        Ok(identity)
    }

    /// Encode for persistence or backup.
    pub fn to_stored(&self) -> StoredIdentity {
        StoredIdentity {
            public_key: self.public.to_base64(),
            secret_key: b64_encode(&self.secret.to_bytes()),
        }
    }

    /// The identity secret.
    pub fn secret(&self) -> &X25519StaticSecret {
        &self.secret
    }

    /// The identity public key.
    pub fn public_key(&self) -> &X25519PublicKey {
        &self.public
    }

    /// The fingerprint of the public key.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Load the persisted identity, if any.
pub fn load_identity(store: &dyn KvStore) -> Result<Option<Identity>> {
    let stored: Option<StoredIdentity> = store.get_json(keys::IDENTITY).map_err(|e| match e {
        DbError::Corrupt { reason, .. } => TrustError::CorruptIdentity(reason),
        other => TrustError::Store(other),
    })?;
    stored.as_ref().map(Identity::from_stored).transpose()
}

/// Persist `identity`, replacing any previous one.
pub fn store_identity(store: &dyn KvStore, identity: &Identity) -> Result<()> {
    store.set_json(keys::IDENTITY, &identity.to_stored())?;
    Ok(())
}

/// Return the persisted identity, generating and persisting one on first use.
///
/// An identity that is present but unreadable is an error, never silently
/// regenerated: regenerating would change the fingerprint every contact has
/// pinned.
pub fn get_or_create_identity(store: &dyn KvStore) -> Result<Identity> {
    if let Some(identity) = load_identity(store)? {
        return Ok(identity);
    }
    let identity = Identity::generate();
    store_identity(store, &identity)?;
    info!(fingerprint = %identity.fingerprint(), "generated new identity");
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_db::memory::MemoryStore;

    #[test]
    fn test_identity_created_once() {
        let store = MemoryStore::new();
        let first = get_or_create_identity(&store).expect("create");
        let second = get_or_create_identity(&store).expect("load");
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(first.public_key(), second.public_key());
    }

    #[test]
    fn test_stored_shape() {
        let store = MemoryStore::new();
        let identity = get_or_create_identity(&store).expect("create");
        let raw = store.get(keys::IDENTITY).expect("get").expect("present");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["publicKey"], identity.public_key().to_base64());
        assert!(value["secretKey"].is_string());
    }

    #[test]
    fn test_corrupt_identity_is_fatal() {
        let store = MemoryStore::new();
        store.set(keys::IDENTITY, "not json").expect("set");
        assert!(matches!(
            get_or_create_identity(&store),
            Err(TrustError::CorruptIdentity(_))
        ));
    }

    #[test]
    fn test_mismatched_halves_rejected() {
        let a = Identity::generate().to_stored();
        let b = Identity::generate().to_stored();
        let mixed = StoredIdentity {
            public_key: a.public_key,
            secret_key: b.secret_key,
        };
        assert!(matches!(
            Identity::from_stored(&mixed),
            Err(TrustError::CorruptIdentity(_))
        ));
    }

    #[test]
    fn test_debug_hides_secret() {
        let identity = Identity::generate();
        let printed = format!("{identity:?}");
        assert!(printed.contains(identity.fingerprint()));
        assert!(!printed.contains(&identity.to_stored().secret_key));
    }
}
