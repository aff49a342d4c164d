//! X25519 identity keys (RFC 7748) and the NaCl `box` shared key.
//!
//! A peer's long-lived identity is a single X25519 key pair. Pairwise
//! messages are sealed under [`BoxKey`], which is HSalsa20 applied to the raw
//! Diffie-Hellman output with an all-zero input block. This is exactly NaCl's
//! `crypto_box_beforenm`, so a key computed here opens boxes produced by any
//! NaCl implementation holding the same key pair.

use rand::rngs::OsRng;
use salsa20::cipher::consts::U10;
use salsa20::cipher::generic_array::GenericArray;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::encoding::{b64_decode_array, b64_encode};
use crate::Result;

/// Public and secret key size in bytes.
pub const KEY_SIZE: usize = 32;

/// An X25519 static secret key (the local identity secret).
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct X25519StaticSecret {
    inner: StaticSecret,
}

/// An X25519 public key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct X25519PublicKey {
    bytes: [u8; KEY_SIZE],
}

/// Raw X25519 Diffie-Hellman output.
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct SharedSecret {
    bytes: [u8; KEY_SIZE],
}

/// Precomputed pairwise key, equal to NaCl `box.before(theirPk, mySk)`.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct BoxKey {
    bytes: [u8; KEY_SIZE],
}

impl X25519StaticSecret {
    /// Generate a new random static secret.
    pub fn random() -> Self {
        Self {
            inner: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Create from raw bytes. The bytes are stored unclamped, as NaCl does.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self {
            inner: StaticSecret::from(bytes),
        }
    }

    /// Get the raw bytes of this secret.
    pub fn to_bytes(&self) -> [u8; KEY_SIZE] {
        self.inner.to_bytes()
    }

    /// Compute the corresponding public key.
    pub fn public_key(&self) -> X25519PublicKey {
        let pk = PublicKey::from(&self.inner);
        X25519PublicKey {
            bytes: pk.to_bytes(),
        }
    }

    /// Perform Diffie-Hellman key agreement.
    pub fn diffie_hellman(&self, their_public: &X25519PublicKey) -> SharedSecret {
        let pk = PublicKey::from(their_public.bytes);
        let shared = self.inner.diffie_hellman(&pk);
        SharedSecret {
            bytes: *shared.as_bytes(),
        }
    }

    /// Derive the pairwise box key shared with `their_public`.
    ///
    /// Commutative: `a.box_key(&B) == b.box_key(&A)`.
    pub fn box_key(&self, their_public: &X25519PublicKey) -> BoxKey {
        BoxKey::from_shared_secret(&self.diffie_hellman(their_public))
    }
}

impl X25519PublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Get the raw bytes.
    pub fn to_bytes(&self) -> [u8; KEY_SIZE] {
        self.bytes
    }

    /// Get the raw bytes as a slice.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Standard base64 of the key, the `pkB64` wire form.
    pub fn to_base64(&self) -> String {
        b64_encode(&self.bytes)
    }

    /// Parse a `pkB64` wire value.
    pub fn from_base64(text: &str) -> Result<Self> {
        Ok(Self {
            bytes: b64_decode_array::<KEY_SIZE>(text)?,
        })
    }
}

impl SharedSecret {
    /// Get the raw bytes of the shared secret.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl BoxKey {
    /// HSalsa20 over the shared secret with a zero 16-byte input.
    pub fn from_shared_secret(shared: &SharedSecret) -> Self {
        let zero_input = GenericArray::default();
        let derived = salsa20::hsalsa::<U10>(GenericArray::from_slice(shared.as_bytes()), &zero_input);
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(derived.as_slice());
        Self { bytes }
    }

    /// Get the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}
