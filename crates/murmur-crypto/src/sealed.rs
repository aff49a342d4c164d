//! Sealed message bodies.
//!
//! A sealed body is the JSON text `{"n": <base64 nonce>, "b": <base64 box>}`
//! carried in the `body` field of `dm`, `room-key` and `gchat` envelopes.
//! Direct bodies are sealed under the pairwise [`BoxKey`]; group bodies under
//! the room key. Every seal draws a fresh random nonce.

use serde::{Deserialize, Serialize};

use crate::encoding::{b64_decode, b64_decode_array, b64_encode};
use crate::secretbox::{self, KEY_SIZE, NONCE_SIZE};
use crate::x25519::{BoxKey, X25519PublicKey, X25519StaticSecret};
use crate::{CryptoError, Result};

/// Wire form of a sealed payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBody {
    /// Base64 nonce.
    pub n: String,
    /// Base64 secretbox output.
    pub b: String,
}

impl SealedBody {
    /// Seal `plaintext` under `key` with a fresh nonce.
    pub fn seal(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Self> {
        let nonce = secretbox::random_nonce();
        let sealed = secretbox::seal(key, &nonce, plaintext)?;
        Ok(Self {
            n: b64_encode(&nonce),
            b: b64_encode(&sealed),
        })
    }

    /// Open this body under `key`.
    pub fn open(&self, key: &[u8; KEY_SIZE]) -> Result<Vec<u8>> {
        let nonce = b64_decode_array::<NONCE_SIZE>(&self.n)?;
        let sealed = b64_decode(&self.b)?;
        secretbox::open(key, &nonce, &sealed)
    }

    /// Serialize to the JSON text placed in an envelope's `body`.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| CryptoError::Serialization(e.to_string()))
    }

    /// Parse an envelope `body`.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| CryptoError::Serialization(e.to_string()))
    }
}

fn seal_text(key: &[u8; KEY_SIZE], text: &str) -> Result<String> {
    SealedBody::seal(key, text.as_bytes())?.to_json()
}

fn open_text(key: &[u8; KEY_SIZE], body: &str) -> Result<String> {
    let plaintext = SealedBody::from_json(body)?.open(key)?;
    String::from_utf8(plaintext)
        .map_err(|_| CryptoError::InvalidInput("plaintext is not UTF-8".into()))
}

/// Seal a direct message from `my_secret` to `their_public`.
pub fn seal_direct(my_secret: &X25519StaticSecret, their_public: &X25519PublicKey, text: &str) -> Result<String> {
    seal_with_box_key(&my_secret.box_key(their_public), text)
}

/// Open a direct message sent to `my_secret` by `their_public`.
pub fn open_direct(my_secret: &X25519StaticSecret, their_public: &X25519PublicKey, body: &str) -> Result<String> {
    open_with_box_key(&my_secret.box_key(their_public), body)
}

/// Seal with an already derived pairwise key.
pub fn seal_with_box_key(key: &BoxKey, text: &str) -> Result<String> {
    seal_text(key.as_bytes(), text)
}

/// Open with an already derived pairwise key.
pub fn open_with_box_key(key: &BoxKey, body: &str) -> Result<String> {
    open_text(key.as_bytes(), body)
}

/// Seal a room message under the room's symmetric key.
pub fn seal_group(room_key: &[u8; KEY_SIZE], text: &str) -> Result<String> {
    seal_text(room_key, text)
}

/// Open a room message under the room's symmetric key.
pub fn open_group(room_key: &[u8; KEY_SIZE], body: &str) -> Result<String> {
    open_text(room_key, body)
}
