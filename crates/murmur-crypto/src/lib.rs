//! # murmur-crypto
//!
//! Cryptographic primitives for the murmur room protocol.
//!
//! Every construction here is wire-compatible with the NaCl `box` and
//! `secretbox` primitives so that peers running other NaCl implementations
//! can decrypt what we seal and vice versa. The suite is fixed; there is no
//! algorithm negotiation.
//!
//! ## Modules
//!
//! - [`x25519`] — X25519 identity keys and the NaCl `box.before` shared key
//! - [`secretbox`] — XSalsa20-Poly1305 authenticated encryption
//! - [`sealed`] — `{"n","b"}` sealed bodies for direct and group messages
//! - [`fingerprint`] — Peer fingerprints derived from public keys
//! - [`encoding`] — Standard base64 helpers used on the wire

pub mod encoding;
pub mod fingerprint;
pub mod sealed;
pub mod secretbox;
pub mod x25519;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AEAD decryption failed (authentication tag mismatch).
    #[error("AEAD decryption failed")]
    AeadDecryption,

    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    AeadEncryption,

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Base64 text could not be decoded.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Invalid input data.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Convenience result type for cryptographic operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
