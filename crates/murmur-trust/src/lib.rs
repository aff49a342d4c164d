//! # murmur-trust
//!
//! The local identity and the trust-on-first-use address book.
//!
//! ## Modules
//!
//! - [`identity`] — The long-lived X25519 key pair, created once per store
//! - [`contacts`] — Pinned contacts keyed by fingerprint, with mismatch detection
//! - [`backup`] — Versioned export and restore of identity plus contacts
//!
//! A contact is pinned the first time a valid handshake names it. From then
//! on a different key claiming the same fingerprint is a mismatch: it is
//! reported and never replaces the pin.

pub mod backup;
pub mod contacts;
pub mod identity;

use murmur_crypto::CryptoError;
use murmur_db::DbError;

/// Errors from the identity and trust store.
#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    /// Underlying store failure.
    #[error("store error: {0}")]
    Store(#[from] DbError),

    /// A stored or supplied key could not be decoded.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The persisted identity exists but cannot be used.
    #[error("stored identity is unreadable: {0}")]
    CorruptIdentity(String),

    /// Backup file carries a version this build does not understand.
    #[error("unsupported backup version: {0}")]
    UnsupportedBackupVersion(u64),

    /// Backup file is not valid JSON of the expected shape.
    #[error("malformed backup: {0}")]
    MalformedBackup(String),
}

pub type Result<T> = std::result::Result<T, TrustError>;

pub use contacts::{ContactStatus, TrustStore};
pub use identity::{get_or_create_identity, Identity};
