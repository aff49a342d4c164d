//! XSalsa20-Poly1305 authenticated encryption (NaCl `secretbox`).
//!
//! Used for both pairwise messages (under a [`crate::x25519::BoxKey`]) and
//! room messages (under the room's symmetric key). Output is the 16-byte
//! Poly1305 tag followed by the ciphertext, the NaCl layout.

use crypto_secretbox::aead::generic_array::GenericArray;
use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::XSalsa20Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::{CryptoError, Result};

/// Nonce size for XSalsa20-Poly1305 (192 bits = 24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Key size for XSalsa20-Poly1305 (256 bits = 32 bytes).
pub const KEY_SIZE: usize = 32;

/// Authentication tag size (128 bits = 16 bytes).
pub const TAG_SIZE: usize = 16;

/// Encrypt data with XSalsa20-Poly1305.
///
/// # Arguments
///
/// * `key` - 32-byte encryption key
/// * `nonce` - 24-byte nonce (must never be reused with the same key)
/// * `plaintext` - Data to encrypt
///
/// # Returns
///
/// The 16-byte authentication tag followed by the ciphertext.
pub fn seal(key: &[u8; KEY_SIZE], nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XSalsa20Poly1305::new(GenericArray::from_slice(key));
    cipher
        .encrypt(GenericArray::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::AeadEncryption)
}

/// Decrypt data with XSalsa20-Poly1305.
///
/// Returns [`CryptoError::AeadDecryption`] when the tag does not verify;
/// forged or truncated input never yields plaintext.
pub fn open(key: &[u8; KEY_SIZE], nonce: &[u8; NONCE_SIZE], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < TAG_SIZE {
        return Err(CryptoError::AeadDecryption);
    }
    let cipher = XSalsa20Poly1305::new(GenericArray::from_slice(key));
    cipher
        .decrypt(GenericArray::from_slice(nonce), sealed)
        .map_err(|_| CryptoError::AeadDecryption)
}

/// Generate a fresh random nonce.
pub fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Generate a fresh random symmetric key.
pub fn random_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}
