//! Peer fingerprints.
//!
//! A fingerprint is `"pk_"` followed by the first ten characters of the
//! standard base64 encoding of the 32-byte public key. It is the only peer
//! identifier used on the wire, and it is always recomputed from the key
//! rather than taken from a claim.

use crate::x25519::X25519PublicKey;

/// Prefix shared by every fingerprint.
pub const FINGERPRINT_PREFIX: &str = "pk_";

/// Number of base64 characters kept after the prefix.
pub const FINGERPRINT_CHARS: usize = 10;

/// Compute the fingerprint of a public key.
pub fn fingerprint(public_key: &X25519PublicKey) -> String {
    let encoded = public_key.to_base64();
    let mut fp = String::with_capacity(FINGERPRINT_PREFIX.len() + FINGERPRINT_CHARS);
    fp.push_str(FINGERPRINT_PREFIX);
    fp.extend(encoded.chars().take(FINGERPRINT_CHARS));
    fp
}

/// Whether `claimed` is the fingerprint of `public_key`.
pub fn matches(claimed: &str, public_key: &X25519PublicKey) -> bool {
    fingerprint(public_key) == claimed
}
