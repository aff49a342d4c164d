//! Standard (padded) base64 as used by every binary field on the wire.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::{CryptoError, Result};

/// Encode bytes as standard padded base64.
pub fn b64_encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode standard padded base64.
pub fn b64_decode(text: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(text)
        .map_err(|e| CryptoError::Encoding(e.to_string()))
}

/// Decode standard base64 into a fixed-size array.
///
/// Fails with [`CryptoError::InvalidKeyLength`] when the decoded length is
/// not exactly `N`.
pub fn b64_decode_array<const N: usize>(text: &str) -> Result<[u8; N]> {
    let bytes = b64_decode(text)?;
    let actual = bytes.len();
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: N,
            actual,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding_is_kept() {
        assert_eq!(b64_encode(&[0xff]), "/w==");
        assert_eq!(b64_decode("/w==").expect("decode"), vec![0xff]);
    }

    #[test]
    fn test_decode_array_length_checked() {
        let text = b64_encode(&[7u8; 31]);
        let err = b64_decode_array::<32>(&text).expect_err("short input");
        assert!(matches!(
            err,
            CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 31
            }
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            b64_decode("not base64!"),
            Err(CryptoError::Encoding(_))
        ));
    }
}
