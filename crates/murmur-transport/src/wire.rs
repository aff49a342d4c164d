//! Wire envelopes for the room protocol.
//!
//! Every message on a room topic is one UTF-8 JSON object tagged by `type`.
//! Binary values are standard base64 text. Field names are fixed:
//!
//! ```text
//! {"type":"hs",       "fp":..., "pkB64":...}
//! {"type":"hs-ack",   "fp":..., "pkB64":...}
//! {"type":"join-req", "from":...}
//! {"type":"join-rej", "to":..., "from":...}
//! {"type":"room-key", "to":..., "from":..., "body":...}
//! {"type":"gchat",    "from":..., "body":..., "keyId":...}
//! {"type":"dm",       "to":..., "from":..., "body":...}
//! ```
//!
//! Unknown fields are ignored. Unknown `type` values fail to decode and are
//! dropped by the receiver.

use serde::{Deserialize, Serialize};

use crate::TransportError;

/// Maximum accepted envelope size in bytes.
pub const MAX_ENVELOPE_SIZE: usize = 64 * 1024;

/// A room protocol message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    /// Announce a public key.
    #[serde(rename = "hs")]
    Handshake {
        fp: String,
        #[serde(rename = "pkB64")]
        pk_b64: String,
    },

    /// Reply to a handshake from a newly pinned peer.
    #[serde(rename = "hs-ack")]
    HandshakeAck {
        fp: String,
        #[serde(rename = "pkB64")]
        pk_b64: String,
    },

    /// Ask the owner for admission.
    #[serde(rename = "join-req")]
    JoinRequest { from: String },

    /// Owner declines a join request.
    #[serde(rename = "join-rej")]
    JoinReject { to: String, from: String },

    /// Owner delivers the room key inside a sealed direct body.
    #[serde(rename = "room-key")]
    RoomKey {
        to: String,
        from: String,
        body: String,
    },

    /// Room message sealed under the room key named by `key_id`.
    #[serde(rename = "gchat")]
    GroupChat {
        from: String,
        body: String,
        #[serde(rename = "keyId")]
        key_id: String,
    },

    /// Pairwise sealed message.
    #[serde(rename = "dm")]
    Direct {
        to: String,
        from: String,
        body: String,
    },
}

impl Envelope {
    /// The `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "hs",
            Self::HandshakeAck { .. } => "hs-ack",
            Self::JoinRequest { .. } => "join-req",
            Self::JoinReject { .. } => "join-rej",
            Self::RoomKey { .. } => "room-key",
            Self::GroupChat { .. } => "gchat",
            Self::Direct { .. } => "dm",
        }
    }

    /// The claimed sender fingerprint.
    pub fn sender(&self) -> &str {
        match self {
            Self::Handshake { fp, .. } | Self::HandshakeAck { fp, .. } => fp,
            Self::JoinRequest { from }
            | Self::JoinReject { from, .. }
            | Self::RoomKey { from, .. }
            | Self::GroupChat { from, .. }
            | Self::Direct { from, .. } => from,
        }
    }

    /// The addressed recipient, for envelopes that have one.
    pub fn recipient(&self) -> Option<&str> {
        match self {
            Self::JoinReject { to, .. } | Self::RoomKey { to, .. } | Self::Direct { to, .. } => {
                Some(to)
            }
            _ => None,
        }
    }

    /// Encode as UTF-8 JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Serialization`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(self).map_err(|e| TransportError::Serialization(e.to_string()))
    }

    /// Decode UTF-8 JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ProtocolViolation`] for oversized input and
    /// [`TransportError::Deserialization`] for anything that is not a known
    /// envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        if bytes.len() > MAX_ENVELOPE_SIZE {
            return Err(TransportError::ProtocolViolation(format!(
                "envelope of {} bytes exceeds {MAX_ENVELOPE_SIZE}",
                bytes.len()
            )));
        }
        serde_json::from_slice(bytes).map_err(|e| TransportError::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json(envelope: &Envelope) -> serde_json::Value {
        serde_json::from_slice(&envelope.to_bytes().expect("encode")).expect("json")
    }

    #[test]
    fn test_handshake_field_names() {
        let value = json(&Envelope::Handshake {
            fp: "pk_AAAAAAAAAA".into(),
            pk_b64: "key".into(),
        });
        assert_eq!(
            value,
            serde_json::json!({"type": "hs", "fp": "pk_AAAAAAAAAA", "pkB64": "key"})
        );
    }

    #[test]
    fn test_gchat_field_names() {
        let value = json(&Envelope::GroupChat {
            from: "pk_a".into(),
            body: "{}".into(),
            key_id: "17".into(),
        });
        assert_eq!(
            value,
            serde_json::json!({"type": "gchat", "from": "pk_a", "body": "{}", "keyId": "17"})
        );
    }

    #[test]
    fn test_decode_from_foreign_json() {
        let raw = br#"{"type":"room-key","from":"pk_o","to":"pk_m","body":"x","extra":1}"#;
        let envelope = Envelope::from_bytes(raw).expect("decode");
        assert_eq!(
            envelope,
            Envelope::RoomKey {
                to: "pk_m".into(),
                from: "pk_o".into(),
                body: "x".into()
            }
        );
        assert_eq!(envelope.kind(), "room-key");
        assert_eq!(envelope.sender(), "pk_o");
        assert_eq!(envelope.recipient(), Some("pk_m"));
    }

    #[test]
    fn test_every_tag() {
        let cases = [
            (r#"{"type":"hs-ack","fp":"a","pkB64":"b"}"#, "hs-ack"),
            (r#"{"type":"join-req","from":"a"}"#, "join-req"),
            (r#"{"type":"join-rej","to":"a","from":"b"}"#, "join-rej"),
            (r#"{"type":"dm","to":"a","from":"b","body":"c"}"#, "dm"),
        ];
        for (raw, kind) in cases {
            let envelope = Envelope::from_bytes(raw.as_bytes()).expect("decode");
            assert_eq!(envelope.kind(), kind);
        }
    }

    #[test]
    fn test_malformed_rejected() {
        let cases: [&[u8]; 5] = [
            br#"{"type":"presence","from":"a"}"#,
            br#"{"type":"gchat","from":"a"}"#,
            br#"{"fp":"a","pkB64":"b"}"#,
            b"not json",
            &[0xff, 0xfe],
        ];
        for raw in cases {
            assert!(matches!(
                Envelope::from_bytes(raw),
                Err(TransportError::Deserialization(_))
            ));
        }
    }

    #[test]
    fn test_oversized_rejected() {
        let raw = vec![b' '; MAX_ENVELOPE_SIZE + 1];
        assert!(matches!(
            Envelope::from_bytes(&raw),
            Err(TransportError::ProtocolViolation(_))
        ));
    }
}
