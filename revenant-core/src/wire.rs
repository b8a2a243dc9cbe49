//! Framing: one UTF-8 JSON envelope per UDP datagram.
//!
//! ```text
//! { "v": 1, "room": "<sha256-hex>", "id": "<uuid>",
//!   "payload": { "iv": "<base64>", "data": "<base64>", "tag": "<base64>" } }
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{Sealed, NONCE_LEN, TAG_LEN};
use crate::protocol::MAX_DATAGRAM_LEN;

/// Outer, unencrypted structure of every datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u8,
    /// Room tag (hash of the room secret).
    pub room: String,
    pub id: Uuid,
    pub payload: EncryptedBlob,
}

/// AEAD output as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    #[serde(with = "b64_array")]
    pub iv: [u8; NONCE_LEN],
    #[serde(with = "b64")]
    pub data: Vec<u8>,
    #[serde(with = "b64_array")]
    pub tag: [u8; TAG_LEN],
}

impl From<Sealed> for EncryptedBlob {
    fn from(s: Sealed) -> Self {
        Self {
            iv: s.nonce,
            data: s.ciphertext,
            tag: s.tag,
        }
    }
}

impl From<EncryptedBlob> for Sealed {
    fn from(b: EncryptedBlob) -> Self {
        Self {
            nonce: b.iv,
            ciphertext: b.data,
            tag: b.tag,
        }
    }
}

/// Standard base64 (with padding) for `Vec<u8>` fields.
pub(crate) mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Standard base64 for fixed-size byte arrays; wrong decoded length is an error.
mod b64_array {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        v: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        super::b64::serialize(v, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        d: D,
    ) -> Result<[u8; N], D::Error> {
        let buf = super::b64::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom(format!("expected {} bytes", N)))
    }
}

/// Encode an envelope into one datagram payload.
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, FrameEncodeError> {
    let out = serde_json::to_vec(envelope)?;
    if out.len() > MAX_DATAGRAM_LEN {
        return Err(FrameEncodeError::TooLarge(out.len()));
    }
    Ok(out)
}

/// Error encoding an envelope (serialization or datagram size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("frame of {0} bytes exceeds the datagram limit")]
    TooLarge(usize),
}

/// Decode one datagram payload into an envelope. Does not check the room or decrypt.
pub fn decode_frame(bytes: &[u8]) -> Result<Envelope, FrameDecodeError> {
    if bytes.len() > MAX_DATAGRAM_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    let envelope: Envelope = serde_json::from_slice(bytes)?;
    if envelope.v == 0 {
        return Err(FrameDecodeError::Version);
    }
    Ok(envelope)
}

/// Error decoding a datagram (size, malformed JSON/base64, missing or zero version).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("frame too large")]
    TooLarge,
    #[error("missing envelope version")]
    Version,
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}
