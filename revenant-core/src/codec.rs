//! Envelope codec: room binding, encryption, integrity.
//!
//! `decode` is fail-closed. Anything that is not a well-formed envelope for the
//! configured room, sealed with that room's key, comes back as `None`.

use uuid::Uuid;

use crate::crypto::{self, CryptoError, KeyCache, RoomKey};
use crate::protocol::{InnerMessage, MessageKind, PROTOCOL_VERSION};
use crate::wire::{self, Envelope, FrameDecodeError, FrameEncodeError};

/// A message that passed room check and AEAD verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// Envelope id. Informational only; nothing deduplicates on it.
    pub id: Uuid,
    pub message: InnerMessage,
}

/// Current wall-clock time in Unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Stateful only through the single-slot key cache.
#[derive(Debug, Default)]
pub struct Codec {
    keys: KeyCache,
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seal an inner message for the room. Stamps the current time and a fresh envelope id.
    pub fn encode(
        &mut self,
        kind: MessageKind,
        content: &str,
        sender: &str,
        secret: &str,
    ) -> Result<Envelope, CodecError> {
        let inner = InnerMessage {
            kind,
            content: content.to_owned(),
            sender: sender.to_owned(),
            timestamp: now_millis(),
        };
        let plaintext = serde_json::to_vec(&inner).map_err(CodecError::Inner)?;
        let key = self.keys.get(secret);
        let sealed = crypto::encrypt_wire(key.key(), &plaintext)?;
        Ok(Envelope {
            v: PROTOCOL_VERSION,
            room: key.tag().to_owned(),
            id: Uuid::new_v4(),
            payload: sealed.into(),
        })
    }

    /// `encode` followed by framing. Returns the envelope id and the datagram bytes.
    pub fn encode_datagram(
        &mut self,
        kind: MessageKind,
        content: &str,
        sender: &str,
        secret: &str,
    ) -> Result<(Uuid, Vec<u8>), CodecError> {
        let envelope = self.encode(kind, content, sender, secret)?;
        let frame = wire::encode_frame(&envelope)?;
        Ok((envelope.id, frame))
    }

    /// Decode raw datagram bytes. `None` for anything not addressed to this room.
    pub fn decode(&mut self, bytes: &[u8], secret: &str) -> Option<Decoded> {
        let result = wire::decode_frame(bytes)
            .map_err(DecodeError::Frame)
            .and_then(|envelope| self.open(envelope, secret));
        match result {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                tracing::trace!(reason = %e, len = bytes.len(), "dropping datagram");
                None
            }
        }
    }

    /// Decode an already-parsed envelope.
    pub fn decode_envelope(&mut self, envelope: Envelope, secret: &str) -> Option<Decoded> {
        self.open(envelope, secret).ok()
    }

    fn open(&mut self, envelope: Envelope, secret: &str) -> Result<Decoded, DecodeError> {
        let key = self.keys.get(secret);
        if envelope.room != key.tag() {
            return Err(DecodeError::WrongRoom);
        }
        let plaintext = crypto::decrypt_wire(key.key(), &envelope.payload.into())?;
        let message: InnerMessage =
            serde_json::from_slice(&plaintext).map_err(DecodeError::Inner)?;
        Ok(Decoded {
            id: envelope.id,
            message,
        })
    }

    pub fn has_key_for(&self, secret: &str) -> bool {
        self.keys.holds(secret)
    }

    /// Seed the key cache with a key derived off the caller's thread.
    pub fn install_key(&mut self, secret: &str, key: RoomKey) {
        self.keys.install(secret, key);
    }

    /// PBKDF2 runs performed by this codec so far.
    pub fn key_derivations(&self) -> u64 {
        self.keys.derivations()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("inner message encode failed: {0}")]
    Inner(serde_json::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Frame(#[from] FrameEncodeError),
}

/// Why a datagram was dropped. Never surfaced past `decode`; logged at trace level.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("bad frame: {0}")]
    Frame(FrameDecodeError),
    #[error("room tag mismatch")]
    WrongRoom,
    #[error("aead verification failed")]
    Crypto(#[from] CryptoError),
    #[error("bad inner message: {0}")]
    Inner(serde_json::Error),
}
