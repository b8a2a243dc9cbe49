//! Revenant room protocol: encrypted LAN broadcast chat, presence and file transfer.
//! Host-driven: no I/O; host passes datagrams and clock ticks, receives events and actions.

pub mod chunk;
pub mod codec;
pub mod core;
pub mod crypto;
pub mod event;
pub mod presence;
pub mod protocol;
pub mod transfer;
pub mod wire;

pub use codec::{now_millis, Codec, CodecError, Decoded};
pub use core::{Action, Room};
pub use crypto::{room_tag, CryptoError, KeyCache, RoomKey};
pub use event::{Event, SystemKind};
pub use presence::Presence;
pub use protocol::{FileChunk, FileMeta, FilePayload, InnerMessage, MessageKind, PROTOCOL_VERSION};
pub use transfer::{CompletedFile, InboundTransfers, OutboundTransfer, Outcome, TransferError};
pub use wire::{decode_frame, encode_frame, Envelope, FrameDecodeError, FrameEncodeError};
