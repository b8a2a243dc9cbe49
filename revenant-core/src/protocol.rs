//! Revenant room protocol: message kinds, inner (decrypted) message, file transfer payloads.

use serde::{Deserialize, Serialize};

use crate::wire::b64;

/// Envelope version written by this implementation.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest UDP payload over IPv4 (65535 - 8 UDP header - 20 IP header).
pub const MAX_DATAGRAM_LEN: usize = 65_507;

/// Kind of an inner message. Wire names are kebab-case (`file-meta`, `file-chunk`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Message,
    Typing,
    Join,
    Leave,
    Heartbeat,
    FileMeta,
    FileChunk,
}

/// Decrypted payload of an envelope. Built at send time, dropped after dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InnerMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    pub sender: String,
    /// Unix milliseconds at send time.
    pub timestamp: i64,
}

/// JSON carried in `content` of `file-meta` / `file-chunk` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FilePayload {
    FileMeta(FileMeta),
    FileChunk(FileChunk),
}

/// Announces a transfer before any chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub transfer_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u32,
    pub mime_type: String,
}

/// One slice of a file, addressed by index.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunk {
    pub transfer_id: String,
    pub index: u32,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

impl std::fmt::Debug for FileChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileChunk")
            .field("transfer_id", &self.transfer_id)
            .field("index", &self.index)
            .field("len", &self.data.len())
            .finish()
    }
}

impl FilePayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::FileMeta(_) => MessageKind::FileMeta,
            Self::FileChunk(_) => MessageKind::FileChunk,
        }
    }

    pub fn to_content(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_content(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_wire_names() {
        let names: Vec<String> = [
            MessageKind::Message,
            MessageKind::Typing,
            MessageKind::Join,
            MessageKind::Leave,
            MessageKind::Heartbeat,
            MessageKind::FileMeta,
            MessageKind::FileChunk,
        ]
        .iter()
        .map(|k| serde_json::to_string(k).unwrap())
        .collect();
        assert_eq!(
            names,
            [
                "\"message\"",
                "\"typing\"",
                "\"join\"",
                "\"leave\"",
                "\"heartbeat\"",
                "\"file-meta\"",
                "\"file-chunk\""
            ]
        );
    }

    #[test]
    fn inner_message_field_names() {
        let msg = InnerMessage {
            kind: MessageKind::Message,
            content: "hi".into(),
            sender: "Alice".into(),
            timestamp: 1_700_000_000_000,
        };
        let v: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "message");
        assert_eq!(v["content"], "hi");
        assert_eq!(v["sender"], "Alice");
        assert_eq!(v["timestamp"], 1_700_000_000_000i64);
    }

    #[test]
    fn file_meta_content_shape() {
        let meta = FilePayload::FileMeta(FileMeta {
            transfer_id: "abc".into(),
            file_name: "cat.png".into(),
            file_size: 9000,
            total_chunks: 2,
            mime_type: "image/png".into(),
        });
        let v: serde_json::Value = serde_json::from_str(&meta.to_content().unwrap()).unwrap();
        assert_eq!(v["type"], "file-meta");
        assert_eq!(v["transferId"], "abc");
        assert_eq!(v["fileName"], "cat.png");
        assert_eq!(v["fileSize"], 9000);
        assert_eq!(v["totalChunks"], 2);
        assert_eq!(v["mimeType"], "image/png");
    }

    #[test]
    fn file_chunk_data_is_base64() {
        let chunk = FilePayload::FileChunk(FileChunk {
            transfer_id: "abc".into(),
            index: 3,
            data: b"hello".to_vec(),
        });
        let content = chunk.to_content().unwrap();
        let v: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(v["type"], "file-chunk");
        assert_eq!(v["index"], 3);
        assert_eq!(v["data"], "aGVsbG8=");
        assert_eq!(FilePayload::from_content(&content).unwrap(), chunk);
    }

    #[test]
    fn untyped_content_is_rejected() {
        assert!(FilePayload::from_content(r#"{"transferId":"x","index":0,"data":""}"#).is_err());
        assert!(FilePayload::from_content("not json").is_err());
    }
}
