//! Events emitted to the UI collaborator.

use std::path::PathBuf;

use serde::Serialize;
use uuid::Uuid;

/// Join/leave announcement shown as a system line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SystemKind {
    Joined,
    Left,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    /// Chat text. `own` is set for the local echo of a sent message.
    NewMessage {
        id: Uuid,
        sender: String,
        content: String,
        timestamp: i64,
        own: bool,
    },
    System {
        sender: String,
        kind: SystemKind,
    },
    Typing {
        sender: String,
    },
    PeerJoined {
        name: String,
    },
    PeerLeft {
        name: String,
    },
    /// `count` includes the local identity.
    PeersChanged {
        count: usize,
        peers: Vec<String>,
    },
    FileSendStart {
        transfer_id: String,
        file_name: String,
        file_size: u64,
        total_chunks: u32,
    },
    FileSendProgress {
        transfer_id: String,
        sent: u32,
        total: u32,
    },
    FileSendComplete {
        transfer_id: String,
        file_name: String,
    },
    FileReceiveStart {
        transfer_id: String,
        file_name: String,
        file_size: u64,
        sender: String,
        mime_type: String,
    },
    FileReceiveProgress {
        transfer_id: String,
        received: u32,
        total: u32,
    },
    FileReceiveComplete {
        transfer_id: String,
        file_name: String,
        path: PathBuf,
        file_size: u64,
        sender: String,
        mime_type: String,
    },
    TransferError {
        transfer_id: Option<String>,
        message: String,
    },
}

impl Event {
    /// Fraction done for progress events.
    pub fn progress(&self) -> Option<f64> {
        let (done, total) = match self {
            Self::FileSendProgress { sent, total, .. } => (*sent, *total),
            Self::FileReceiveProgress {
                received, total, ..
            } => (*received, *total),
            _ => return None,
        };
        if total == 0 {
            return Some(1.0);
        }
        Some(f64::from(done) / f64::from(total))
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewMessage {
                sender, content, ..
            } => write!(f, "<{sender}> {content}"),
            Self::System {
                sender,
                kind: SystemKind::Joined,
            } => write!(f, "* {sender} joined"),
            Self::System {
                sender,
                kind: SystemKind::Left,
            } => write!(f, "* {sender} left"),
            Self::Typing { sender } => write!(f, "* {sender} is typing"),
            Self::PeerJoined { name } => write!(f, "* peer online: {name}"),
            Self::PeerLeft { name } => write!(f, "* peer offline: {name}"),
            Self::PeersChanged { count, peers } => {
                write!(f, "* {count} in room: {}", peers.join(", "))
            }
            Self::FileSendStart {
                file_name,
                file_size,
                ..
            } => write!(f, "* sending {file_name} ({file_size} bytes)"),
            Self::FileSendProgress { .. } | Self::FileReceiveProgress { .. } => {
                let pct = self.progress().unwrap_or(0.0) * 100.0;
                write!(f, "* transfer {pct:.0}%")
            }
            Self::FileSendComplete { file_name, .. } => write!(f, "* sent {file_name}"),
            Self::FileReceiveStart {
                file_name,
                sender,
                file_size,
                ..
            } => write!(f, "* {sender} is sending {file_name} ({file_size} bytes)"),
            Self::FileReceiveComplete { path, sender, .. } => {
                write!(f, "* received from {sender}: {}", path.display())
            }
            Self::TransferError { message, .. } => write!(f, "! transfer error: {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_fraction() {
        let e = Event::FileSendProgress {
            transfer_id: "t".into(),
            sent: 1,
            total: 4,
        };
        assert_eq!(e.progress(), Some(0.25));
        let e = Event::Typing { sender: "x".into() };
        assert_eq!(e.progress(), None);
    }

    #[test]
    fn serializes_with_event_tag() {
        let e = Event::PeersChanged {
            count: 2,
            peers: vec!["Bob".into()],
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["event"], "peers-changed");
        assert_eq!(v["count"], 2);
    }
}
