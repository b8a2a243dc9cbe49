//! Host-driven API: `Room` receives datagrams and clock ticks from the host,
//! returns events and actions.

use std::time::Instant;

use uuid::Uuid;

use crate::codec::{Codec, CodecError, Decoded};
use crate::crypto::RoomKey;
use crate::event::{Event, SystemKind};
use crate::presence::Presence;
use crate::protocol::{FilePayload, MessageKind};
use crate::transfer::{CompletedFile, InboundTransfers};

/// Action for the host to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Forward to the UI.
    Emit(Event),
    /// Arm the inbound inactivity timer. When it fires, call
    /// [`Room::expire_inbound`] with the same pair.
    StartInboundTimer {
        transfer_id: String,
        started_at: Instant,
    },
    /// Write the reassembled file to the download directory.
    SaveFile(CompletedFile),
}

/// One node's view of a room: identity, presence table, inbound transfers.
#[derive(Debug)]
pub struct Room {
    username: String,
    secret: String,
    codec: Codec,
    presence: Presence,
    inbound: InboundTransfers,
}

impl Room {
    pub fn new(username: &str, secret: &str) -> Self {
        Self {
            username: username.to_owned(),
            secret: secret.to_owned(),
            codec: Codec::new(),
            presence: Presence::new(),
            inbound: InboundTransfers::new(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Takes effect on the next outbound message.
    pub fn set_username(&mut self, username: &str) {
        self.username = username.to_owned();
    }

    /// Switch rooms. Peers and partial transfers belong to the old room and are dropped.
    pub fn set_secret(&mut self, secret: &str) -> Vec<Event> {
        if self.secret == secret {
            return Vec::new();
        }
        self.secret = secret.to_owned();
        self.inbound.clear();
        self.presence.clear()
    }

    /// True when the key for the current secret is cached and `encode` will not derive.
    pub fn key_ready(&self) -> bool {
        self.codec.has_key_for(&self.secret)
    }

    /// Hand over a key for `secret` derived outside the room. Keys for other secrets are ignored.
    pub fn install_key(&mut self, secret: &str, key: RoomKey) {
        if secret == self.secret {
            self.codec.install_key(secret, key);
        }
    }

    /// PBKDF2 runs the room performed itself.
    pub fn key_derivations(&self) -> u64 {
        self.codec.key_derivations()
    }

    /// Seal a message from the local identity. Returns the envelope id and datagram.
    pub fn encode(
        &mut self,
        kind: MessageKind,
        content: &str,
    ) -> Result<(Uuid, Vec<u8>), CodecError> {
        self.codec
            .encode_datagram(kind, content, &self.username, &self.secret)
    }

    /// Seal a file payload. The JSON form goes into the inner `content` field.
    pub fn encode_file(&mut self, payload: &FilePayload) -> Result<(Uuid, Vec<u8>), CodecError> {
        let content = payload.to_content().map_err(CodecError::Inner)?;
        self.encode(payload.kind(), &content)
    }

    /// Process one inbound datagram. Undecodable, foreign-room and self-sent
    /// datagrams produce nothing.
    pub fn on_datagram(&mut self, bytes: &[u8], now: Instant) -> Vec<Action> {
        let Some(decoded) = self.codec.decode(bytes, &self.secret) else {
            return Vec::new();
        };
        self.on_decoded(decoded, now)
    }

    fn on_decoded(&mut self, decoded: Decoded, now: Instant) -> Vec<Action> {
        let Decoded { id, message } = decoded;
        if message.sender == self.username {
            return Vec::new();
        }
        let mut actions: Vec<Action> = self
            .presence
            .on_message(message.kind, &message.sender, now)
            .into_iter()
            .map(Action::Emit)
            .collect();
        match message.kind {
            MessageKind::Message => actions.push(Action::Emit(Event::NewMessage {
                id,
                sender: message.sender,
                content: message.content,
                timestamp: message.timestamp,
                own: false,
            })),
            MessageKind::Typing => actions.push(Action::Emit(Event::Typing {
                sender: message.sender,
            })),
            MessageKind::Join => actions.push(Action::Emit(Event::System {
                sender: message.sender,
                kind: SystemKind::Joined,
            })),
            MessageKind::Leave => actions.push(Action::Emit(Event::System {
                sender: message.sender,
                kind: SystemKind::Left,
            })),
            MessageKind::Heartbeat => {}
            MessageKind::FileMeta | MessageKind::FileChunk => {
                match FilePayload::from_content(&message.content) {
                    Ok(FilePayload::FileMeta(meta)) => {
                        actions.extend(self.inbound.on_meta(meta, &message.sender, now));
                    }
                    Ok(FilePayload::FileChunk(chunk)) => {
                        actions.extend(self.inbound.on_chunk(chunk, now));
                    }
                    Err(e) => {
                        tracing::trace!(error = %e, from = %message.sender, "bad file payload");
                    }
                }
            }
        }
        actions
    }

    /// Liveness sweep. Call every [`crate::presence::SWEEP_INTERVAL`].
    pub fn sweep(&mut self, now: Instant) -> Vec<Event> {
        self.presence.sweep(now)
    }

    /// Inbound timer fired. True when partial state was discarded.
    pub fn expire_inbound(&mut self, transfer_id: &str, started_at: Instant) -> bool {
        self.inbound.expire(transfer_id, started_at)
    }

    pub fn clear_peers(&mut self) -> Vec<Event> {
        self.presence.clear()
    }

    pub fn clear_inbound(&mut self) {
        self.inbound.clear();
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    /// Tracked peers plus self.
    pub fn peer_count(&self) -> usize {
        self.presence.peer_count()
    }

    pub fn peer_names(&self) -> Vec<String> {
        self.presence.peer_names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::chunk::CHUNK_SIZE;
    use crate::presence::PEER_TIMEOUT;
    use crate::transfer::OutboundTransfer;

    fn events(actions: Vec<Action>) -> Vec<Event> {
        actions
            .into_iter()
            .filter_map(|a| match a {
                Action::Emit(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn chat_between_two_rooms() {
        let mut alice = Room::new("Alice", "default");
        let mut bob = Room::new("Bob", "default");
        let (id, frame) = alice.encode(MessageKind::Message, "hi").unwrap();
        let got = events(bob.on_datagram(&frame, Instant::now()));
        assert_eq!(got.len(), 1);
        let Event::NewMessage {
            id: got_id,
            sender,
            content,
            own,
            ..
        } = &got[0]
        else {
            panic!("expected message, got {got:?}");
        };
        assert_eq!(*got_id, id);
        assert_eq!(sender, "Alice");
        assert_eq!(content, "hi");
        assert!(!own);
    }

    #[test]
    fn different_secret_sees_nothing() {
        let mut alice = Room::new("Alice", "default");
        let mut carol = Room::new("Carol", "other");
        let (_, frame) = alice.encode(MessageKind::Message, "hi").unwrap();
        assert!(carol.on_datagram(&frame, Instant::now()).is_empty());
        assert_eq!(carol.peer_count(), 1);
    }

    #[test]
    fn own_datagrams_are_suppressed() {
        let mut alice = Room::new("Alice", "default");
        let now = Instant::now();
        for kind in [MessageKind::Message, MessageKind::Heartbeat, MessageKind::Join] {
            let (_, frame) = alice.encode(kind, "Alice").unwrap();
            assert!(alice.on_datagram(&frame, now).is_empty());
        }
        assert_eq!(alice.peer_count(), 1);
    }

    #[test]
    fn join_adds_peer_and_system_line() {
        let mut alice = Room::new("Alice", "default");
        let mut bob = Room::new("Bob", "default");
        let (_, frame) = bob.encode(MessageKind::Join, "Bob").unwrap();
        let got = events(alice.on_datagram(&frame, Instant::now()));
        assert_eq!(
            got,
            vec![
                Event::PeerJoined { name: "Bob".into() },
                Event::PeersChanged {
                    count: 2,
                    peers: vec!["Bob".into()]
                },
                Event::System {
                    sender: "Bob".into(),
                    kind: SystemKind::Joined
                },
            ]
        );
    }

    #[test]
    fn heartbeat_then_silence_times_out_without_system_line() {
        let mut alice = Room::new("Alice", "default");
        let mut bob = Room::new("Bob", "default");
        let t0 = Instant::now();
        let (_, frame) = bob.encode(MessageKind::Heartbeat, "Bob").unwrap();
        alice.on_datagram(&frame, t0);
        assert_eq!(alice.peer_count(), 2);
        let swept = alice.sweep(t0 + PEER_TIMEOUT + Duration::from_secs(5));
        assert!(swept.contains(&Event::PeerLeft { name: "Bob".into() }));
        assert!(!swept.iter().any(|e| matches!(e, Event::System { .. })));
        assert_eq!(alice.peer_count(), 1);
    }

    #[test]
    fn typing_is_forwarded() {
        let mut alice = Room::new("Alice", "default");
        let mut bob = Room::new("Bob", "default");
        let (_, frame) = bob.encode(MessageKind::Typing, "Bob").unwrap();
        assert_eq!(
            events(alice.on_datagram(&frame, Instant::now())),
            vec![Event::Typing { sender: "Bob".into() }]
        );
    }

    #[test]
    fn file_transfer_through_rooms() {
        let mut alice = Room::new("Alice", "default");
        let mut bob = Room::new("Bob", "default");
        let data: Vec<u8> = (0..CHUNK_SIZE * 2 + 5).map(|i| (i % 256) as u8).collect();
        let mut out = OutboundTransfer::new("notes.txt", data.clone()).unwrap();
        let now = Instant::now();

        let mut saved = None;
        let mut timers = 0;
        while let Some(payload) = out.step() {
            let (_, frame) = alice.encode_file(&payload).unwrap();
            for action in bob.on_datagram(&frame, now) {
                match action {
                    Action::SaveFile(f) => saved = Some(f),
                    Action::StartInboundTimer { .. } => timers += 1,
                    Action::Emit(_) => {}
                }
            }
            out.record_sent();
        }
        assert_eq!(timers, 1);
        let file = saved.expect("file should complete");
        assert_eq!(file.bytes, data);
        assert_eq!(file.sender, "Alice");
        assert_eq!(file.mime_type, "text/plain");
        assert_eq!(bob.inbound_len(), 0);
    }

    #[test]
    fn stalled_inbound_transfer_expires() {
        let mut alice = Room::new("Alice", "default");
        let mut bob = Room::new("Bob", "default");
        let out = OutboundTransfer::new("a.bin", vec![1; CHUNK_SIZE * 2]).unwrap();
        let (_, frame) = alice.encode_file(&out.step().unwrap()).unwrap();
        let t0 = Instant::now();
        let actions = bob.on_datagram(&frame, t0);
        let Some(Action::StartInboundTimer {
            transfer_id,
            started_at,
        }) = actions.last().cloned()
        else {
            panic!("expected timer action, got {actions:?}");
        };
        assert_eq!(started_at, t0);
        assert_eq!(bob.inbound_len(), 1);
        assert!(bob.expire_inbound(&transfer_id, started_at));
        assert_eq!(bob.inbound_len(), 0);
    }

    #[test]
    fn secret_change_clears_room_state() {
        let mut alice = Room::new("Alice", "default");
        let mut bob = Room::new("Bob", "default");
        let (_, frame) = bob.encode(MessageKind::Heartbeat, "Bob").unwrap();
        alice.on_datagram(&frame, Instant::now());
        assert_eq!(alice.peer_count(), 2);
        assert!(alice.set_secret("default").is_empty());
        let changed = alice.set_secret("elsewhere");
        assert_eq!(
            changed,
            vec![Event::PeersChanged {
                count: 1,
                peers: vec![]
            }]
        );
        assert!(alice.on_datagram(&frame, Instant::now()).is_empty());
    }

    #[test]
    fn renamed_user_is_the_new_sender() {
        let mut alice = Room::new("Alice", "default");
        let mut bob = Room::new("Bob", "default");
        alice.set_username("Alicia");
        let (_, frame) = alice.encode(MessageKind::Message, "hey").unwrap();
        let got = events(bob.on_datagram(&frame, Instant::now()));
        assert!(matches!(&got[0], Event::NewMessage { sender, .. } if sender == "Alicia"));
    }

    #[test]
    fn installed_key_skips_derivation() {
        let mut alice = Room::new("Alice", "default");
        assert!(!alice.key_ready());
        alice.install_key("other", RoomKey::derive("other"));
        assert!(!alice.key_ready());
        alice.install_key("default", RoomKey::derive("default"));
        assert!(alice.key_ready());
        let (_, frame) = alice.encode(MessageKind::Message, "hi").unwrap();
        assert_eq!(alice.key_derivations(), 0);
        let mut bob = Room::new("Bob", "default");
        assert_eq!(events(bob.on_datagram(&frame, Instant::now())).len(), 1);
    }
}
