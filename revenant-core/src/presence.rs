//! Presence state machine: which peers are alive.
//!
//! Per peer: Unknown -> Active -> Removed (on leave or liveness timeout).
//! The host drives time: it passes `now` with every message and calls
//! [`Presence::sweep`] every [`SWEEP_INTERVAL`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::event::Event;
use crate::protocol::MessageKind;

/// How often the local node broadcasts a heartbeat.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// How often the host should call `sweep`.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
/// A peer silent for longer than this is evicted.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(30);

/// Tracked peers keyed by display name.
#[derive(Debug)]
pub struct Presence {
    peers: HashMap<String, Instant>,
    timeout: Duration,
}

impl Presence {
    pub fn new() -> Self {
        Self::with_timeout(PEER_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            timeout,
        }
    }

    /// Apply a join/heartbeat/leave from `sender`. Other kinds are ignored.
    pub fn on_message(&mut self, kind: MessageKind, sender: &str, now: Instant) -> Vec<Event> {
        match kind {
            MessageKind::Join | MessageKind::Heartbeat => {
                if let Some(last_seen) = self.peers.get_mut(sender) {
                    *last_seen = now;
                    return Vec::new();
                }
                self.peers.insert(sender.to_owned(), now);
                tracing::debug!(peer = sender, "peer joined");
                vec![
                    Event::PeerJoined {
                        name: sender.to_owned(),
                    },
                    self.changed(),
                ]
            }
            MessageKind::Leave => {
                if self.peers.remove(sender).is_none() {
                    return Vec::new();
                }
                tracing::debug!(peer = sender, "peer left");
                vec![
                    Event::PeerLeft {
                        name: sender.to_owned(),
                    },
                    self.changed(),
                ]
            }
            _ => Vec::new(),
        }
    }

    /// Evict peers not seen for longer than the timeout. One `PeersChanged` per sweep at most.
    pub fn sweep(&mut self, now: Instant) -> Vec<Event> {
        let mut expired: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, &seen)| now.saturating_duration_since(seen) > self.timeout)
            .map(|(name, _)| name.clone())
            .collect();
        if expired.is_empty() {
            return Vec::new();
        }
        expired.sort();
        let mut events = Vec::with_capacity(expired.len() + 1);
        for name in expired {
            self.peers.remove(&name);
            tracing::debug!(peer = %name, "peer timed out");
            events.push(Event::PeerLeft { name });
        }
        events.push(self.changed());
        events
    }

    /// Forget every peer (local stop). Emits `PeersChanged` if anything was tracked.
    pub fn clear(&mut self) -> Vec<Event> {
        if self.peers.is_empty() {
            return Vec::new();
        }
        self.peers.clear();
        vec![self.changed()]
    }

    /// Sorted names of tracked peers (local identity excluded).
    pub fn peer_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Room size as shown to the user: tracked peers plus the local identity.
    pub fn peer_count(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn last_seen(&self, name: &str) -> Option<Instant> {
        self.peers.get(name).copied()
    }

    fn changed(&self) -> Event {
        Event::PeersChanged {
            count: self.peer_count(),
            peers: self.peer_names(),
        }
    }
}

impl Default for Presence {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined_count(events: &[Event]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, Event::PeerJoined { .. }))
            .count()
    }

    #[test]
    fn heartbeat_from_new_sender_adds_peer() {
        let mut p = Presence::new();
        let t0 = Instant::now();
        assert_eq!(p.peer_count(), 1);
        let events = p.on_message(MessageKind::Heartbeat, "Bob", t0);
        assert_eq!(p.peer_count(), 2);
        assert_eq!(joined_count(&events), 1);
        assert_eq!(
            events.last(),
            Some(&Event::PeersChanged {
                count: 2,
                peers: vec!["Bob".into()]
            })
        );
    }

    #[test]
    fn repeat_heartbeat_only_refreshes() {
        let mut p = Presence::new();
        let t0 = Instant::now();
        p.on_message(MessageKind::Heartbeat, "Bob", t0);
        let t1 = t0 + Duration::from_secs(10);
        let events = p.on_message(MessageKind::Heartbeat, "Bob", t1);
        assert!(events.is_empty());
        assert_eq!(p.peer_count(), 2);
        assert_eq!(p.last_seen("Bob"), Some(t1));
    }

    #[test]
    fn join_from_tracked_peer_is_not_a_second_join() {
        let mut p = Presence::new();
        let t0 = Instant::now();
        p.on_message(MessageKind::Heartbeat, "Bob", t0);
        let events = p.on_message(MessageKind::Join, "Bob", t0);
        assert_eq!(joined_count(&events), 0);
    }

    #[test]
    fn leave_removes_immediately() {
        let mut p = Presence::new();
        let t0 = Instant::now();
        p.on_message(MessageKind::Join, "Bob", t0);
        p.on_message(MessageKind::Join, "Carol", t0);
        let events = p.on_message(MessageKind::Leave, "Bob", t0);
        assert_eq!(
            events,
            vec![
                Event::PeerLeft { name: "Bob".into() },
                Event::PeersChanged {
                    count: 2,
                    peers: vec!["Carol".into()]
                }
            ]
        );
    }

    #[test]
    fn leave_from_unknown_is_ignored() {
        let mut p = Presence::new();
        assert!(p
            .on_message(MessageKind::Leave, "Ghost", Instant::now())
            .is_empty());
    }

    #[test]
    fn non_presence_kinds_ignored() {
        let mut p = Presence::new();
        let t0 = Instant::now();
        assert!(p.on_message(MessageKind::Message, "Bob", t0).is_empty());
        assert!(p.on_message(MessageKind::FileChunk, "Bob", t0).is_empty());
        assert_eq!(p.peer_count(), 1);
    }

    #[test]
    fn sweep_evicts_after_timeout() {
        let mut p = Presence::new();
        let t0 = Instant::now();
        p.on_message(MessageKind::Heartbeat, "Bob", t0);
        p.on_message(MessageKind::Heartbeat, "Carol", t0 + Duration::from_secs(20));

        assert!(p.sweep(t0 + PEER_TIMEOUT).is_empty());
        assert_eq!(p.peer_count(), 3);

        let events = p.sweep(t0 + PEER_TIMEOUT + Duration::from_secs(1));
        assert_eq!(p.peer_count(), 2);
        assert_eq!(
            events,
            vec![
                Event::PeerLeft { name: "Bob".into() },
                Event::PeersChanged {
                    count: 2,
                    peers: vec!["Carol".into()]
                }
            ]
        );
    }

    #[test]
    fn sweep_batches_one_change_event() {
        let mut p = Presence::new();
        let t0 = Instant::now();
        for name in ["A", "B", "C"] {
            p.on_message(MessageKind::Heartbeat, name, t0);
        }
        let events = p.sweep(t0 + Duration::from_secs(31));
        let changes = events
            .iter()
            .filter(|e| matches!(e, Event::PeersChanged { .. }))
            .count();
        let lefts = events
            .iter()
            .filter(|e| matches!(e, Event::PeerLeft { .. }))
            .count();
        assert_eq!(changes, 1);
        assert_eq!(lefts, 3);
        assert_eq!(p.peer_count(), 1);
    }

    #[test]
    fn clear_reports_change_once() {
        let mut p = Presence::new();
        p.on_message(MessageKind::Join, "Bob", Instant::now());
        assert_eq!(p.clear().len(), 1);
        assert!(p.clear().is_empty());
        assert_eq!(p.peer_count(), 1);
    }
}
