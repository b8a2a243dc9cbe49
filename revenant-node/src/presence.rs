//! Presence engine runtime: join on start, heartbeat and sweep timers, leave on stop.

use std::sync::Arc;

use revenant_core::presence::{HEARTBEAT_INTERVAL, SWEEP_INTERVAL};
use revenant_core::{Event, MessageKind, Room};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::transport::Broadcaster;

pub struct PresenceEngine {
    room: Arc<Mutex<Room>>,
    broadcaster: Arc<dyn Broadcaster>,
    events: mpsc::UnboundedSender<Event>,
    tasks: Vec<JoinHandle<()>>,
}

impl PresenceEngine {
    /// Broadcast `join`, then start the heartbeat and sweep timers.
    pub async fn start(
        room: Arc<Mutex<Room>>,
        broadcaster: Arc<dyn Broadcaster>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        announce(&room, broadcaster.as_ref(), MessageKind::Join).await;
        let heartbeat = tokio::spawn(heartbeat_loop(room.clone(), broadcaster.clone()));
        let sweep = tokio::spawn(sweep_loop(room.clone(), events.clone()));
        Self {
            room,
            broadcaster,
            events,
            tasks: vec![heartbeat, sweep],
        }
    }

    /// Cancel both timers, then broadcast `leave` and forget all peers.
    /// Must run before the transport is stopped.
    pub async fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        announce(&self.room, self.broadcaster.as_ref(), MessageKind::Leave).await;
        for event in self.room.lock().await.clear_peers() {
            let _ = self.events.send(event);
        }
        tracing::debug!("presence stopped");
    }
}

impl Drop for PresenceEngine {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Send a presence message whose content is the local name. Failures are logged only.
async fn announce(room: &Mutex<Room>, broadcaster: &dyn Broadcaster, kind: MessageKind) {
    let encoded = {
        let mut room = room.lock().await;
        let name = room.username().to_owned();
        room.encode(kind, &name)
    };
    let result = match encoded {
        Ok((_, frame)) => broadcaster.broadcast(&frame).await.map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    if let Err(error) = result {
        tracing::warn!(?kind, %error, "presence broadcast failed");
    }
}

async fn heartbeat_loop(room: Arc<Mutex<Room>>, broadcaster: Arc<dyn Broadcaster>) {
    let mut ticks = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticks.tick().await;
        announce(&room, broadcaster.as_ref(), MessageKind::Heartbeat).await;
    }
}

async fn sweep_loop(room: Arc<Mutex<Room>>, events: mpsc::UnboundedSender<Event>) {
    let mut ticks = interval_at(Instant::now() + SWEEP_INTERVAL, SWEEP_INTERVAL);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticks.tick().await;
        let evicted = room.lock().await.sweep(Instant::now().into_std());
        for event in evicted {
            let _ = events.send(event);
        }
    }
}
