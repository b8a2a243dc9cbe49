//! Session coordinator: owns the room and the network engines, dispatches inbound datagrams.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use revenant_core::{now_millis, Event, MessageKind, Room, RoomKey, TransferError};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::presence::PresenceEngine;
use crate::transfer::FileTransferEngine;
use crate::transport::{Broadcaster, Datagram, Transport, TransportError};

/// The subset of configuration a running session cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub username: String,
    pub room_secret: String,
    pub port: u16,
    pub download_dir: PathBuf,
}

impl From<&Config> for Settings {
    fn from(c: &Config) -> Self {
        Self {
            username: c.username.clone(),
            room_secret: c.room_secret.clone(),
            port: c.port,
            download_dir: c.download_dir.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("encode failed: {0}")]
    Encode(#[from] revenant_core::CodecError),
}

/// Everything torn down and rebuilt on a port or secret change.
struct Network {
    transport: Option<Arc<Transport>>,
    broadcaster: Arc<dyn Broadcaster>,
    presence: PresenceEngine,
    transfers: Arc<FileTransferEngine>,
    dispatcher: JoinHandle<()>,
}

impl Network {
    async fn start(
        settings: &Settings,
        room: Arc<Mutex<Room>>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Result<Self, TransportError> {
        let (transport, datagrams) = Transport::start(settings.port)?;
        Ok(Self::with_broadcaster(
            Some(transport.clone()),
            transport,
            datagrams,
            settings,
            room,
            events,
        )
        .await)
    }

    async fn with_broadcaster(
        transport: Option<Arc<Transport>>,
        broadcaster: Arc<dyn Broadcaster>,
        datagrams: mpsc::UnboundedReceiver<Datagram>,
        settings: &Settings,
        room: Arc<Mutex<Room>>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        let transfers = Arc::new(FileTransferEngine::new(
            room.clone(),
            broadcaster.clone(),
            events.clone(),
            settings.download_dir.clone(),
        ));
        let dispatcher = tokio::spawn(dispatch(datagrams, room.clone(), transfers.clone()));
        let presence = PresenceEngine::start(room, broadcaster.clone(), events).await;
        Self {
            transport,
            broadcaster,
            presence,
            transfers,
            dispatcher,
        }
    }

    /// Leave is broadcast before the socket is released.
    async fn stop(mut self) {
        self.dispatcher.abort();
        let _ = (&mut self.dispatcher).await;
        self.transfers.stop().await;
        self.presence.stop().await;
        if let Some(transport) = &self.transport {
            transport.stop().await;
        }
    }
}

/// Decode every inbound datagram through the room and carry out the resulting actions.
async fn dispatch(
    mut datagrams: mpsc::UnboundedReceiver<Datagram>,
    room: Arc<Mutex<Room>>,
    transfers: Arc<FileTransferEngine>,
) {
    while let Some(datagram) = datagrams.recv().await {
        tracing::trace!(from = %datagram.from, len = datagram.bytes.len(), "datagram");
        let now = tokio::time::Instant::now().into_std();
        let actions = room.lock().await.on_datagram(&datagram.bytes, now);
        for action in actions {
            transfers.apply(action).await;
        }
    }
}

/// Derive the room key on the blocking pool so PBKDF2 never runs under the room lock.
async fn warm_room_key(room: &Mutex<Room>, secret: &str) {
    if room.lock().await.key_ready() {
        return;
    }
    let owned = secret.to_owned();
    match tokio::task::spawn_blocking(move || RoomKey::derive(&owned)).await {
        Ok(key) => room.lock().await.install_key(secret, key),
        Err(e) => tracing::warn!(error = %e, "room key derivation task failed"),
    }
}

pub struct Session {
    settings: Settings,
    room: Arc<Mutex<Room>>,
    events: mpsc::UnboundedSender<Event>,
    network: Option<Network>,
}

impl Session {
    /// Idle session; call [`Session::start`] to go online.
    pub fn new(settings: Settings, events: mpsc::UnboundedSender<Event>) -> Self {
        let room = Room::new(&settings.username, &settings.room_secret);
        Self {
            settings,
            room: Arc::new(Mutex::new(room)),
            events,
            network: None,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Bind the transport and start presence. A bind failure leaves the session offline.
    pub async fn start(&mut self) -> Result<(), TransportError> {
        if self.network.is_some() {
            return Ok(());
        }
        warm_room_key(&self.room, &self.settings.room_secret).await;
        let network = Network::start(&self.settings, self.room.clone(), self.events.clone()).await?;
        tracing::info!(
            user = %self.settings.username,
            local_addr = ?network.transport.as_ref().map(|t| t.local_addr()),
            "session online"
        );
        self.network = Some(network);
        Ok(())
    }

    #[cfg(test)]
    async fn start_with(
        &mut self,
        broadcaster: Arc<dyn Broadcaster>,
        datagrams: mpsc::UnboundedReceiver<Datagram>,
    ) {
        warm_room_key(&self.room, &self.settings.room_secret).await;
        let network = Network::with_broadcaster(
            None,
            broadcaster,
            datagrams,
            &self.settings,
            self.room.clone(),
            self.events.clone(),
        )
        .await;
        self.network = Some(network);
    }

    pub async fn stop(&mut self) {
        if let Some(network) = self.network.take() {
            network.stop().await;
            tracing::info!("session offline");
        }
    }

    /// Apply new settings. Port or secret changes rebuild the network side;
    /// name and download directory are updated in place.
    pub async fn reload(&mut self, settings: Settings) -> Result<(), TransportError> {
        let rebuild = settings.port != self.settings.port
            || settings.room_secret != self.settings.room_secret
            || self.network.is_none();
        if rebuild {
            self.stop().await;
        }
        {
            let mut room = self.room.lock().await;
            room.set_username(&settings.username);
            for event in room.set_secret(&settings.room_secret) {
                let _ = self.events.send(event);
            }
        }
        if let Some(network) = &self.network {
            network
                .transfers
                .set_download_dir(settings.download_dir.clone())
                .await;
        }
        self.settings = settings;
        if rebuild {
            self.start().await?;
        }
        tracing::info!(rebuilt = rebuild, "configuration reloaded");
        Ok(())
    }

    /// Broadcast a chat line and echo it locally.
    pub async fn send_text(&self, text: &str) -> Result<(), SessionError> {
        let network = self.network.as_ref().ok_or(TransportError::Stopped)?;
        let (id, frame, sender) = {
            let mut room = self.room.lock().await;
            let (id, frame) = room.encode(MessageKind::Message, text)?;
            (id, frame, room.username().to_owned())
        };
        network.broadcaster.broadcast(&frame).await?;
        let _ = self.events.send(Event::NewMessage {
            id,
            sender,
            content: text.to_owned(),
            timestamp: now_millis(),
            own: true,
        });
        Ok(())
    }

    pub async fn send_typing(&self) -> Result<(), SessionError> {
        let network = self.network.as_ref().ok_or(TransportError::Stopped)?;
        let frame = {
            let mut room = self.room.lock().await;
            let name = room.username().to_owned();
            room.encode(MessageKind::Typing, &name)?.1
        };
        network.broadcaster.broadcast(&frame).await?;
        Ok(())
    }

    /// Start sending a file. Rejections are also reported as a `TransferError` event.
    pub async fn send_file(&self, path: &Path) -> Result<String, SessionError> {
        let network = self.network.as_ref().ok_or(TransportError::Stopped)?;
        match network.transfers.send_file(path).await {
            Ok(id) => Ok(id),
            Err(e) => {
                let _ = self.events.send(Event::TransferError {
                    transfer_id: None,
                    message: format!("{}: {e}", path.display()),
                });
                Err(e.into())
            }
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.room.lock().await.peer_count()
    }

    pub async fn peer_names(&self) -> Vec<String> {
        self.room.lock().await.peer_names()
    }
}
