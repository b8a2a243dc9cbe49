//! File transfer engine runtime: paced outbound pumps, inbound timeouts, saving files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use revenant_core::transfer::{check_size, INBOUND_TIMEOUT};
use revenant_core::{
    now_millis, Action, CompletedFile, Event, OutboundTransfer, Outcome, Room, TransferError,
};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};

use crate::transport::Broadcaster;

type InboundTimers = Arc<Mutex<HashMap<String, (std::time::Instant, JoinHandle<()>)>>>;

pub struct FileTransferEngine {
    room: Arc<Mutex<Room>>,
    broadcaster: Arc<dyn Broadcaster>,
    events: mpsc::UnboundedSender<Event>,
    download_dir: RwLock<PathBuf>,
    outbound: Mutex<JoinSet<()>>,
    timers: InboundTimers,
}

impl FileTransferEngine {
    pub fn new(
        room: Arc<Mutex<Room>>,
        broadcaster: Arc<dyn Broadcaster>,
        events: mpsc::UnboundedSender<Event>,
        download_dir: PathBuf,
    ) -> Self {
        Self {
            room,
            broadcaster,
            events,
            download_dir: RwLock::new(download_dir),
            outbound: Mutex::new(JoinSet::new()),
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn set_download_dir(&self, dir: PathBuf) {
        *self.download_dir.write().await = dir;
    }

    pub async fn download_dir(&self) -> PathBuf {
        self.download_dir.read().await.clone()
    }

    /// Validate and read `path`, emit `FileSendStart`, and spawn its pacing loop.
    /// Size is checked against file metadata before the file is read or anything is sent.
    pub async fn send_file(&self, path: &Path) -> Result<String, TransferError> {
        let metadata = tokio::fs::metadata(path).await?;
        check_size(metadata.len())?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or(TransferError::NoFileName)?;
        let data = tokio::fs::read(path).await?;
        let transfer = OutboundTransfer::new(&file_name, data)?;
        let id = transfer.id().to_owned();
        tracing::info!(
            transfer = %id,
            file = %file_name,
            size = transfer.total_size(),
            chunks = transfer.chunk_count(),
            "sending file"
        );
        let _ = self.events.send(transfer.start_event());

        let mut outbound = self.outbound.lock().await;
        while outbound.try_join_next().is_some() {}
        outbound.spawn(pump(
            transfer,
            self.room.clone(),
            self.broadcaster.clone(),
            self.events.clone(),
        ));
        Ok(id)
    }

    /// Carry out one action produced by [`Room::on_datagram`].
    pub async fn apply(&self, action: Action) {
        match action {
            Action::Emit(event) => {
                let _ = self.events.send(event);
            }
            Action::StartInboundTimer {
                transfer_id,
                started_at,
            } => self.schedule_timeout(transfer_id, started_at).await,
            Action::SaveFile(file) => self.save(file).await,
        }
    }

    async fn schedule_timeout(&self, transfer_id: String, started_at: std::time::Instant) {
        let task = tokio::spawn(expire_after_timeout(
            self.room.clone(),
            self.timers.clone(),
            transfer_id.clone(),
            started_at,
        ));
        if let Some((_, old)) = self
            .timers
            .lock()
            .await
            .insert(transfer_id, (started_at, task))
        {
            old.abort();
        }
    }

    async fn cancel_timeout(&self, transfer_id: &str) {
        if let Some((_, task)) = self.timers.lock().await.remove(transfer_id) {
            task.abort();
        }
    }

    async fn save(&self, file: CompletedFile) {
        self.cancel_timeout(&file.transfer_id).await;
        let dir = self.download_dir().await;
        let path = dir.join(file.saved_name(now_millis()));
        let written = async {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(&path, &file.bytes).await
        }
        .await;
        match written {
            Ok(()) => {
                tracing::info!(
                    transfer = %file.transfer_id,
                    from = %file.sender,
                    path = %path.display(),
                    "file received"
                );
                let _ = self.events.send(file.complete_event(path));
            }
            Err(e) => {
                tracing::error!(transfer = %file.transfer_id, error = %e, "failed to save file");
                let _ = self.events.send(Event::TransferError {
                    transfer_id: Some(file.transfer_id),
                    message: format!("could not save {}: {e}", file.file_name),
                });
            }
        }
    }

    /// Outbound pumps and inbound timers that are still live.
    #[cfg(test)]
    pub async fn pending(&self) -> (usize, usize) {
        let outbound = self.outbound.lock().await.len();
        let timers = self.timers.lock().await.len();
        (outbound, timers)
    }

    /// Abort every outbound pump and inbound timer; drop partial inbound state.
    pub async fn stop(&self) {
        self.outbound.lock().await.shutdown().await;
        let timers: Vec<_> = self.timers.lock().await.drain().collect();
        for (_, (_, task)) in timers {
            task.abort();
            let _ = task.await;
        }
        self.room.lock().await.clear_inbound();
        tracing::debug!("file transfer engine stopped");
    }
}

async fn expire_after_timeout(
    room: Arc<Mutex<Room>>,
    timers: InboundTimers,
    transfer_id: String,
    started_at: std::time::Instant,
) {
    tokio::time::sleep(INBOUND_TIMEOUT).await;
    let mut timers = timers.lock().await;
    room.lock().await.expire_inbound(&transfer_id, started_at);
    if timers
        .get(&transfer_id)
        .is_some_and(|(armed_at, _)| *armed_at == started_at)
    {
        timers.remove(&transfer_id);
    }
}

/// Drive one outbound transfer to completion or abort. Sends are strictly sequential.
async fn pump(
    mut transfer: OutboundTransfer,
    room: Arc<Mutex<Room>>,
    broadcaster: Arc<dyn Broadcaster>,
    events: mpsc::UnboundedSender<Event>,
) {
    let id = transfer.id().to_owned();
    while let Some(payload) = transfer.step() {
        let encoded = room.lock().await.encode_file(&payload);
        let sent = match encoded {
            Ok((_, frame)) => broadcaster.broadcast(&frame).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        let outcome = match sent {
            Ok(()) => transfer.record_sent(),
            Err(error) => {
                tracing::warn!(transfer = %id, index = transfer.current_index(), %error, "file send failed");
                transfer.record_failure()
            }
        };
        match outcome {
            Outcome::Started { delay } => tokio::time::sleep(delay).await,
            Outcome::Progress { sent, total, delay } => {
                let _ = events.send(Event::FileSendProgress {
                    transfer_id: id.clone(),
                    sent,
                    total,
                });
                tokio::time::sleep(delay).await;
            }
            Outcome::Retry {
                index,
                failures,
                delay,
            } => {
                tracing::debug!(transfer = %id, index, failures, "retrying chunk");
                tokio::time::sleep(delay).await;
            }
            Outcome::Complete { total } => {
                if total > 0 {
                    let _ = events.send(Event::FileSendProgress {
                        transfer_id: id.clone(),
                        sent: total,
                        total,
                    });
                }
                tracing::info!(transfer = %id, chunks = total, "file sent");
                let _ = events.send(Event::FileSendComplete {
                    transfer_id: id,
                    file_name: transfer.file_name().to_owned(),
                });
                return;
            }
            Outcome::Aborted(error) => {
                tracing::error!(transfer = %id, %error, "file transfer aborted");
                let _ = events.send(Event::TransferError {
                    transfer_id: Some(id),
                    message: error.to_string(),
                });
                return;
            }
        }
    }
}
