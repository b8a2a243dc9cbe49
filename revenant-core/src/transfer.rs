//! File transfer: outbound pacing/retry state machine and inbound transfer table.
//!
//! Outbound is step-driven. The host asks for the next payload with
//! [`OutboundTransfer::step`], broadcasts it, reports the result with
//! `record_sent`/`record_failure`, and sleeps for the returned delay. No
//! timers live here, so pacing and retry are testable without a clock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::chunk::{self, ChunkReceiveResult, TransferState, CHUNK_SIZE, MAX_FILE_SIZE};
use crate::core::Action;
use crate::event::Event;
use crate::protocol::{FileChunk, FileMeta, FilePayload};

/// Gap between consecutive chunks.
pub const CHUNK_DELAY: Duration = Duration::from_millis(30);
/// Gap between metadata and the first chunk.
pub const FIRST_CHUNK_DELAY: Duration = Duration::from_millis(150);
/// Backoff before retrying a chunk whose send failed.
pub const RETRY_DELAY: Duration = Duration::from_millis(200);
/// Consecutive chunk send failures that abort a transfer.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;
/// Inactivity window after which a partial inbound transfer is discarded.
pub const INBOUND_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("file too large ({size} bytes, max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("path has no file name")]
    NoFileName,
    #[error("failed to start file transfer")]
    MetaSendFailed,
    #[error("transfer failed after {failures} consecutive errors at chunk {index}")]
    RetriesExhausted { index: u32, failures: u32 },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Field-wise equality. `Io` never compares equal since `std::io::Error` has no `PartialEq`.
impl PartialEq for TransferError {
    fn eq(&self, other: &Self) -> bool {
        use TransferError::*;
        match (self, other) {
            (TooLarge { size: a, max: m }, TooLarge { size: b, max: n }) => a == b && m == n,
            (NoFileName, NoFileName) | (MetaSendFailed, MetaSendFailed) => true,
            (
                RetriesExhausted { index: a, failures: f },
                RetriesExhausted { index: b, failures: g },
            ) => a == b && f == g,
            _ => false,
        }
    }
}

/// Reject sizes above [`MAX_FILE_SIZE`]. Call before touching the network.
pub fn check_size(size: u64) -> Result<(), TransferError> {
    if size > MAX_FILE_SIZE {
        return Err(TransferError::TooLarge {
            size,
            max: MAX_FILE_SIZE,
        });
    }
    Ok(())
}

/// MIME type from the file extension; `application/octet-stream` when unknown.
pub fn mime_type_for(file_name: &str) -> &'static str {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "txt" => "text/plain",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

/// Reduce a peer-supplied name to a single path component.
pub fn sanitize_file_name(name: &str) -> String {
    let last = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    match cleaned.as_str() {
        "" | "." | ".." => "file".to_owned(),
        _ => cleaned,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Announce,
    Sending,
    Finished,
    Aborted,
}

/// What the host should do after reporting a send result.
#[derive(Debug, PartialEq)]
pub enum Outcome {
    /// Metadata is out; wait `delay`, then send chunk 0.
    Started { delay: Duration },
    /// Chunk accepted by the transport; wait `delay`, then send the next one.
    Progress { sent: u32, total: u32, delay: Duration },
    /// Last chunk (or, for an empty file, the metadata) went out.
    Complete { total: u32 },
    /// Send failed; retry the same index after `delay`.
    Retry {
        index: u32,
        failures: u32,
        delay: Duration,
    },
    /// Terminal failure. Nothing more will be sent.
    Aborted(TransferError),
}

/// Sender-side state for one file.
#[derive(Debug)]
pub struct OutboundTransfer {
    id: String,
    file_name: String,
    mime_type: String,
    data: Vec<u8>,
    chunk_count: u32,
    current_index: u32,
    consecutive_failures: u32,
    phase: Phase,
}

impl OutboundTransfer {
    /// Validates the size and assigns a random transfer id.
    pub fn new(file_name: &str, data: Vec<u8>) -> Result<Self, TransferError> {
        check_size(data.len() as u64)?;
        Ok(Self {
            id: Uuid::new_v4().simple().to_string(),
            mime_type: mime_type_for(file_name).to_owned(),
            file_name: file_name.to_owned(),
            chunk_count: chunk::chunk_count(data.len() as u64, CHUNK_SIZE),
            data,
            current_index: 0,
            consecutive_failures: 0,
            phase: Phase::Announce,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn total_size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    pub fn current_index(&self) -> u32 {
        self.current_index
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.phase, Phase::Finished | Phase::Aborted)
    }

    pub fn meta(&self) -> FileMeta {
        FileMeta {
            transfer_id: self.id.clone(),
            file_name: self.file_name.clone(),
            file_size: self.total_size(),
            total_chunks: self.chunk_count,
            mime_type: self.mime_type.clone(),
        }
    }

    pub fn start_event(&self) -> Event {
        Event::FileSendStart {
            transfer_id: self.id.clone(),
            file_name: self.file_name.clone(),
            file_size: self.total_size(),
            total_chunks: self.chunk_count,
        }
    }

    /// Payload to broadcast next, or `None` once finished or aborted.
    pub fn step(&self) -> Option<FilePayload> {
        match self.phase {
            Phase::Announce => Some(FilePayload::FileMeta(self.meta())),
            Phase::Sending => {
                let data = chunk::chunk_at(&self.data, self.current_index, CHUNK_SIZE)?;
                Some(FilePayload::FileChunk(FileChunk {
                    transfer_id: self.id.clone(),
                    index: self.current_index,
                    data: data.to_vec(),
                }))
            }
            Phase::Finished | Phase::Aborted => None,
        }
    }

    /// The payload from the last `step` was handed to the transport.
    pub fn record_sent(&mut self) -> Outcome {
        match self.phase {
            Phase::Announce => {
                if self.chunk_count == 0 {
                    self.phase = Phase::Finished;
                    return Outcome::Complete { total: 0 };
                }
                self.phase = Phase::Sending;
                Outcome::Started {
                    delay: FIRST_CHUNK_DELAY,
                }
            }
            Phase::Sending => {
                self.consecutive_failures = 0;
                self.current_index += 1;
                if self.current_index >= self.chunk_count {
                    self.phase = Phase::Finished;
                    return Outcome::Complete {
                        total: self.chunk_count,
                    };
                }
                Outcome::Progress {
                    sent: self.current_index,
                    total: self.chunk_count,
                    delay: CHUNK_DELAY,
                }
            }
            Phase::Finished => Outcome::Complete {
                total: self.chunk_count,
            },
            Phase::Aborted => Outcome::Aborted(TransferError::MetaSendFailed),
        }
    }

    /// The payload from the last `step` could not be sent.
    pub fn record_failure(&mut self) -> Outcome {
        match self.phase {
            Phase::Announce | Phase::Aborted => {
                self.phase = Phase::Aborted;
                Outcome::Aborted(TransferError::MetaSendFailed)
            }
            Phase::Sending | Phase::Finished => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    self.phase = Phase::Aborted;
                    return Outcome::Aborted(TransferError::RetriesExhausted {
                        index: self.current_index,
                        failures: self.consecutive_failures,
                    });
                }
                Outcome::Retry {
                    index: self.current_index,
                    failures: self.consecutive_failures,
                    delay: RETRY_DELAY,
                }
            }
        }
    }
}

/// A fully reassembled inbound file, ready to be written by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFile {
    pub transfer_id: String,
    /// Already sanitized to a single path component.
    pub file_name: String,
    pub mime_type: String,
    pub file_size: u64,
    pub sender: String,
    pub bytes: Vec<u8>,
}

impl CompletedFile {
    /// Collision-avoiding local name: `<unix-millis>_<file name>`.
    pub fn saved_name(&self, now_millis: i64) -> String {
        format!("{}_{}", now_millis, self.file_name)
    }

    pub fn complete_event(&self, path: PathBuf) -> Event {
        Event::FileReceiveComplete {
            transfer_id: self.transfer_id.clone(),
            file_name: self.file_name.clone(),
            path,
            file_size: self.file_size,
            sender: self.sender.clone(),
            mime_type: self.mime_type.clone(),
        }
    }
}

/// In-progress inbound transfers keyed by transfer id.
#[derive(Debug, Default)]
pub struct InboundTransfers {
    active: HashMap<String, TransferState>,
    /// Ids finished within the last [`INBOUND_TIMEOUT`], so repeated datagrams cannot restart them.
    finished: HashMap<String, Instant>,
}

impl InboundTransfers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate state for an announced file.
    pub fn on_meta(&mut self, meta: FileMeta, sender: &str, now: Instant) -> Vec<Action> {
        if meta.file_size > MAX_FILE_SIZE || meta.total_chunks > chunk::max_chunks() {
            tracing::debug!(
                transfer = %meta.transfer_id,
                size = meta.file_size,
                chunks = meta.total_chunks,
                "ignoring oversized file announcement"
            );
            return Vec::new();
        }
        self.finished
            .retain(|_, at| now.saturating_duration_since(*at) < INBOUND_TIMEOUT);
        if self.active.contains_key(&meta.transfer_id) || self.finished.contains_key(&meta.transfer_id)
        {
            tracing::trace!(transfer = %meta.transfer_id, "duplicate file-meta");
            return Vec::new();
        }
        let meta = FileMeta {
            file_name: sanitize_file_name(&meta.file_name),
            ..meta
        };
        let state = TransferState::new(meta, sender, now);
        let mut actions = vec![Action::Emit(Event::FileReceiveStart {
            transfer_id: state.transfer_id.clone(),
            file_name: state.file_name.clone(),
            file_size: state.file_size,
            sender: state.sender.clone(),
            mime_type: state.mime_type.clone(),
        })];
        if state.is_complete() {
            // zero chunks: nothing further will arrive
            actions.extend(self.finish(state, now).map(Action::SaveFile));
            return actions;
        }
        tracing::debug!(
            transfer = %state.transfer_id,
            chunks = state.total_chunks(),
            from = %state.sender,
            "inbound transfer started"
        );
        actions.push(Action::StartInboundTimer {
            transfer_id: state.transfer_id.clone(),
            started_at: now,
        });
        self.active.insert(state.transfer_id.clone(), state);
        actions
    }

    /// Store a chunk. Unknown transfers, duplicates, bad indexes and oversized payloads are ignored.
    pub fn on_chunk(&mut self, chunk: FileChunk, now: Instant) -> Vec<Action> {
        let Some(state) = self.active.get_mut(&chunk.transfer_id) else {
            tracing::trace!(transfer = %chunk.transfer_id, "chunk for unknown transfer");
            return Vec::new();
        };
        if chunk.data.len() > CHUNK_SIZE {
            tracing::debug!(
                transfer = %chunk.transfer_id,
                index = chunk.index,
                len = chunk.data.len(),
                "ignoring oversized chunk"
            );
            return Vec::new();
        }
        match state.mark_received(chunk.index, chunk.data) {
            ChunkReceiveResult::Duplicate | ChunkReceiveResult::OutOfRange => Vec::new(),
            ChunkReceiveResult::InProgress { received, total } => {
                vec![Action::Emit(Event::FileReceiveProgress {
                    transfer_id: chunk.transfer_id,
                    received,
                    total,
                })]
            }
            ChunkReceiveResult::Complete { total } => {
                let Some(state) = self.active.remove(&chunk.transfer_id) else {
                    return Vec::new();
                };
                let Some(file) = self.finish(state, now) else {
                    return Vec::new();
                };
                vec![
                    Action::Emit(Event::FileReceiveProgress {
                        transfer_id: chunk.transfer_id,
                        received: total,
                        total,
                    }),
                    Action::SaveFile(file),
                ]
            }
        }
    }

    /// Reassemble a filled transfer. A length that disagrees with the announcement drops it.
    fn finish(&mut self, state: TransferState, now: Instant) -> Option<CompletedFile> {
        self.finished.insert(state.transfer_id.clone(), now);
        let bytes = state.reassemble_into_bytes();
        if bytes.len() as u64 != state.file_size {
            tracing::debug!(
                transfer = %state.transfer_id,
                announced = state.file_size,
                received = bytes.len(),
                "discarding transfer with mismatched length"
            );
            return None;
        }
        Some(CompletedFile {
            transfer_id: state.transfer_id,
            file_name: state.file_name,
            mime_type: state.mime_type,
            file_size: state.file_size,
            sender: state.sender,
            bytes,
        })
    }

    /// Drop a stalled transfer if it is still the one started at `started_at`.
    /// Returns whether anything was discarded.
    pub fn expire(&mut self, transfer_id: &str, started_at: Instant) -> bool {
        let stale = self
            .active
            .get(transfer_id)
            .is_some_and(|s| s.started_at == started_at);
        if stale {
            self.active.remove(transfer_id);
            tracing::debug!(transfer = transfer_id, "inbound transfer timed out");
        }
        stale
    }

    pub fn contains(&self, transfer_id: &str) -> bool {
        self.active.contains_key(transfer_id)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn clear(&mut self) {
        self.active.clear();
        self.finished.clear();
    }
}
