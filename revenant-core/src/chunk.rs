//! Chunk manager: split a file into fixed-size chunks, collect inbound chunks, reassemble.

use std::time::Instant;

use crate::protocol::FileMeta;

/// Raw chunk size. 8 KiB grows to roughly 15 KiB on the wire (base64 twice,
/// JSON and envelope), well under the UDP datagram ceiling.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Largest file the protocol carries. The channel has no flow control.
pub const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Number of chunks for `len` bytes: `ceil(len / chunk_size)`. Zero for an empty file.
pub fn chunk_count(len: u64, chunk_size: usize) -> u32 {
    let size = if chunk_size == 0 {
        CHUNK_SIZE
    } else {
        chunk_size
    };
    u32::try_from(len.div_ceil(size as u64)).unwrap_or(u32::MAX)
}

/// Upper bound on `total_chunks` any honest sender announces.
pub fn max_chunks() -> u32 {
    chunk_count(MAX_FILE_SIZE, CHUNK_SIZE)
}

/// Bytes of chunk `index`, or `None` past the end.
pub fn chunk_at(data: &[u8], index: u32, chunk_size: usize) -> Option<&[u8]> {
    let start = (index as usize).checked_mul(chunk_size)?;
    if start >= data.len() {
        return None;
    }
    let end = start.saturating_add(chunk_size).min(data.len());
    Some(&data[start..end])
}

/// Result of storing one inbound chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkReceiveResult {
    /// Newly stored; more chunks outstanding.
    InProgress { received: u32, total: u32 },
    /// Newly stored and every slot is now filled.
    Complete { total: u32 },
    /// Slot already filled; nothing changed.
    Duplicate,
    /// Index outside `0..total_chunks`.
    OutOfRange,
}

/// Receiver-side state for one announced file.
#[derive(Debug)]
pub struct TransferState {
    pub transfer_id: String,
    pub file_name: String,
    pub mime_type: String,
    pub file_size: u64,
    pub sender: String,
    pub started_at: Instant,
    /// One slot per chunk index; filled at most once.
    slots: Vec<Option<Vec<u8>>>,
    received_count: u32,
}

impl TransferState {
    pub fn new(meta: FileMeta, sender: &str, started_at: Instant) -> Self {
        Self {
            transfer_id: meta.transfer_id,
            file_name: meta.file_name,
            mime_type: meta.mime_type,
            file_size: meta.file_size,
            sender: sender.to_owned(),
            started_at,
            slots: vec![None; meta.total_chunks as usize],
            received_count: 0,
        }
    }

    /// Store chunk `index`. Idempotent: a filled slot is never overwritten or recounted.
    pub fn mark_received(&mut self, index: u32, payload: Vec<u8>) -> ChunkReceiveResult {
        let total = self.total_chunks();
        let Some(slot) = self.slots.get_mut(index as usize) else {
            return ChunkReceiveResult::OutOfRange;
        };
        if slot.is_some() {
            return ChunkReceiveResult::Duplicate;
        }
        *slot = Some(payload);
        self.received_count += 1;
        if self.is_complete() {
            ChunkReceiveResult::Complete { total }
        } else {
            ChunkReceiveResult::InProgress {
                received: self.received_count,
                total,
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.received_count == self.total_chunks()
    }

    pub fn received_count(&self) -> u32 {
        self.received_count
    }

    pub fn total_chunks(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Concatenate slots in index order (never arrival order). Call only when `is_complete()`.
    pub fn reassemble_into_bytes(&self) -> Vec<u8> {
        let len = self.slots.iter().flatten().map(Vec::len).sum();
        let mut out = Vec::with_capacity(len);
        for payload in self.slots.iter().flatten() {
            out.extend_from_slice(payload);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(total_chunks: u32, file_size: u64) -> FileMeta {
        FileMeta {
            transfer_id: "t1".into(),
            file_name: "a.bin".into(),
            file_size,
            total_chunks,
            mime_type: "application/octet-stream".into(),
        }
    }

    #[test]
    fn count_is_ceiling() {
        assert_eq!(chunk_count(0, 30), 0);
        assert_eq!(chunk_count(1, 30), 1);
        assert_eq!(chunk_count(90, 30), 3);
        assert_eq!(chunk_count(100, 30), 4);
        assert_eq!(chunk_count(CHUNK_SIZE as u64 * 2 + 1, CHUNK_SIZE), 3);
    }

    #[test]
    fn zero_chunk_size_uses_default() {
        assert_eq!(chunk_count(CHUNK_SIZE as u64 * 2, 0), 2);
    }

    #[test]
    fn max_chunks_covers_max_file() {
        assert_eq!(max_chunks(), 1280);
    }

    #[test]
    fn chunk_at_slices() {
        let data: Vec<u8> = (0..100u8).collect();
        assert_eq!(chunk_at(&data, 0, 30).unwrap(), &data[0..30]);
        assert_eq!(chunk_at(&data, 3, 30).unwrap(), &data[90..100]);
        assert!(chunk_at(&data, 4, 30).is_none());
        assert!(chunk_at(&[], 0, 30).is_none());
    }

    #[test]
    fn reverse_arrival_reassembles_in_index_order() {
        let data: Vec<u8> = (0..100u32).map(|i| i as u8).collect();
        let total = chunk_count(100, 30);
        let mut state = TransferState::new(meta(total, 100), "Bob", Instant::now());
        for index in (0..total).rev() {
            let payload = chunk_at(&data, index, 30).unwrap().to_vec();
            let r = state.mark_received(index, payload);
            if index == 0 {
                assert_eq!(r, ChunkReceiveResult::Complete { total });
            } else {
                assert!(matches!(r, ChunkReceiveResult::InProgress { .. }));
            }
        }
        assert_eq!(state.reassemble_into_bytes(), data);
    }

    #[test]
    fn duplicate_chunk_is_idempotent() {
        let mut state = TransferState::new(meta(2, 8), "Bob", Instant::now());
        assert_eq!(
            state.mark_received(0, vec![1, 2, 3, 4]),
            ChunkReceiveResult::InProgress {
                received: 1,
                total: 2
            }
        );
        assert_eq!(
            state.mark_received(0, vec![9, 9, 9, 9]),
            ChunkReceiveResult::Duplicate
        );
        assert_eq!(state.received_count(), 1);
        assert_eq!(
            state.mark_received(1, vec![5, 6, 7, 8]),
            ChunkReceiveResult::Complete { total: 2 }
        );
        assert_eq!(state.reassemble_into_bytes(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn out_of_range_index_rejected() {
        let mut state = TransferState::new(meta(2, 8), "Bob", Instant::now());
        assert_eq!(
            state.mark_received(2, vec![0]),
            ChunkReceiveResult::OutOfRange
        );
        assert_eq!(
            state.mark_received(u32::MAX, vec![0]),
            ChunkReceiveResult::OutOfRange
        );
        assert_eq!(state.received_count(), 0);
    }
}
