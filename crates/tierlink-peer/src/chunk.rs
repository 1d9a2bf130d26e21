//! Chunked binary transfers: split on send, reassemble by index on receive.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use tierlink_core::types::{PeerId, TransferId};
use tierlink_core::{Message, MessageBody, CHUNK_SIZE, MAX_PAYLOAD_SIZE, MAX_TOTAL_CHUNKS};

/// Incomplete transfers a single sender may hold open by default
pub const MAX_PENDING_PER_SENDER: usize = 4;

/// Split a payload into fixed-size chunks.
///
/// An empty payload still yields one empty chunk, so every transfer has
/// `total_chunks >= 1`.
pub fn split_payload(data: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    let size = if chunk_size == 0 { CHUNK_SIZE } else { chunk_size };
    if data.is_empty() {
        return vec![Bytes::new()];
    }

    let mut out = Vec::with_capacity(data.len().div_ceil(size));
    let mut start = 0;
    while start < data.len() {
        let end = (start + size).min(data.len());
        out.push(data.slice(start..end));
        start = end;
    }
    out
}

/// Every message of one outbound transfer: the chunks in index order, then the completion notice.
pub fn transfer_messages(
    sender_id: &str,
    transfer_id: &str,
    data: &Bytes,
    chunk_size: usize,
) -> Vec<Message> {
    let chunks = split_payload(data, chunk_size);
    let total_chunks = chunks.len() as u32;

    let mut messages: Vec<Message> = chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| {
            Message::new(
                sender_id,
                MessageBody::ImageChunk {
                    transfer_id: transfer_id.to_string(),
                    chunk_index: index as u32,
                    total_chunks,
                    data: chunk,
                },
            )
        })
        .collect();

    messages.push(Message::new(
        sender_id,
        MessageBody::ImageComplete {
            transfer_id: transfer_id.to_string(),
        },
    ));
    messages
}

/// Result of feeding one chunk to the reassembler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Stored; transfer not yet complete
    Pending { received: u32, total: u32 },
    /// Last missing chunk arrived; bytes are in index order
    Complete(Bytes),
    /// Slot already filled; the first write is kept
    Duplicate,
    /// Chunk did not fit the transfer it claims to belong to
    Rejected(String),
}

#[derive(Debug)]
struct PendingTransfer {
    total_chunks: u32,
    received: u32,
    buffered: usize,
    slots: Vec<Option<Bytes>>,
    last_activity: Instant,
}

impl PendingTransfer {
    fn new(total_chunks: u32, now: Instant) -> Self {
        Self {
            total_chunks,
            received: 0,
            buffered: 0,
            slots: vec![None; total_chunks as usize],
            last_activity: now,
        }
    }

    fn assemble(self) -> Bytes {
        let len = self.slots.iter().flatten().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(len);
        for slot in self.slots.into_iter().flatten() {
            out.extend_from_slice(&slot);
        }
        out.freeze()
    }
}

/// In-flight inbound transfers keyed by `(transfer_id, sender_id)`
///
/// Each sender is held to a number of open transfers and to a byte budget
/// across all of them; chunks beyond either are rejected.
#[derive(Debug)]
pub struct ChunkReassembler {
    pending: HashMap<(TransferId, PeerId), PendingTransfer>,
    max_chunks: u32,
    stale_after: Duration,
    max_pending_per_sender: usize,
    max_bytes_per_sender: usize,
}

impl Default for ChunkReassembler {
    fn default() -> Self {
        Self::new(MAX_TOTAL_CHUNKS, Duration::from_secs(60))
    }
}

impl ChunkReassembler {
    pub fn new(max_chunks: u32, stale_after: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            max_chunks,
            stale_after,
            max_pending_per_sender: MAX_PENDING_PER_SENDER,
            max_bytes_per_sender: MAX_PAYLOAD_SIZE,
        }
    }

    /// Limit each sender to `max_pending` open transfers holding at most `max_bytes`
    pub fn with_sender_limits(mut self, max_pending: usize, max_bytes: usize) -> Self {
        self.max_pending_per_sender = max_pending.max(1);
        self.max_bytes_per_sender = max_bytes;
        self
    }

    /// Open transfers and buffered bytes held for one sender
    fn sender_usage(&self, sender_id: &str) -> (usize, usize) {
        self.pending
            .iter()
            .filter(|((_, sender), _)| sender == sender_id)
            .fold((0, 0), |(count, bytes), (_, transfer)| {
                (count + 1, bytes + transfer.buffered)
            })
    }

    /// Store one chunk
    pub fn receive(
        &mut self,
        sender_id: &str,
        transfer_id: &str,
        chunk_index: u32,
        total_chunks: u32,
        data: Bytes,
    ) -> ChunkOutcome {
        self.receive_at(
            sender_id,
            transfer_id,
            chunk_index,
            total_chunks,
            data,
            Instant::now(),
        )
    }

    pub fn receive_at(
        &mut self,
        sender_id: &str,
        transfer_id: &str,
        chunk_index: u32,
        total_chunks: u32,
        data: Bytes,
        now: Instant,
    ) -> ChunkOutcome {
        self.purge_stale(now);

        if total_chunks == 0 || total_chunks > self.max_chunks {
            return ChunkOutcome::Rejected(format!(
                "total_chunks {} outside 1..={}",
                total_chunks, self.max_chunks
            ));
        }
        if chunk_index >= total_chunks {
            return ChunkOutcome::Rejected(format!(
                "chunk_index {} >= total_chunks {}",
                chunk_index, total_chunks
            ));
        }

        let key = (transfer_id.to_string(), sender_id.to_string());
        let (open, buffered) = self.sender_usage(sender_id);
        if !self.pending.contains_key(&key) && open >= self.max_pending_per_sender {
            debug!(
                "Sender {} already has {} transfers open, refusing {}",
                sender_id, open, transfer_id
            );
            return ChunkOutcome::Rejected("too many open transfers".into());
        }
        if buffered + data.len() > self.max_bytes_per_sender {
            debug!(
                "Sender {} would buffer more than {} bytes, refusing chunk of {}",
                sender_id, self.max_bytes_per_sender, transfer_id
            );
            return ChunkOutcome::Rejected("sender byte budget exhausted".into());
        }

        let transfer = self
            .pending
            .entry(key.clone())
            .or_insert_with(|| PendingTransfer::new(total_chunks, now));

        if transfer.total_chunks != total_chunks {
            warn!(
                "Transfer {} from {} changed total_chunks {} -> {}, ignoring chunk",
                transfer_id, sender_id, transfer.total_chunks, total_chunks
            );
            return ChunkOutcome::Rejected("total_chunks mismatch".into());
        }

        transfer.last_activity = now;
        let slot = &mut transfer.slots[chunk_index as usize];
        if slot.is_some() {
            debug!(
                "Duplicate chunk {}/{} of {} from {}",
                chunk_index, total_chunks, transfer_id, sender_id
            );
            return ChunkOutcome::Duplicate;
        }
        transfer.buffered += data.len();
        *slot = Some(data);
        transfer.received += 1;

        if transfer.received < transfer.total_chunks {
            return ChunkOutcome::Pending {
                received: transfer.received,
                total: transfer.total_chunks,
            };
        }

        match self.pending.remove(&key) {
            Some(done) => {
                let bytes = done.assemble();
                debug!(
                    "Transfer {} from {} complete ({} bytes)",
                    transfer_id,
                    sender_id,
                    bytes.len()
                );
                ChunkOutcome::Complete(bytes)
            }
            None => ChunkOutcome::Rejected("transfer vanished".into()),
        }
    }

    /// Sender declared the transfer finished
    ///
    /// An incomplete transfer is dropped; an unknown or already completed one is
    /// a no-op. Returns whether anything was dropped.
    pub fn complete(&mut self, sender_id: &str, transfer_id: &str) -> bool {
        let key = (transfer_id.to_string(), sender_id.to_string());
        match self.pending.remove(&key) {
            Some(transfer) => {
                warn!(
                    "Transfer {} from {} ended with {}/{} chunks, discarding",
                    transfer_id, sender_id, transfer.received, transfer.total_chunks
                );
                true
            }
            None => false,
        }
    }

    /// Drop every pending transfer from a departed sender
    pub fn purge_sender(&mut self, sender_id: &str) -> usize {
        let before = self.pending.len();
        self.pending.retain(|(_, sender), _| sender != sender_id);
        let purged = before - self.pending.len();
        if purged > 0 {
            debug!("Purged {} pending transfers from {}", purged, sender_id);
        }
        purged
    }

    /// Drop transfers idle for longer than the stale age
    pub fn purge_stale(&mut self, now: Instant) -> usize {
        let stale_after = self.stale_after;
        let before = self.pending.len();
        self.pending.retain(|(transfer_id, sender), transfer| {
            let keep = now.saturating_duration_since(transfer.last_activity) < stale_after;
            if !keep {
                debug!("Transfer {} from {} went stale", transfer_id, sender);
            }
            keep
        });
        before - self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
