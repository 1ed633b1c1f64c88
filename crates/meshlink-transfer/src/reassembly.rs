//! Receiving side of a chunked transfer.
//!
//! Chunks may arrive in any order and may repeat; the last copy of an index
//! wins. Integrity problems are reported as [`ReassemblyOutcome::Failed`]
//! rather than as errors, so a transfer can be retried by resending chunks.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use meshlink_shared::checksum::checksum;
use meshlink_shared::constants::CANCELLED_TRANSFER_RETENTION_SECS;
use meshlink_shared::protocol::{ChunkFrame, TransferCancel};
use meshlink_shared::types::TransferId;

use crate::chunker::{Chunk, TransferMetadata};
use crate::error::{Result, TransferError};

/// Snapshot of a transfer in progress.
#[derive(Debug, Clone, PartialEq)]
pub struct ReassemblyProgress {
    pub transfer_id: TransferId,
    pub received_chunks: u32,
    pub total_chunks: u32,
    pub bytes_received: u64,
    pub total_bytes: u64,
    pub percentage: f64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReassemblyOutcome {
    Complete {
        transfer_id: TransferId,
        bytes: Vec<u8>,
        file_name: String,
        file_type: String,
        /// Chunks whose checksum was present and matched.
        verified_chunks: u32,
        duration: Duration,
    },
    Failed {
        transfer_id: TransferId,
        reason: String,
    },
}

impl ReassemblyOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, ReassemblyOutcome::Complete { .. })
    }
}

/// Result of feeding one wire frame to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Progress(ReassemblyProgress),
    Finished(ReassemblyOutcome),
    /// The frame belongs to a transfer cancelled earlier.
    Ignored,
}

struct ReassemblyState {
    metadata: TransferMetadata,
    chunks: BTreeMap<u32, Chunk>,
    bytes_received: u64,
    started_at: Instant,
}

impl ReassemblyState {
    fn progress(&self) -> ReassemblyProgress {
        let total_bytes = self.metadata.file_size;
        let percentage = if total_bytes == 0 {
            100.0
        } else {
            self.bytes_received as f64 * 100.0 / total_bytes as f64
        };
        ReassemblyProgress {
            transfer_id: self.metadata.transfer_id,
            received_chunks: self.chunks.len() as u32,
            total_chunks: self.metadata.total_chunks,
            bytes_received: self.bytes_received,
            total_bytes,
            percentage,
            elapsed: self.started_at.elapsed(),
        }
    }

    fn is_complete(&self) -> bool {
        self.chunks.len() as u32 == self.metadata.total_chunks
    }

    fn validate(&self, chunk: &Chunk) -> Result<()> {
        let metadata = &self.metadata;
        if chunk.index >= metadata.total_chunks {
            return Err(TransferError::Validation(format!(
                "chunk index {} out of range for {} chunks",
                chunk.index, metadata.total_chunks
            )));
        }
        let expected = metadata.expected_chunk_len(chunk.index);
        if chunk.len() as u64 != expected {
            return Err(TransferError::Validation(format!(
                "chunk {} holds {} bytes, expected {}",
                chunk.index,
                chunk.len(),
                expected
            )));
        }
        Ok(())
    }
}

pub struct ReassemblyEngine {
    transfers: HashMap<TransferId, ReassemblyState>,
    /// Cancelled transfers and when they were cancelled.
    cancelled: HashMap<TransferId, Instant>,
    cancel_retention: Duration,
}

impl Default for ReassemblyEngine {
    fn default() -> Self {
        Self::with_cancel_retention(Duration::from_secs(CANCELLED_TRANSFER_RETENTION_SECS))
    }
}

impl ReassemblyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames of a cancelled transfer are dropped for `retention`, after
    /// which the id is forgotten.
    pub fn with_cancel_retention(retention: Duration) -> Self {
        Self {
            transfers: HashMap::new(),
            cancelled: HashMap::new(),
            cancel_retention: retention,
        }
    }

    fn is_cancelled(&self, transfer_id: &TransferId) -> bool {
        self.cancelled
            .get(transfer_id)
            .is_some_and(|at| at.elapsed() < self.cancel_retention)
    }

    fn prune_cancelled(&mut self) {
        let retention = self.cancel_retention;
        self.cancelled.retain(|_, at| at.elapsed() < retention);
    }

    /// Start tracking a transfer. Returns false when it is already tracked.
    pub fn initialize(&mut self, metadata: TransferMetadata) -> bool {
        if self.transfers.contains_key(&metadata.transfer_id) {
            return false;
        }
        if metadata.check_layout().is_err() {
            warn!(
                transfer = %metadata.transfer_id,
                size = metadata.file_size,
                chunk_size = metadata.chunk_size,
                chunks = metadata.total_chunks,
                "Rejecting inconsistent transfer metadata"
            );
            return false;
        }

        debug!(
            transfer = %metadata.transfer_id,
            file = %metadata.file_name,
            chunks = metadata.total_chunks,
            "Reassembly started"
        );
        self.cancelled.remove(&metadata.transfer_id);
        self.transfers.insert(
            metadata.transfer_id,
            ReassemblyState {
                metadata,
                chunks: BTreeMap::new(),
                bytes_received: 0,
                started_at: Instant::now(),
            },
        );
        true
    }

    pub fn add_chunk(&mut self, chunk: Chunk) -> Result<ReassemblyProgress> {
        let state = self
            .transfers
            .get_mut(&chunk.transfer_id)
            .ok_or(TransferError::UnknownTransfer(chunk.transfer_id))?;
        state.validate(&chunk)?;

        let len = chunk.len() as u64;
        if let Some(previous) = state.chunks.insert(chunk.index, chunk) {
            state.bytes_received -= previous.len() as u64;
        }
        state.bytes_received += len;
        Ok(state.progress())
    }

    /// Join the chunks of a fully received transfer.
    ///
    /// A successful reassembly releases the transfer. A failed one keeps it,
    /// so missing or corrupt chunks can still be (re)delivered.
    pub fn reassemble(&mut self, transfer_id: &TransferId) -> Result<ReassemblyOutcome> {
        let state = self
            .transfers
            .get(transfer_id)
            .ok_or(TransferError::UnknownTransfer(*transfer_id))?;

        let failed = |reason: String| -> Result<ReassemblyOutcome> {
            warn!(transfer = %transfer_id, %reason, "Reassembly failed");
            Ok(ReassemblyOutcome::Failed {
                transfer_id: *transfer_id,
                reason,
            })
        };

        let total = state.metadata.total_chunks;
        if let Some(missing) = (0..total).find(|i| !state.chunks.contains_key(i)) {
            return failed(format!(
                "missing chunk {missing} ({} of {total} received)",
                state.chunks.len()
            ));
        }

        let mut bytes = Vec::with_capacity(state.metadata.file_size as usize);
        let mut verified_chunks = 0u32;
        for chunk in state.chunks.values() {
            if let Some(expected) = &chunk.checksum {
                if checksum(&chunk.data) != *expected {
                    return failed(format!("checksum mismatch in chunk {}", chunk.index));
                }
                verified_chunks += 1;
            }
            bytes.extend_from_slice(&chunk.data);
        }

        if let Some(expected) = &state.metadata.file_checksum {
            if checksum(&bytes) != *expected {
                return failed("file checksum mismatch".to_string());
            }
        }

        let Some(state) = self.transfers.remove(transfer_id) else {
            return Err(TransferError::UnknownTransfer(*transfer_id));
        };
        let duration = state.started_at.elapsed();
        info!(
            transfer = %transfer_id,
            file = %state.metadata.file_name,
            bytes = bytes.len(),
            verified_chunks,
            elapsed_ms = duration.as_millis() as u64,
            "Transfer reassembled"
        );
        Ok(ReassemblyOutcome::Complete {
            transfer_id: *transfer_id,
            bytes,
            file_name: state.metadata.file_name,
            file_type: state.metadata.file_type,
            verified_chunks,
            duration,
        })
    }

    /// Drop everything buffered for a transfer. Safe to repeat, and safe
    /// after the transfer completed.
    pub fn cancel(&mut self, transfer_id: &TransferId) -> bool {
        self.prune_cancelled();
        self.cancelled.insert(*transfer_id, Instant::now());
        let removed = self.transfers.remove(transfer_id).is_some();
        if removed {
            debug!(transfer = %transfer_id, "Reassembly cancelled");
        }
        removed
    }

    pub fn progress(&self, transfer_id: &TransferId) -> Option<ReassemblyProgress> {
        self.transfers.get(transfer_id).map(ReassemblyState::progress)
    }

    /// Whether every chunk of the transfer has been buffered.
    pub fn is_complete(&self, transfer_id: &TransferId) -> bool {
        self.transfers
            .get(transfer_id)
            .is_some_and(ReassemblyState::is_complete)
    }

    pub fn active_transfers(&self) -> usize {
        self.transfers.len()
    }

    /// Feed a chunk frame received from a peer.
    ///
    /// The first frame of a transfer initializes it from the metadata the
    /// frame carries; the frame completing it triggers reassembly.
    pub fn handle_frame(&mut self, frame: ChunkFrame) -> Result<FrameOutcome> {
        let transfer_id = frame.transfer_id;
        if self.is_cancelled(&transfer_id) {
            debug!(transfer = %transfer_id, index = frame.chunk_index, "Dropping frame of cancelled transfer");
            return Ok(FrameOutcome::Ignored);
        }

        match self.transfers.get(&transfer_id) {
            Some(state) => {
                let metadata = &state.metadata;
                if metadata.total_chunks != frame.total_chunks
                    || metadata.file_size != frame.file_size
                    || metadata.chunk_size != frame.chunk_size
                {
                    return Err(TransferError::Validation(format!(
                        "frame {} disagrees with transfer {transfer_id} metadata",
                        frame.chunk_index
                    )));
                }
            }
            None => {
                if !self.initialize(TransferMetadata::from_frame(&frame)) {
                    return Err(TransferError::Validation(format!(
                        "inconsistent metadata in first frame of transfer {transfer_id}"
                    )));
                }
            }
        }

        let progress = self.add_chunk(Chunk::from(frame))?;
        if self.is_complete(&transfer_id) {
            return Ok(FrameOutcome::Finished(self.reassemble(&transfer_id)?));
        }
        Ok(FrameOutcome::Progress(progress))
    }

    pub fn handle_cancel(&mut self, cancel: &TransferCancel) -> bool {
        info!(transfer = %cancel.transfer_id, reason = %cancel.reason, "Sender cancelled transfer");
        self.cancel(&cancel.transfer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{Chunker, ChunkerConfig, MemorySource};

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn split(data: &[u8], chunk_size: usize) -> (TransferMetadata, Vec<Chunk>) {
        let chunker = Chunker::new(ChunkerConfig::with_chunk_size(chunk_size)).unwrap();
        let source = MemorySource::new(data.to_vec());
        let metadata = chunker.prepare(&source, "photo.jpg", "image/jpeg").unwrap();
        let chunks = chunker
            .chunks(&source, &metadata)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        (metadata, chunks)
    }

    #[test]
    fn test_reassembles_any_arrival_order() {
        let data = sample(2049);
        for order in [[0usize, 1, 2], [2, 1, 0], [1, 2, 0], [2, 0, 1]] {
            let (metadata, chunks) = split(&data, 1024);
            let id = metadata.transfer_id;
            let mut engine = ReassemblyEngine::new();
            assert!(engine.initialize(metadata));

            for i in order {
                engine.add_chunk(chunks[i].clone()).unwrap();
            }
            assert!(engine.is_complete(&id));

            match engine.reassemble(&id).unwrap() {
                ReassemblyOutcome::Complete {
                    bytes,
                    file_name,
                    file_type,
                    verified_chunks,
                    ..
                } => {
                    assert_eq!(bytes, data);
                    assert_eq!(file_name, "photo.jpg");
                    assert_eq!(file_type, "image/jpeg");
                    assert_eq!(verified_chunks, 3);
                }
                other => panic!("unexpected outcome {other:?}"),
            }
            assert_eq!(engine.active_transfers(), 0);
        }
    }

    #[test]
    fn test_double_initialize_is_rejected() {
        let (metadata, _) = split(&sample(10), 4);
        let mut engine = ReassemblyEngine::new();
        assert!(engine.initialize(metadata.clone()));
        assert!(!engine.initialize(metadata));
    }

    #[test]
    fn test_inconsistent_metadata_is_rejected() {
        let (mut metadata, _) = split(&sample(10), 4);
        metadata.total_chunks = 7;
        assert!(!ReassemblyEngine::new().initialize(metadata));
    }

    #[test]
    fn test_chunk_for_unknown_transfer() {
        let (_, chunks) = split(&sample(10), 4);
        let mut engine = ReassemblyEngine::new();
        assert!(matches!(
            engine.add_chunk(chunks[0].clone()),
            Err(TransferError::UnknownTransfer(_))
        ));
    }

    #[test]
    fn test_invalid_chunks_are_rejected() {
        let (metadata, chunks) = split(&sample(10), 4);
        let mut engine = ReassemblyEngine::new();
        engine.initialize(metadata);

        let mut out_of_range = chunks[0].clone();
        out_of_range.index = 3;
        assert!(matches!(
            engine.add_chunk(out_of_range),
            Err(TransferError::Validation(_))
        ));

        let mut short = chunks[0].clone();
        short.data.pop();
        assert!(matches!(engine.add_chunk(short), Err(TransferError::Validation(_))));

        let mut long_tail = chunks[2].clone();
        long_tail.data.push(0);
        assert!(matches!(engine.add_chunk(long_tail), Err(TransferError::Validation(_))));
    }

    #[test]
    fn test_missing_chunk_fails() {
        let (metadata, chunks) = split(&sample(3000), 1000);
        let id = metadata.transfer_id;
        let mut engine = ReassemblyEngine::new();
        engine.initialize(metadata);
        engine.add_chunk(chunks[0].clone()).unwrap();
        engine.add_chunk(chunks[2].clone()).unwrap();

        match engine.reassemble(&id).unwrap() {
            ReassemblyOutcome::Failed { reason, .. } => assert!(reason.contains("missing chunk 1")),
            other => panic!("unexpected outcome {other:?}"),
        }

        // Still tracked, the missing chunk can arrive late.
        engine.add_chunk(chunks[1].clone()).unwrap();
        assert!(engine.reassemble(&id).unwrap().is_complete());
    }

    #[test]
    fn test_corrupt_chunk_fails_until_replaced() {
        let (metadata, chunks) = split(&sample(3000), 1000);
        let id = metadata.transfer_id;
        let mut engine = ReassemblyEngine::new();
        engine.initialize(metadata);

        let mut corrupt = chunks[1].clone();
        corrupt.data[10] ^= 0xff;
        engine.add_chunk(chunks[0].clone()).unwrap();
        engine.add_chunk(corrupt).unwrap();
        engine.add_chunk(chunks[2].clone()).unwrap();

        match engine.reassemble(&id).unwrap() {
            ReassemblyOutcome::Failed { reason, .. } => {
                assert_eq!(reason, "checksum mismatch in chunk 1")
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        // Last write wins.
        let progress = engine.add_chunk(chunks[1].clone()).unwrap();
        assert_eq!(progress.bytes_received, 3000);
        assert_eq!(progress.received_chunks, 3);
        assert!(engine.reassemble(&id).unwrap().is_complete());
    }

    #[test]
    fn test_file_checksum_mismatch_fails() {
        let (mut metadata, mut chunks) = split(&sample(100), 40);
        let id = metadata.transfer_id;
        metadata.file_checksum = Some(checksum(b"something else"));
        for chunk in &mut chunks {
            chunk.checksum = None;
        }

        let mut engine = ReassemblyEngine::new();
        engine.initialize(metadata);
        for chunk in chunks {
            engine.add_chunk(chunk).unwrap();
        }
        assert_eq!(
            engine.reassemble(&id).unwrap(),
            ReassemblyOutcome::Failed {
                transfer_id: id,
                reason: "file checksum mismatch".into()
            }
        );
    }

    #[test]
    fn test_progress_and_cancel() {
        let (metadata, chunks) = split(&sample(2049), 1024);
        let id = metadata.transfer_id;
        let mut engine = ReassemblyEngine::new();
        engine.initialize(metadata);

        let progress = engine.add_chunk(chunks[2].clone()).unwrap();
        assert_eq!(progress.received_chunks, 1);
        assert_eq!(progress.bytes_received, 1);
        assert_eq!(engine.progress(&id).unwrap().total_chunks, 3);
        assert!(!engine.is_complete(&id));

        assert!(engine.cancel(&id));
        assert!(!engine.cancel(&id));
        assert!(engine.progress(&id).is_none());
        assert!(matches!(
            engine.reassemble(&id),
            Err(TransferError::UnknownTransfer(_))
        ));
    }

    #[test]
    fn test_empty_transfer_completes_immediately() {
        let (metadata, chunks) = split(&[], 1024);
        assert!(chunks.is_empty());
        let id = metadata.transfer_id;
        let mut engine = ReassemblyEngine::new();
        engine.initialize(metadata);
        assert!(engine.is_complete(&id));
        match engine.reassemble(&id).unwrap() {
            ReassemblyOutcome::Complete { bytes, verified_chunks, .. } => {
                assert!(bytes.is_empty());
                assert_eq!(verified_chunks, 0);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_handle_frames() {
        let data = sample(2049);
        let (metadata, chunks) = split(&data, 1024);
        let mut engine = ReassemblyEngine::new();

        let frames: Vec<ChunkFrame> = chunks.iter().map(|c| c.to_frame(&metadata)).collect();
        assert!(matches!(
            engine.handle_frame(frames[1].clone()).unwrap(),
            FrameOutcome::Progress(p) if p.received_chunks == 1
        ));
        assert!(matches!(
            engine.handle_frame(frames[0].clone()).unwrap(),
            FrameOutcome::Progress(_)
        ));
        match engine.handle_frame(frames[2].clone()).unwrap() {
            FrameOutcome::Finished(ReassemblyOutcome::Complete { bytes, .. }) => {
                assert_eq!(bytes, data)
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_frames_after_cancel_are_ignored() {
        let (metadata, chunks) = split(&sample(2049), 1024);
        let frames: Vec<ChunkFrame> = chunks.iter().map(|c| c.to_frame(&metadata)).collect();
        let mut engine = ReassemblyEngine::new();

        engine.handle_frame(frames[0].clone()).unwrap();
        assert!(engine.handle_cancel(&TransferCancel {
            transfer_id: metadata.transfer_id,
            reason: "user aborted".into(),
        }));
        assert_eq!(engine.handle_frame(frames[1].clone()).unwrap(), FrameOutcome::Ignored);
        assert_eq!(engine.active_transfers(), 0);
    }

    #[test]
    fn test_cancelled_ids_expire() {
        let (metadata, chunks) = split(&sample(2049), 1024);
        let frames: Vec<ChunkFrame> = chunks.iter().map(|c| c.to_frame(&metadata)).collect();
        let mut engine = ReassemblyEngine::with_cancel_retention(Duration::ZERO);

        engine.handle_frame(frames[0].clone()).unwrap();
        engine.cancel(&metadata.transfer_id);
        // Forgotten right away, so the transfer starts over.
        assert!(matches!(
            engine.handle_frame(frames[1].clone()).unwrap(),
            FrameOutcome::Progress(p) if p.received_chunks == 1
        ));

        // Later cancels prune the expired ids.
        engine.cancel(&TransferId::new());
        engine.cancel(&TransferId::new());
        assert_eq!(engine.cancelled.len(), 1);
    }

    #[test]
    fn test_frame_with_conflicting_metadata() {
        let (metadata, chunks) = split(&sample(2049), 1024);
        let mut engine = ReassemblyEngine::new();
        engine.handle_frame(chunks[0].to_frame(&metadata)).unwrap();

        let mut frame = chunks[1].to_frame(&metadata);
        frame.total_chunks = 5;
        assert!(matches!(engine.handle_frame(frame), Err(TransferError::Validation(_))));
    }
}
