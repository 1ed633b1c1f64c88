//! Splitting a byte source into fixed-size, optionally checksummed chunks.
//!
//! Every chunk is exactly `chunk_size` bytes long except the last one, which
//! holds the remainder. A source whose size is a multiple of the chunk size
//! ends on a full chunk, and an empty source yields no chunks at all.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use meshlink_shared::checksum::{checksum, Checksummer};
use meshlink_shared::constants::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use meshlink_shared::protocol::{ChunkFrame, PeerMessage, TransferCancel};
use meshlink_shared::types::TransferId;

use crate::error::{Result, TransferError};

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    pub chunk_size: usize,
    pub max_chunk_size: usize,
    /// Attach a BLAKE3 checksum to every chunk and to the whole transfer.
    pub enable_checksums: bool,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_chunk_size: MAX_CHUNK_SIZE,
            enable_checksums: true,
        }
    }
}

impl ChunkerConfig {
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            ..Self::default()
        }
    }
}

/// Description of one transfer, fixed before the first chunk is produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMetadata {
    pub transfer_id: TransferId,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub chunk_size: u32,
    pub total_chunks: u32,
    pub file_checksum: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TransferMetadata {
    /// Metadata as announced by the sender inside a chunk frame.
    pub fn from_frame(frame: &ChunkFrame) -> Self {
        Self {
            transfer_id: frame.transfer_id,
            file_name: frame.file_name.clone(),
            file_type: frame.file_type.clone(),
            file_size: frame.file_size,
            chunk_size: frame.chunk_size,
            total_chunks: frame.total_chunks,
            file_checksum: frame.file_checksum.clone(),
            created_at: Utc::now(),
        }
    }

    /// Check that `total_chunks` is exactly `ceil(file_size / chunk_size)`.
    pub fn check_layout(&self) -> Result<()> {
        check_layout(self.file_size, self.chunk_size as u64, self.total_chunks)
    }

    /// Length the chunk at `index` must have.
    pub fn expected_chunk_len(&self, index: u32) -> u64 {
        let chunk_size = self.chunk_size as u64;
        let offset = index as u64 * chunk_size;
        self.file_size.saturating_sub(offset).min(chunk_size)
    }
}

fn check_layout(file_size: u64, chunk_size: u64, total_chunks: u32) -> Result<()> {
    let consistent = if chunk_size == 0 {
        file_size == 0 && total_chunks == 0
    } else {
        file_size.div_ceil(chunk_size) == total_chunks as u64
    };
    if consistent {
        return Ok(());
    }
    Err(TransferError::Validation(format!(
        "{total_chunks} chunks of {chunk_size} bytes cannot hold {file_size} bytes exactly"
    )))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub transfer_id: TransferId,
    pub index: u32,
    pub data: Vec<u8>,
    pub checksum: Option<String>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Wire frame carrying this chunk together with the transfer metadata.
    pub fn to_frame(&self, metadata: &TransferMetadata) -> ChunkFrame {
        ChunkFrame {
            transfer_id: self.transfer_id,
            chunk_index: self.index,
            total_chunks: metadata.total_chunks,
            file_name: metadata.file_name.clone(),
            file_type: metadata.file_type.clone(),
            file_size: metadata.file_size,
            chunk_size: metadata.chunk_size,
            payload: self.data.clone(),
            checksum: self.checksum.clone(),
            file_checksum: metadata.file_checksum.clone(),
        }
    }
}

impl From<ChunkFrame> for Chunk {
    fn from(frame: ChunkFrame) -> Self {
        Self {
            transfer_id: frame.transfer_id,
            index: frame.chunk_index,
            data: frame.payload,
            checksum: frame.checksum,
        }
    }
}

/// Reported after each produced chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkProgress {
    pub index: u32,
    pub bytes_processed: u64,
    pub percentage: f64,
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Random-access byte source a transfer reads from.
pub trait ChunkSource: Send + Sync {
    fn size(&self) -> u64;

    /// Fill `buf` with the bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    data: Vec<u8>,
}

impl MemorySource {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl ChunkSource for MemorySource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| TransferError::Validation(format!("offset {offset} out of range")))?;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                TransferError::Validation(format!(
                    "read of {} bytes at {offset} past end of {}-byte source",
                    buf.len(),
                    self.data.len()
                ))
            })?;
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }
}

/// A file on disk. Its size is captured when it is opened.
#[derive(Debug)]
pub struct FileSource {
    file: Mutex<File>,
    size: u64,
    name: String,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            file: Mutex::new(file),
            size,
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl ChunkSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock().map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::Other, "file source lock poisoned")
        })?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Chunker
// ---------------------------------------------------------------------------

pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Result<Self> {
        if config.chunk_size == 0 {
            return Err(TransferError::InvalidConfig(
                "chunk size must be greater than zero".into(),
            ));
        }
        if config.chunk_size > config.max_chunk_size {
            return Err(TransferError::InvalidConfig(format!(
                "chunk size {} exceeds maximum {}",
                config.chunk_size, config.max_chunk_size
            )));
        }
        if u32::try_from(config.chunk_size).is_err() {
            return Err(TransferError::InvalidConfig(format!(
                "chunk size {} does not fit the wire format",
                config.chunk_size
            )));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// `ceil(total_bytes / chunk_size)`, 0 for an empty source.
    pub fn estimate_chunk_count(&self, total_bytes: u64) -> u64 {
        total_bytes.div_ceil(self.config.chunk_size as u64)
    }

    /// Hex BLAKE3 checksum of the whole source. Depends on content only.
    pub fn calculate_file_checksum(&self, source: &dyn ChunkSource) -> Result<String> {
        let mut summer = Checksummer::new();
        let mut buf = vec![0u8; self.config.chunk_size];
        let size = source.size();
        let mut offset = 0u64;
        while offset < size {
            let len = (size - offset).min(buf.len() as u64) as usize;
            source.read_at(offset, &mut buf[..len])?;
            summer.update(&buf[..len]);
            offset += len as u64;
        }
        Ok(summer.finalize())
    }

    /// Fix the metadata of a new transfer of `source`.
    pub fn prepare(
        &self,
        source: &dyn ChunkSource,
        file_name: impl Into<String>,
        file_type: impl Into<String>,
    ) -> Result<TransferMetadata> {
        let file_size = source.size();
        let total_chunks = u32::try_from(self.estimate_chunk_count(file_size)).map_err(|_| {
            TransferError::Validation(format!("{file_size} bytes need too many chunks"))
        })?;
        let file_checksum = if self.config.enable_checksums {
            Some(self.calculate_file_checksum(source)?)
        } else {
            None
        };

        let metadata = TransferMetadata {
            transfer_id: TransferId::new(),
            file_name: file_name.into(),
            file_type: file_type.into(),
            file_size,
            chunk_size: self.config.chunk_size as u32,
            total_chunks,
            file_checksum,
            created_at: Utc::now(),
        };
        debug!(
            transfer = %metadata.transfer_id,
            file = %metadata.file_name,
            size = file_size,
            chunks = total_chunks,
            "Prepared transfer"
        );
        Ok(metadata)
    }

    /// Lazy chunk sequence for `metadata`. Calling this again, or
    /// [`ChunkIter::restart`], starts over from the first chunk.
    pub fn chunks<'a>(
        &self,
        source: &'a dyn ChunkSource,
        metadata: &TransferMetadata,
    ) -> ChunkIter<'a> {
        ChunkIter {
            source,
            transfer_id: metadata.transfer_id,
            file_size: metadata.file_size,
            chunk_size: metadata.chunk_size as u64,
            total_chunks: metadata.total_chunks,
            checksums: self.config.enable_checksums,
            next_index: 0,
            bytes_processed: 0,
            failed: false,
            on_progress: None,
        }
    }

    /// Push every chunk of `metadata` through `send`, one encoded
    /// [`PeerMessage::Chunk`] frame per call.
    ///
    /// Checks `cancel` before each chunk. Once it is set a
    /// [`PeerMessage::TransferCancel`] frame is sent instead and the report is
    /// marked cancelled.
    pub async fn send_transfer<F, E>(
        &self,
        source: &dyn ChunkSource,
        metadata: &TransferMetadata,
        cancel: &CancelFlag,
        mut send: F,
    ) -> Result<SendReport>
    where
        F: FnMut(Vec<u8>) -> std::result::Result<(), E>,
        E: std::fmt::Display,
    {
        let mut report = SendReport {
            transfer_id: metadata.transfer_id,
            chunks_sent: 0,
            bytes_sent: 0,
            cancelled: false,
        };

        for chunk in self.chunks(source, metadata) {
            if cancel.is_cancelled() {
                let frame = PeerMessage::TransferCancel(TransferCancel {
                    transfer_id: metadata.transfer_id,
                    reason: "cancelled by sender".into(),
                })
                .to_bytes()?;
                if let Err(e) = send(frame) {
                    warn!(transfer = %metadata.transfer_id, "Failed to send cancel frame: {e}");
                }
                info!(transfer = %metadata.transfer_id, sent = report.chunks_sent, "Transfer cancelled");
                report.cancelled = true;
                return Ok(report);
            }

            let chunk = chunk?;
            let len = chunk.len() as u64;
            let frame = PeerMessage::Chunk(chunk.to_frame(metadata)).to_bytes()?;
            send(frame).map_err(|e| TransferError::Send(e.to_string()))?;
            report.chunks_sent += 1;
            report.bytes_sent += len;

            tokio::task::yield_now().await;
        }

        info!(
            transfer = %metadata.transfer_id,
            chunks = report.chunks_sent,
            bytes = report.bytes_sent,
            "Transfer sent"
        );
        Ok(report)
    }
}

/// Lazy sequence of chunks read from a source.
///
/// Stops after the first read error.
pub struct ChunkIter<'a> {
    source: &'a dyn ChunkSource,
    transfer_id: TransferId,
    file_size: u64,
    chunk_size: u64,
    total_chunks: u32,
    checksums: bool,
    next_index: u32,
    bytes_processed: u64,
    failed: bool,
    on_progress: Option<Box<dyn FnMut(ChunkProgress) + Send + 'a>>,
}

impl<'a> ChunkIter<'a> {
    pub fn with_progress(mut self, callback: impl FnMut(ChunkProgress) + Send + 'a) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    pub fn restart(&mut self) {
        self.next_index = 0;
        self.bytes_processed = 0;
        self.failed = false;
    }

    fn read_next(&mut self) -> Result<Chunk> {
        if self.next_index == 0 {
            check_layout(self.file_size, self.chunk_size, self.total_chunks)?;
            if self.source.size() != self.file_size {
                return Err(TransferError::Validation(format!(
                    "source holds {} bytes, transfer expects {}",
                    self.source.size(),
                    self.file_size
                )));
            }
        }

        let index = self.next_index;
        let offset = index as u64 * self.chunk_size;
        let len = self.file_size.saturating_sub(offset).min(self.chunk_size) as usize;
        let mut data = vec![0u8; len];
        self.source.read_at(offset, &mut data)?;

        let checksum = self.checksums.then(|| checksum(&data));
        Ok(Chunk {
            transfer_id: self.transfer_id,
            index,
            data,
            checksum,
        })
    }
}

impl Iterator for ChunkIter<'_> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.next_index >= self.total_chunks {
            return None;
        }

        match self.read_next() {
            Ok(chunk) => {
                self.next_index += 1;
                self.bytes_processed += chunk.len() as u64;
                if let Some(callback) = self.on_progress.as_mut() {
                    callback(ChunkProgress {
                        index: chunk.index,
                        bytes_processed: self.bytes_processed,
                        percentage: self.bytes_processed as f64 * 100.0 / self.file_size as f64,
                    });
                }
                Some(Ok(chunk))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.failed {
            return (0, Some(0));
        }
        let left = self.total_chunks.saturating_sub(self.next_index) as usize;
        (0, Some(left))
    }
}

/// Cancellation switch shared between a running transfer and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub transfer_id: TransferId,
    pub chunks_sent: u32,
    pub bytes_sent: u64,
    pub cancelled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn chunker(chunk_size: usize) -> Chunker {
        Chunker::new(ChunkerConfig::with_chunk_size(chunk_size)).unwrap()
    }

    #[test]
    fn test_rejects_bad_chunk_sizes() {
        assert!(matches!(
            Chunker::new(ChunkerConfig::with_chunk_size(0)),
            Err(TransferError::InvalidConfig(_))
        ));
        assert!(matches!(
            Chunker::new(ChunkerConfig::with_chunk_size(MAX_CHUNK_SIZE + 1)),
            Err(TransferError::InvalidConfig(_))
        ));
        assert!(Chunker::new(ChunkerConfig::with_chunk_size(MAX_CHUNK_SIZE)).is_ok());
    }

    #[test]
    fn test_estimate_is_ceiling() {
        for chunk_size in [1usize, 7, 1024, 16 * 1024] {
            let c = chunker(chunk_size);
            for n in [0u64, 1, 1023, 1024, 1025, 2049, 100_000] {
                let expected = (n + chunk_size as u64 - 1) / chunk_size as u64;
                assert_eq!(c.estimate_chunk_count(n), expected, "n={n} c={chunk_size}");
            }
        }
    }

    #[test]
    fn test_2049_bytes_in_1024_chunks() {
        let c = chunker(1024);
        let source = MemorySource::new(sample(2049));
        let metadata = c.prepare(&source, "a.bin", "application/octet-stream").unwrap();
        assert_eq!(metadata.total_chunks, 3);

        let chunks: Vec<Chunk> = c.chunks(&source, &metadata).collect::<Result<_>>().unwrap();
        let lengths: Vec<usize> = chunks.iter().map(Chunk::len).collect();
        assert_eq!(lengths, vec![1024, 1024, 1]);
        assert_eq!(chunks.iter().map(|c| c.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(chunks.iter().all(|c| c.checksum.is_some()));

        let joined: Vec<u8> = chunks.into_iter().flat_map(|c| c.data).collect();
        assert_eq!(joined, source.as_bytes());
    }

    #[test]
    fn test_exact_multiple_has_no_trailing_empty_chunk() {
        let c = chunker(512);
        let source = MemorySource::new(sample(2048));
        let metadata = c.prepare(&source, "b.bin", "").unwrap();
        let chunks: Vec<Chunk> = c.chunks(&source, &metadata).collect::<Result<_>>().unwrap();
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.len() == 512));
    }

    #[test]
    fn test_empty_source_yields_nothing() {
        let c = chunker(1024);
        let source = MemorySource::default();
        let metadata = c.prepare(&source, "empty", "text/plain").unwrap();
        assert_eq!(metadata.total_chunks, 0);
        assert_eq!(c.chunks(&source, &metadata).count(), 0);
    }

    #[test]
    fn test_restart_produces_same_sequence() {
        let c = chunker(100);
        let source = MemorySource::new(sample(450));
        let metadata = c.prepare(&source, "c.bin", "").unwrap();

        let mut iter = c.chunks(&source, &metadata);
        let first: Vec<Chunk> = iter.by_ref().collect::<Result<_>>().unwrap();
        assert!(iter.next().is_none());
        iter.restart();
        let second: Vec<Chunk> = iter.collect::<Result<_>>().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_progress_reports_each_chunk() {
        let c = chunker(1024);
        let source = MemorySource::new(sample(2049));
        let metadata = c.prepare(&source, "a.bin", "").unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let iter = c
            .chunks(&source, &metadata)
            .with_progress(move |p| sink.lock().unwrap().push(p));
        assert_eq!(iter.count(), 3);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].bytes_processed, 1024);
        assert_eq!(seen[2].index, 2);
        assert_eq!(seen[2].bytes_processed, 2049);
        assert!((seen[2].percentage - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_checksums_can_be_disabled() {
        let c = Chunker::new(ChunkerConfig {
            chunk_size: 64,
            enable_checksums: false,
            ..ChunkerConfig::default()
        })
        .unwrap();
        let source = MemorySource::new(sample(100));
        let metadata = c.prepare(&source, "d.bin", "").unwrap();
        assert!(metadata.file_checksum.is_none());
        assert!(c.chunks(&source, &metadata).all(|c| c.unwrap().checksum.is_none()));
    }

    #[test]
    fn test_file_checksum_depends_on_content_only() {
        let data = sample(5000);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let c = chunker(1024);
        let from_file = FileSource::open(file.path()).unwrap();
        let from_memory = MemorySource::new(data.clone());
        assert_eq!(
            c.calculate_file_checksum(&from_file).unwrap(),
            c.calculate_file_checksum(&from_memory).unwrap()
        );
        assert_eq!(
            c.calculate_file_checksum(&from_memory).unwrap(),
            checksum(&data)
        );

        let mut mutated = data;
        mutated[4999] ^= 0x80;
        assert_ne!(
            c.calculate_file_checksum(&MemorySource::new(mutated)).unwrap(),
            c.calculate_file_checksum(&from_memory).unwrap()
        );
    }

    #[test]
    fn test_file_source_chunks() {
        let data = sample(3000);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let source = FileSource::open(file.path()).unwrap();
        assert_eq!(source.size(), 3000);
        assert!(!source.name().is_empty());

        let c = chunker(1024);
        let metadata = c.prepare(&source, source.name(), "").unwrap();
        let joined: Vec<u8> = c
            .chunks(&source, &metadata)
            .flat_map(|c| c.unwrap().data)
            .collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn test_source_size_mismatch_stops_iteration() {
        let c = chunker(10);
        let source = MemorySource::new(sample(30));
        let metadata = c.prepare(&source, "e", "").unwrap();
        let shorter = MemorySource::new(sample(20));

        let mut iter = c.chunks(&shorter, &metadata);
        assert!(matches!(iter.next(), Some(Err(TransferError::Validation(_)))));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_inconsistent_metadata_is_rejected_before_reading() {
        let c = chunker(4);
        let source = MemorySource::new(sample(10));
        let metadata = c.prepare(&source, "f", "").unwrap();
        assert!(metadata.check_layout().is_ok());

        let mut too_many = metadata.clone();
        too_many.total_chunks = 4;
        let chunks: Vec<_> = c.chunks(&source, &too_many).collect();
        assert_eq!(chunks.len(), 1);
        assert!(matches!(chunks[0], Err(TransferError::Validation(_))));

        let mut zero_size = metadata.clone();
        zero_size.chunk_size = 0;
        assert!(zero_size.check_layout().is_err());
        let mut iter = c.chunks(&source, &zero_size);
        assert!(matches!(iter.next(), Some(Err(TransferError::Validation(_)))));
        assert!(iter.next().is_none());

        let mut too_few = metadata;
        too_few.total_chunks = 2;
        assert!(c.chunks(&source, &too_few).next().unwrap().is_err());
    }

    #[tokio::test]
    async fn test_send_transfer_frames() {
        let c = chunker(1024);
        let source = MemorySource::new(sample(2049));
        let metadata = c.prepare(&source, "a.bin", "").unwrap();

        let mut frames = Vec::new();
        let report = c
            .send_transfer(&source, &metadata, &CancelFlag::new(), |bytes| {
                frames.push(bytes);
                Ok::<_, TransferError>(())
            })
            .await
            .unwrap();

        assert_eq!(report.chunks_sent, 3);
        assert_eq!(report.bytes_sent, 2049);
        assert!(!report.cancelled);
        for (i, bytes) in frames.iter().enumerate() {
            match PeerMessage::from_bytes(bytes).unwrap() {
                PeerMessage::Chunk(frame) => {
                    assert_eq!(frame.chunk_index, i as u32);
                    assert_eq!(frame.total_chunks, 3);
                    assert_eq!(frame.file_checksum, metadata.file_checksum);
                }
                other => panic!("unexpected frame {}", other.kind()),
            }
        }
    }

    #[tokio::test]
    async fn test_send_transfer_cancelled_midway() {
        let c = chunker(100);
        let source = MemorySource::new(sample(1000));
        let metadata = c.prepare(&source, "big.bin", "").unwrap();
        let cancel = CancelFlag::new();

        let mut frames = Vec::new();
        let report = c
            .send_transfer(&source, &metadata, &cancel, |bytes| {
                frames.push(bytes);
                if frames.len() == 2 {
                    cancel.cancel();
                }
                Ok::<_, TransferError>(())
            })
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.chunks_sent, 2);
        assert_eq!(frames.len(), 3);
        match PeerMessage::from_bytes(&frames[2]).unwrap() {
            PeerMessage::TransferCancel(msg) => assert_eq!(msg.transfer_id, metadata.transfer_id),
            other => panic!("unexpected frame {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_send_failure_aborts() {
        let c = chunker(100);
        let source = MemorySource::new(sample(300));
        let metadata = c.prepare(&source, "f", "").unwrap();

        let result = c
            .send_transfer(&source, &metadata, &CancelFlag::new(), |_| Err("link closed"))
            .await;
        assert!(matches!(result, Err(TransferError::Send(msg)) if msg == "link closed"));
    }
}
