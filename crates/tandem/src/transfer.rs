//! Chunked file transfer
//!
//! Offer/approve/reject handshake followed by ordered base64 chunks.
//!
//! Outgoing: `MetadataSent` -> `Transferring` (on approve) -> `Transferred`,
//! or `Rejected`. Incoming: `PendingApproval` -> `Transferring` (local
//! approve) -> `Transferred`, or `Rejected`. Any live transfer may end in
//! `Error`. Terminal records stay queryable after their buffers are released.
//!
//! The manager does no I/O on the data channel; the session sends the
//! envelopes it returns and schedules chunk ticks.

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SessionError;
use crate::protocol::{chunk_count, chunk_range, FileChunk, FileMetadata, FileRef};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    /// Offer sent, waiting for the remote decision
    MetadataSent,
    /// Offer received, waiting for the local decision
    PendingApproval,
    Transferring,
    Transferred,
    Rejected,
    Error(String),
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Transferred | TransferStatus::Rejected | TransferStatus::Error(_)
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::MetadataSent => write!(f, "metadata sent"),
            TransferStatus::PendingApproval => write!(f, "pending approval"),
            TransferStatus::Transferring => write!(f, "transferring"),
            TransferStatus::Transferred => write!(f, "transferred"),
            TransferStatus::Rejected => write!(f, "rejected"),
            TransferStatus::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Snapshot of one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferInfo {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub mime: Option<String>,
    pub direction: Direction,
    pub status: TransferStatus,
    /// Chunks sent (outgoing) or received (incoming)
    pub chunks_done: u64,
    pub total_chunks: u64,
}

/// Where outgoing bytes come from
#[derive(Debug, Clone)]
pub enum FileSource {
    Memory(Bytes),
    /// Read lazily, one chunk at a time
    Path(PathBuf),
}

impl FileSource {
    async fn size(&self) -> std::io::Result<u64> {
        match self {
            FileSource::Memory(bytes) => Ok(bytes.len() as u64),
            FileSource::Path(path) => Ok(tokio::fs::metadata(path).await?.len()),
        }
    }

    async fn read_range(&self, start: u64, end: u64) -> std::io::Result<Bytes> {
        match self {
            FileSource::Memory(bytes) => Ok(bytes.slice(start as usize..end as usize)),
            FileSource::Path(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(SeekFrom::Start(start)).await?;
                let mut buf = vec![0u8; (end - start) as usize];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

/// Result of accepting an incoming chunk
#[derive(Debug)]
pub enum ChunkOutcome {
    /// Buffered, more to come
    Stored { received: u64, total: u64 },
    /// Last chunk arrived and the file reassembled
    Complete { info: TransferInfo, bytes: Vec<u8> },
    /// Chunk for a rejected or finished transfer
    Dropped,
}

enum Payload {
    Outgoing { source: FileSource, next_chunk: u64 },
    Incoming {
        chunks: BTreeMap<u64, Bytes>,
        /// Taken from the first chunk; the sender's chunk size may differ
        announced_total: Option<u64>,
    },
    Released,
}

struct Transfer {
    info: TransferInfo,
    payload: Payload,
}

impl Transfer {
    fn set_status(&mut self, status: TransferStatus) {
        debug!(
            "[Transfer] {} {} -> {}",
            self.info.id, self.info.status, status
        );
        self.info.status = status;
        if self.info.status.is_terminal() {
            self.payload = Payload::Released;
        }
    }
}

pub struct TransferManager {
    chunk_size: usize,
    transfers: HashMap<String, Transfer>,
}

impl TransferManager {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            transfers: HashMap::new(),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn status(&self, file_id: &str) -> Option<TransferStatus> {
        self.transfers.get(file_id).map(|t| t.info.status.clone())
    }

    pub fn info(&self, file_id: &str) -> Option<TransferInfo> {
        self.transfers.get(file_id).map(|t| t.info.clone())
    }

    pub fn list(&self) -> Vec<TransferInfo> {
        let mut all: Vec<_> = self.transfers.values().map(|t| t.info.clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    fn get_mut(&mut self, file_id: &str) -> Result<&mut Transfer, SessionError> {
        self.transfers
            .get_mut(file_id)
            .ok_or_else(|| SessionError::UnknownTransfer(file_id.to_string()))
    }

    /// Register an outgoing file and build its announcement
    pub async fn offer(
        &mut self,
        source: FileSource,
        name: &str,
        mime: Option<String>,
    ) -> Result<(FileMetadata, TransferInfo), SessionError> {
        let id = Uuid::new_v4().to_string();
        let size = source
            .size()
            .await
            .map_err(|e| SessionError::transfer(&id, format!("cannot read source: {}", e)))?;

        let info = TransferInfo {
            id: id.clone(),
            name: name.to_string(),
            size,
            mime: mime.clone(),
            direction: Direction::Outgoing,
            status: TransferStatus::MetadataSent,
            chunks_done: 0,
            total_chunks: chunk_count(size, self.chunk_size),
        };
        self.transfers.insert(
            id.clone(),
            Transfer {
                info: info.clone(),
                payload: Payload::Outgoing {
                    source,
                    next_chunk: 0,
                },
            },
        );
        info!("[Transfer] offering {} ({} bytes) as {}", name, size, id);

        let metadata = FileMetadata {
            id,
            name: name.to_string(),
            size,
            mime,
        };
        Ok((metadata, info))
    }

    /// Remote announced a file
    pub fn on_metadata(&mut self, meta: FileMetadata) -> Result<TransferInfo, SessionError> {
        if self.transfers.contains_key(&meta.id) {
            return Err(SessionError::InvalidInput(format!(
                "duplicate file id {}",
                meta.id
            )));
        }
        let info = TransferInfo {
            id: meta.id.clone(),
            name: meta.name,
            size: meta.size,
            mime: meta.mime,
            direction: Direction::Incoming,
            status: TransferStatus::PendingApproval,
            chunks_done: 0,
            total_chunks: chunk_count(meta.size, self.chunk_size),
        };
        self.transfers.insert(
            meta.id,
            Transfer {
                info: info.clone(),
                payload: Payload::Incoming {
                    chunks: BTreeMap::new(),
                    announced_total: None,
                },
            },
        );
        info!(
            "[Transfer] incoming {} ({} bytes) as {}",
            info.name, info.size, info.id
        );
        Ok(info)
    }

    /// Reply to send for a local decision, leaving the transfer untouched
    ///
    /// The decision itself is applied with [`approve`](Self::approve) or
    /// [`reject`](Self::reject) once the reply went out.
    pub fn decision_reply(&self, file_id: &str) -> Result<FileRef, SessionError> {
        let transfer = self
            .transfers
            .get(file_id)
            .ok_or_else(|| SessionError::UnknownTransfer(file_id.to_string()))?;
        check_pending(transfer)?;
        Ok(FileRef {
            file_id: file_id.to_string(),
        })
    }

    fn pending_incoming(&mut self, file_id: &str) -> Result<&mut Transfer, SessionError> {
        let transfer = self.get_mut(file_id)?;
        check_pending(transfer)?;
        Ok(transfer)
    }

    /// Local approval of an incoming file
    pub fn approve(&mut self, file_id: &str) -> Result<(FileRef, TransferInfo), SessionError> {
        let transfer = self.pending_incoming(file_id)?;
        transfer.set_status(TransferStatus::Transferring);
        Ok((
            FileRef {
                file_id: file_id.to_string(),
            },
            transfer.info.clone(),
        ))
    }

    /// Local rejection of an incoming file
    pub fn reject(&mut self, file_id: &str) -> Result<(FileRef, TransferInfo), SessionError> {
        let transfer = self.pending_incoming(file_id)?;
        transfer.set_status(TransferStatus::Rejected);
        Ok((
            FileRef {
                file_id: file_id.to_string(),
            },
            transfer.info.clone(),
        ))
    }

    fn awaiting_decision(&mut self, file_id: &str) -> Result<&mut Transfer, SessionError> {
        let transfer = self.get_mut(file_id)?;
        if transfer.info.direction != Direction::Outgoing
            || transfer.info.status != TransferStatus::MetadataSent
        {
            return Err(SessionError::InvalidInput(format!(
                "transfer {} was not offered or already decided ({})",
                file_id, transfer.info.status
            )));
        }
        Ok(transfer)
    }

    /// Remote approved our offer; chunking may start
    pub fn on_approve(&mut self, file_id: &str) -> Result<TransferInfo, SessionError> {
        let transfer = self.awaiting_decision(file_id)?;
        transfer.set_status(TransferStatus::Transferring);
        Ok(transfer.info.clone())
    }

    /// Remote rejected our offer; nothing is ever sent for it
    pub fn on_reject(&mut self, file_id: &str) -> Result<TransferInfo, SessionError> {
        let transfer = self.awaiting_decision(file_id)?;
        transfer.set_status(TransferStatus::Rejected);
        Ok(transfer.info.clone())
    }

    /// Read the next outgoing chunk
    ///
    /// `Ok(None)` means the transfer is no longer sending. A read failure
    /// moves the transfer to `Error`.
    pub async fn next_chunk(&mut self, file_id: &str) -> Result<Option<FileChunk>, SessionError> {
        let chunk_size = self.chunk_size;
        let transfer = self.get_mut(file_id)?;
        if transfer.info.status != TransferStatus::Transferring {
            return Ok(None);
        }
        let (size, total) = (transfer.info.size, transfer.info.total_chunks);
        let (source, index) = match &transfer.payload {
            Payload::Outgoing { source, next_chunk } => (source, *next_chunk),
            _ => return Ok(None),
        };
        if index >= total {
            return Ok(None);
        }

        let (start, end) = chunk_range(index, size, chunk_size);
        match source.read_range(start, end).await {
            Ok(bytes) => Ok(Some(FileChunk::new(file_id, index, total, &bytes))),
            Err(e) => {
                let reason = format!("read failed at chunk {}: {}", index, e);
                warn!("[Transfer] {} {}", file_id, reason);
                transfer.set_status(TransferStatus::Error(reason.clone()));
                Err(SessionError::transfer(file_id, reason))
            }
        }
    }

    /// Record that the chunk from [`next_chunk`](Self::next_chunk) went out
    ///
    /// Returns `true` while more chunks remain.
    pub fn mark_sent(&mut self, file_id: &str) -> Result<bool, SessionError> {
        let transfer = self.get_mut(file_id)?;
        let total = transfer.info.total_chunks;
        let next = match &mut transfer.payload {
            Payload::Outgoing { next_chunk, .. } => {
                *next_chunk += 1;
                *next_chunk
            }
            _ => return Ok(false),
        };
        transfer.info.chunks_done = next;
        if next >= total {
            transfer.set_status(TransferStatus::Transferred);
            info!("[Transfer] {} sent ({} chunks)", file_id, total);
            return Ok(false);
        }
        Ok(true)
    }

    /// Move a live transfer to `Error`
    pub fn fail(&mut self, file_id: &str, reason: impl Into<String>) -> Option<TransferInfo> {
        let transfer = self.transfers.get_mut(file_id)?;
        if matches!(
            transfer.info.status,
            TransferStatus::Rejected | TransferStatus::Error(_)
        ) {
            return None;
        }
        transfer.set_status(TransferStatus::Error(reason.into()));
        Some(transfer.info.clone())
    }

    /// Accept an incoming chunk
    ///
    /// Protocol violations move a live transfer to `Error` and return
    /// [`SessionError::Transfer`]; the chunk is dropped either way.
    pub fn on_chunk(&mut self, chunk: FileChunk) -> Result<ChunkOutcome, SessionError> {
        let id = chunk.file_id.clone();
        let transfer = self.get_mut(&id)?;

        let status = transfer.info.status.clone();
        match (transfer.info.direction, status) {
            (Direction::Incoming, TransferStatus::Transferring) => {}
            (_, TransferStatus::Rejected) => {
                warn!("[Transfer] chunk for rejected transfer {}; dropping", id);
                return Ok(ChunkOutcome::Dropped);
            }
            (_, status) if status.is_terminal() => {
                debug!("[Transfer] chunk for finished transfer {}; dropping", id);
                return Ok(ChunkOutcome::Dropped);
            }
            (_, status) => {
                let reason = format!("chunk while {}", status);
                return Err(violation(transfer, reason));
            }
        }

        let announced = match &transfer.payload {
            Payload::Incoming { announced_total, .. } => *announced_total,
            _ => return Ok(ChunkOutcome::Dropped),
        };
        let total = match announced {
            Some(total) => total,
            None => {
                // The sender's chunk size decides the split
                if chunk.total_chunks == 0 || chunk.total_chunks > transfer.info.size.max(1) {
                    let reason = format!(
                        "totalChunks {} impossible for {} bytes",
                        chunk.total_chunks, transfer.info.size
                    );
                    return Err(violation(transfer, reason));
                }
                if let Payload::Incoming { announced_total, .. } = &mut transfer.payload {
                    *announced_total = Some(chunk.total_chunks);
                }
                transfer.info.total_chunks = chunk.total_chunks;
                chunk.total_chunks
            }
        };
        if chunk.total_chunks != total {
            let reason = format!(
                "totalChunks {} does not match expected {}",
                chunk.total_chunks, total
            );
            return Err(violation(transfer, reason));
        }
        if chunk.chunk_number >= total {
            let reason = format!("chunkNumber {} out of range", chunk.chunk_number);
            return Err(violation(transfer, reason));
        }
        if chunk.is_last != (chunk.chunk_number + 1 == total) {
            let reason = format!("isLast flag wrong on chunk {}", chunk.chunk_number);
            return Err(violation(transfer, reason));
        }
        let data = match chunk.decode_data() {
            Ok(data) => data,
            Err(e) => {
                let reason = format!("chunk {} is not valid base64: {}", chunk.chunk_number, e);
                return Err(violation(transfer, reason));
            }
        };

        let chunks = match &mut transfer.payload {
            Payload::Incoming { chunks, .. } => chunks,
            _ => return Ok(ChunkOutcome::Dropped),
        };
        chunks.insert(chunk.chunk_number, Bytes::from(data));
        let received = chunks.len() as u64;
        transfer.info.chunks_done = received;

        if !chunk.is_last {
            return Ok(ChunkOutcome::Stored { received, total });
        }

        if received != total {
            let missing = (0..total).find(|i| !chunks.contains_key(i)).unwrap_or(0);
            let reason = format!("missing chunk {} at end of transfer", missing);
            return Err(violation(transfer, reason));
        }

        let mut bytes = Vec::with_capacity(transfer.info.size as usize);
        for part in chunks.values() {
            bytes.extend_from_slice(part);
        }
        if bytes.len() as u64 != transfer.info.size {
            let reason = format!(
                "reassembled {} bytes, expected {}",
                bytes.len(),
                transfer.info.size
            );
            return Err(violation(transfer, reason));
        }

        transfer.set_status(TransferStatus::Transferred);
        info!("[Transfer] {} received ({} bytes)", id, bytes.len());
        Ok(ChunkOutcome::Complete {
            info: transfer.info.clone(),
            bytes,
        })
    }

    /// Drop every transfer and its buffers; returns how many were live
    pub fn discard_all(&mut self) -> usize {
        let live = self
            .transfers
            .values()
            .filter(|t| !t.info.status.is_terminal())
            .count();
        if !self.transfers.is_empty() {
            debug!(
                "[Transfer] discarding {} transfers ({} live)",
                self.transfers.len(),
                live
            );
        }
        self.transfers.clear();
        live
    }
}

fn check_pending(transfer: &Transfer) -> Result<(), SessionError> {
    if transfer.info.direction != Direction::Incoming
        || transfer.info.status != TransferStatus::PendingApproval
    {
        return Err(SessionError::InvalidInput(format!(
            "transfer {} is not awaiting approval ({})",
            transfer.info.id, transfer.info.status
        )));
    }
    Ok(())
}

fn violation(transfer: &mut Transfer, reason: String) -> SessionError {
    warn!("[Transfer] {} protocol violation: {}", transfer.info.id, reason);
    transfer.set_status(TransferStatus::Error(reason.clone()));
    SessionError::transfer(&transfer.info.id, reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CHUNK: usize = 65536;

    fn metadata(id: &str, size: u64) -> FileMetadata {
        FileMetadata {
            id: id.into(),
            name: "report.pdf".into(),
            size,
            mime: Some("application/pdf".into()),
        }
    }

    async fn send_all(sender: &mut TransferManager, id: &str) -> Vec<FileChunk> {
        let mut out = Vec::new();
        while let Some(chunk) = sender.next_chunk(id).await.unwrap() {
            out.push(chunk);
            if !sender.mark_sent(id).unwrap() {
                break;
            }
        }
        out
    }

    #[tokio::test]
    async fn test_report_pdf_chunking() {
        let data: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
        let mut sender = TransferManager::new(CHUNK);
        let (meta, info) = sender
            .offer(FileSource::Memory(Bytes::from(data.clone())), "report.pdf", None)
            .await
            .unwrap();
        assert_eq!(info.status, TransferStatus::MetadataSent);
        assert_eq!(meta.size, 150_000);

        // Nothing before approval
        assert!(sender.next_chunk(&meta.id).await.unwrap().is_none());

        sender.on_approve(&meta.id).unwrap();
        let chunks = send_all(&mut sender, &meta.id).await;
        let sizes: Vec<usize> = chunks
            .iter()
            .map(|c| c.decode_data().unwrap().len())
            .collect();
        assert_eq!(sizes, vec![65536, 65536, 18928]);
        assert!(chunks.iter().all(|c| c.total_chunks == 3));
        let last: Vec<bool> = chunks.iter().map(|c| c.is_last).collect();
        assert_eq!(last, vec![false, false, true]);
        assert_eq!(sender.status(&meta.id), Some(TransferStatus::Transferred));

        let mut receiver = TransferManager::new(CHUNK);
        receiver.on_metadata(meta.clone()).unwrap();
        receiver.approve(&meta.id).unwrap();
        let mut result = None;
        for chunk in chunks {
            if let ChunkOutcome::Complete { bytes, .. } = receiver.on_chunk(chunk).unwrap() {
                result = Some(bytes);
            }
        }
        assert_eq!(result.unwrap(), data);
        assert_eq!(receiver.status(&meta.id), Some(TransferStatus::Transferred));
    }

    #[tokio::test]
    async fn test_zero_byte_file() {
        let mut sender = TransferManager::new(CHUNK);
        let (meta, info) = sender
            .offer(FileSource::Memory(Bytes::new()), "empty.txt", None)
            .await
            .unwrap();
        assert_eq!(info.total_chunks, 1);
        sender.on_approve(&meta.id).unwrap();
        let chunks = send_all(&mut sender, &meta.id).await;
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_last);
        assert_eq!(chunks[0].data, "");

        let mut receiver = TransferManager::new(CHUNK);
        receiver.on_metadata(meta.clone()).unwrap();
        receiver.approve(&meta.id).unwrap();
        match receiver.on_chunk(chunks[0].clone()).unwrap() {
            ChunkOutcome::Complete { bytes, .. } => assert!(bytes.is_empty()),
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_sends_nothing() {
        let mut sender = TransferManager::new(CHUNK);
        let (meta, _) = sender
            .offer(FileSource::Memory(Bytes::from_static(b"abc")), "a.txt", None)
            .await
            .unwrap();
        sender.on_reject(&meta.id).unwrap();
        assert_eq!(sender.status(&meta.id), Some(TransferStatus::Rejected));
        assert!(sender.next_chunk(&meta.id).await.unwrap().is_none());
        // A late approval cannot revive it
        assert!(sender.on_approve(&meta.id).is_err());
    }

    #[test]
    fn test_local_reject_and_late_chunks() {
        let mut receiver = TransferManager::new(CHUNK);
        receiver.on_metadata(metadata("f1", 3)).unwrap();
        let (reply, info) = receiver.reject("f1").unwrap();
        assert_eq!(reply.file_id, "f1");
        assert_eq!(info.status, TransferStatus::Rejected);

        let chunk = FileChunk::new("f1", 0, 1, b"abc");
        assert!(matches!(
            receiver.on_chunk(chunk).unwrap(),
            ChunkOutcome::Dropped
        ));
        assert_eq!(receiver.status("f1"), Some(TransferStatus::Rejected));
    }

    #[test]
    fn test_gap_at_last_chunk() {
        let mut receiver = TransferManager::new(4);
        receiver.on_metadata(metadata("f1", 12)).unwrap();
        receiver.approve("f1").unwrap();

        receiver
            .on_chunk(FileChunk::new("f1", 0, 3, b"aaaa"))
            .unwrap();
        let err = receiver
            .on_chunk(FileChunk::new("f1", 2, 3, b"cccc"))
            .unwrap_err();
        assert!(matches!(err, SessionError::Transfer { .. }));
        assert!(matches!(
            receiver.status("f1"),
            Some(TransferStatus::Error(_))
        ));
    }

    #[test]
    fn test_chunk_violations() {
        let mut receiver = TransferManager::new(4);

        // Unknown id
        assert!(matches!(
            receiver.on_chunk(FileChunk::new("nope", 0, 1, b"x")),
            Err(SessionError::UnknownTransfer(_))
        ));

        // Chunk before approval
        receiver.on_metadata(metadata("f1", 4)).unwrap();
        assert!(receiver.on_chunk(FileChunk::new("f1", 0, 1, b"abcd")).is_err());
        assert!(matches!(receiver.status("f1"), Some(TransferStatus::Error(_))));

        // totalChunks changes after the first chunk
        receiver.on_metadata(metadata("f2", 8)).unwrap();
        receiver.approve("f2").unwrap();
        receiver.on_chunk(FileChunk::new("f2", 0, 2, b"abcd")).unwrap();
        assert!(receiver.on_chunk(FileChunk::new("f2", 1, 3, b"abcd")).is_err());

        // More chunks than bytes
        receiver.on_metadata(metadata("f6", 8)).unwrap();
        receiver.approve("f6").unwrap();
        assert!(receiver.on_chunk(FileChunk::new("f6", 0, 9, b"a")).is_err());
        assert!(matches!(receiver.status("f6"), Some(TransferStatus::Error(_))));

        // Out of range
        receiver.on_metadata(metadata("f3", 8)).unwrap();
        receiver.approve("f3").unwrap();
        let mut chunk = FileChunk::new("f3", 0, 2, b"abcd");
        chunk.chunk_number = 7;
        assert!(receiver.on_chunk(chunk).is_err());

        // Bad base64
        receiver.on_metadata(metadata("f4", 4)).unwrap();
        receiver.approve("f4").unwrap();
        let mut chunk = FileChunk::new("f4", 0, 1, b"abcd");
        chunk.data = "***".into();
        assert!(receiver.on_chunk(chunk).is_err());

        // Length mismatch
        receiver.on_metadata(metadata("f5", 4)).unwrap();
        receiver.approve("f5").unwrap();
        assert!(receiver.on_chunk(FileChunk::new("f5", 0, 1, b"ab")).is_err());
        assert!(matches!(receiver.status("f5"), Some(TransferStatus::Error(_))));
    }

    #[tokio::test]
    async fn test_receiver_follows_sender_chunk_size() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 253) as u8).collect();
        let mut sender = TransferManager::new(1024);
        let (meta, _) = sender
            .offer(FileSource::Memory(Bytes::from(data.clone())), "notes.bin", None)
            .await
            .unwrap();
        sender.on_approve(&meta.id).unwrap();
        let chunks = send_all(&mut sender, &meta.id).await;
        assert_eq!(chunks.len(), 5);

        let mut receiver = TransferManager::new(CHUNK);
        let info = receiver.on_metadata(meta.clone()).unwrap();
        assert_eq!(info.total_chunks, 1);
        receiver.approve(&meta.id).unwrap();

        let mut result = None;
        for chunk in chunks {
            match receiver.on_chunk(chunk).unwrap() {
                ChunkOutcome::Complete { info, bytes } => {
                    assert_eq!(info.total_chunks, 5);
                    result = Some(bytes);
                }
                ChunkOutcome::Stored { total, .. } => assert_eq!(total, 5),
                ChunkOutcome::Dropped => panic!("chunk dropped"),
            }
        }
        assert_eq!(result.unwrap(), data);
    }

    #[test]
    fn test_approve_requires_pending() {
        let mut receiver = TransferManager::new(CHUNK);
        assert!(matches!(
            receiver.approve("missing"),
            Err(SessionError::UnknownTransfer(_))
        ));
        receiver.on_metadata(metadata("f1", 3)).unwrap();
        let reply = receiver.decision_reply("f1").unwrap();
        assert_eq!(reply.file_id, "f1");
        assert_eq!(
            receiver.status("f1"),
            Some(TransferStatus::PendingApproval)
        );
        receiver.approve("f1").unwrap();
        assert!(receiver.decision_reply("f1").is_err());
        assert!(matches!(
            receiver.approve("f1"),
            Err(SessionError::InvalidInput(_))
        ));
        assert!(receiver.on_metadata(metadata("f1", 3)).is_err());
    }

    #[tokio::test]
    async fn test_path_source_read_per_chunk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();

        let mut sender = TransferManager::new(4);
        let (meta, info) = sender
            .offer(FileSource::Path(file.path().to_path_buf()), "hello.txt", None)
            .await
            .unwrap();
        assert_eq!(info.size, 11);
        assert_eq!(info.total_chunks, 3);
        sender.on_approve(&meta.id).unwrap();

        let chunks = send_all(&mut sender, &meta.id).await;
        let joined: Vec<u8> = chunks
            .iter()
            .flat_map(|c| c.decode_data().unwrap())
            .collect();
        assert_eq!(joined, b"hello world");
    }

    #[tokio::test]
    async fn test_read_failure_errors_transfer() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();
        let path = file.path().to_path_buf();

        let mut sender = TransferManager::new(4);
        let (meta, _) = sender
            .offer(FileSource::Path(path.clone()), "hello.txt", None)
            .await
            .unwrap();
        sender.on_approve(&meta.id).unwrap();
        std::fs::write(&path, b"hi").unwrap();

        sender.next_chunk(&meta.id).await.unwrap_err();
        assert!(matches!(
            sender.status(&meta.id),
            Some(TransferStatus::Error(_))
        ));
        assert!(sender.next_chunk(&meta.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_path_fails_offer() {
        let mut sender = TransferManager::new(CHUNK);
        let result = sender
            .offer(
                FileSource::Path(PathBuf::from("/nonexistent/tandem/file")),
                "file",
                None,
            )
            .await;
        assert!(matches!(result, Err(SessionError::Transfer { .. })));
        assert!(sender.list().is_empty());
    }

    #[test]
    fn test_discard_all_counts_live() {
        let mut receiver = TransferManager::new(CHUNK);
        receiver.on_metadata(metadata("f1", 3)).unwrap();
        receiver.on_metadata(metadata("f2", 3)).unwrap();
        receiver.reject("f2").unwrap();
        assert_eq!(receiver.discard_all(), 1);
        assert_eq!(receiver.discard_all(), 0);
        assert!(receiver.status("f1").is_none());
    }
}
