//! Application wire protocol over the data channel
//!
//! Every frame is a JSON text envelope:
//! - `{"type": "chat", "payload": {"text": ..., "sentAt": ...}}`
//! - `{"type": "file_chunk", "payload": {"fileId": ..., "chunkNumber": ..., ...}}`
//!
//! Chunk bytes travel as standard base64 inside the envelope.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::now_millis;

/// Envelope type tags
pub const MSG_TYPE_CHAT: &str = "chat";
pub const MSG_TYPE_DATA_SNIPPET: &str = "data_snippet";
pub const MSG_TYPE_FILE_METADATA: &str = "file_metadata";
pub const MSG_TYPE_FILE_APPROVE: &str = "file_approve";
pub const MSG_TYPE_FILE_REJECT: &str = "file_reject";
pub const MSG_TYPE_FILE_CHUNK: &str = "file_chunk";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub text: String,
    /// Epoch millis
    #[serde(rename = "sentAt")]
    pub sent_at: u64,
}

impl ChatMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sent_at: now_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSnippet {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Announcement of an outgoing file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub id: String,
    pub name: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}

/// Body of `file_approve` and `file_reject`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    #[serde(rename = "fileId")]
    pub file_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    #[serde(rename = "fileId")]
    pub file_id: String,
    #[serde(rename = "chunkNumber")]
    pub chunk_number: u64,
    #[serde(rename = "totalChunks")]
    pub total_chunks: u64,
    /// Base64 chunk bytes
    pub data: String,
    #[serde(rename = "isLast")]
    pub is_last: bool,
}

impl FileChunk {
    pub fn new(file_id: &str, chunk_number: u64, total_chunks: u64, bytes: &[u8]) -> Self {
        Self {
            file_id: file_id.to_string(),
            chunk_number,
            total_chunks,
            data: STANDARD.encode(bytes),
            is_last: chunk_number + 1 == total_chunks,
        }
    }

    /// Decode the chunk bytes
    pub fn decode_data(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(self.data.as_bytes())
    }
}

/// Typed application message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Envelope {
    Chat(ChatMessage),
    DataSnippet(DataSnippet),
    FileMetadata(FileMetadata),
    FileApprove(FileRef),
    FileReject(FileRef),
    FileChunk(FileChunk),
}

impl Envelope {
    /// Wire tag of this message
    pub fn type_name(&self) -> &'static str {
        match self {
            Envelope::Chat(_) => MSG_TYPE_CHAT,
            Envelope::DataSnippet(_) => MSG_TYPE_DATA_SNIPPET,
            Envelope::FileMetadata(_) => MSG_TYPE_FILE_METADATA,
            Envelope::FileApprove(_) => MSG_TYPE_FILE_APPROVE,
            Envelope::FileReject(_) => MSG_TYPE_FILE_REJECT,
            Envelope::FileChunk(_) => MSG_TYPE_FILE_CHUNK,
        }
    }
}

/// Reasons an incoming frame is dropped
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

/// Untyped envelope, used to tell unknown types from malformed payloads
#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

const KNOWN_TYPES: [&str; 6] = [
    MSG_TYPE_CHAT,
    MSG_TYPE_DATA_SNIPPET,
    MSG_TYPE_FILE_METADATA,
    MSG_TYPE_FILE_APPROVE,
    MSG_TYPE_FILE_REJECT,
    MSG_TYPE_FILE_CHUNK,
];

/// Encode a message to its text frame
pub fn encode_envelope(envelope: &Envelope) -> Result<String, serde_json::Error> {
    serde_json::to_string(envelope)
}

/// Parse a text frame
pub fn parse_frame(text: &str) -> Result<Envelope, FrameError> {
    let raw: RawFrame =
        serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;
    if !KNOWN_TYPES.contains(&raw.kind.as_str()) {
        return Err(FrameError::UnknownType(raw.kind));
    }
    let tagged = serde_json::json!({ "type": raw.kind, "payload": raw.payload });
    serde_json::from_value(tagged).map_err(|e| FrameError::Malformed(e.to_string()))
}

/// Number of chunks a file of `size` bytes is split into
///
/// A zero-byte file still travels as one empty chunk.
pub fn chunk_count(size: u64, chunk_size: usize) -> u64 {
    let chunk_size = chunk_size.max(1) as u64;
    if size == 0 {
        1
    } else {
        size.div_ceil(chunk_size)
    }
}

/// Byte range of chunk `index` within a file of `size` bytes
pub fn chunk_range(index: u64, size: u64, chunk_size: usize) -> (u64, u64) {
    let chunk_size = chunk_size.max(1) as u64;
    let start = (index * chunk_size).min(size);
    let end = (start + chunk_size).min(size);
    (start, end)
}
