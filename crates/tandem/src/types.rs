//! Shared types for tandem sessions
//!
//! Defines the signaling log entries exchanged through the relay, the
//! session descriptions and ICE candidates they carry, presence records,
//! and the state enums the negotiation engine reports.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Peer identifier as it appears in presence records and signaling messages
pub type PeerId = String;

/// Fixed chunk size for file transfer (64 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 65536;

/// Delay between consecutive chunk sends (ms)
pub const DEFAULT_CHUNK_DELAY_MS: u64 = 10;

/// Data channel label
pub const DATA_CHANNEL_LABEL: &str = "tandem";

/// Signaling message kinds appended to the session log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalingKind {
    Offer,
    Answer,
    Candidate,
    Ready,
    Disconnect,
}

impl fmt::Display for SignalingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalingKind::Offer => "offer",
            SignalingKind::Answer => "answer",
            SignalingKind::Candidate => "candidate",
            SignalingKind::Ready => "ready",
            SignalingKind::Disconnect => "disconnect",
        };
        f.write_str(s)
    }
}

/// Entry in the append-only signaling log
///
/// `payload` is a session description for offers and answers, an ICE
/// candidate for candidates, and `null` otherwise. `joinedAt` repeats the
/// sender's presence record so a peer that rejoins under the same id can be
/// told apart from its earlier entries in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessage {
    #[serde(rename = "senderId")]
    pub sender_id: PeerId,
    #[serde(rename = "type")]
    pub kind: SignalingKind,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(rename = "joinedAt", default, skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<u64>,
}

impl SignalingMessage {
    pub fn offer(sender_id: &str, desc: &SessionDescription) -> Self {
        Self::with_payload(sender_id, SignalingKind::Offer, desc)
    }

    pub fn answer(sender_id: &str, desc: &SessionDescription) -> Self {
        Self::with_payload(sender_id, SignalingKind::Answer, desc)
    }

    pub fn candidate(sender_id: &str, candidate: &IceCandidate) -> Self {
        Self::with_payload(sender_id, SignalingKind::Candidate, candidate)
    }

    pub fn ready(sender_id: &str) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            kind: SignalingKind::Ready,
            payload: serde_json::Value::Null,
            joined_at: None,
        }
    }

    pub fn disconnect(sender_id: &str) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            kind: SignalingKind::Disconnect,
            payload: serde_json::Value::Null,
            joined_at: None,
        }
    }

    fn with_payload<T: Serialize>(sender_id: &str, kind: SignalingKind, payload: &T) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            kind,
            // Descriptions and candidates are plain structs; serialization cannot fail
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
            joined_at: None,
        }
    }

    /// Tag the message with the sender's presence `joinedAt`
    pub fn stamped(mut self, joined_at: u64) -> Self {
        self.joined_at = Some(joined_at);
        self
    }

    /// Interpret the payload as a session description
    pub fn description(&self) -> Result<SessionDescription, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Interpret the payload as an ICE candidate
    pub fn ice_candidate(&self) -> Result<IceCandidate, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Check if this message was sent by the given peer
    pub fn is_from(&self, peer_id: &str) -> bool {
        self.sender_id == peer_id
    }
}

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Rollback,
}

/// SDP offer or answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Description that discards an outstanding local offer
    pub fn rollback() -> Self {
        Self {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        }
    }
}

/// ICE candidate for WebRTC connection establishment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
}

/// Presence record, keyed by peer id under the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    /// Epoch millis when the peer joined
    #[serde(rename = "joinedAt")]
    pub joined_at: u64,
}

impl PresenceRecord {
    /// Record for a join happening now
    ///
    /// Stamps are strictly increasing within the process, so a peer that
    /// leaves and rejoins in the same millisecond still gets a new one.
    pub fn now() -> Self {
        static LAST: AtomicU64 = AtomicU64::new(0);
        let now = now_millis();
        let prev = LAST
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        Self {
            joined_at: now.max(prev + 1),
        }
    }
}

/// Negotiation role of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Yields on offer collision
    Polite,
    /// Wins offer collisions; creates the data channel
    Impolite,
}

impl Role {
    pub fn is_polite(self) -> bool {
        self == Role::Polite
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Polite => write!(f, "polite"),
            Role::Impolite => write!(f, "impolite"),
        }
    }
}

/// Authoritative connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Connectivity reported by the substrate (mirrors RTCPeerConnectionState)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Closed,
    Failed,
}

/// Offer/answer state of the substrate (mirrors RTCSignalingState)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Session tuning, usually derived from the TOML config
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bytes per file chunk
    pub chunk_size: usize,
    /// Pause between chunk sends (ms)
    pub chunk_delay_ms: u64,
    /// Label of the negotiated data channel
    pub channel_label: String,
    /// STUN servers handed to the connectivity substrate
    pub stun_servers: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay_ms: DEFAULT_CHUNK_DELAY_MS,
            channel_label: DATA_CHANNEL_LABEL.to_string(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
