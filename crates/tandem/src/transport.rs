//! Collaborator abstractions
//!
//! Defines traits for the signaling service and the connectivity substrate
//! so that the session logic runs unchanged over real (relay + WebRTC) and
//! mock implementations.

use async_trait::async_trait;
use futures::Stream;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{
    IceCandidate, PeerId, PresenceRecord, SessionDescription, SignalingMessage, SignalingState,
    TransportState,
};

/// Errors from collaborator operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Negotiation failed: {0}")]
    Negotiation(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Disconnected")]
    Disconnected,
    #[error("Not connected")]
    NotConnected,
}

/// Live set of presence records for a session, keyed by peer id
pub type PresenceSet = BTreeMap<PeerId, PresenceRecord>;

/// Receiving end of a signaling or presence subscription
///
/// Dropping the subscription (or calling [`Subscription::unsubscribe`])
/// detaches it from the service.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx }
    }

    /// Next delivery, or `None` once the service side is gone
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Non-blocking receive
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(mut self) {
        self.rx.close();
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

/// Append-only signaling log plus ephemeral presence, scoped by session key
#[async_trait]
pub trait SignalingService: Send + Sync {
    /// Append a message to the session log
    async fn publish(&self, session_key: &str, msg: SignalingMessage) -> Result<(), TransportError>;

    /// Every past and future message of the session, in publish order
    async fn subscribe(
        &self,
        session_key: &str,
    ) -> Result<Subscription<SignalingMessage>, TransportError>;

    /// Write the presence record for a peer
    async fn set_presence(
        &self,
        session_key: &str,
        peer_id: &str,
        record: PresenceRecord,
    ) -> Result<(), TransportError>;

    /// Remove the presence record for a peer
    async fn remove_presence(&self, session_key: &str, peer_id: &str) -> Result<(), TransportError>;

    /// Full presence set, delivered on subscribe and on every change
    async fn subscribe_presence(
        &self,
        session_key: &str,
    ) -> Result<Subscription<PresenceSet>, TransportError>;
}

/// Events raised by the connectivity substrate and its data channels
///
/// These are delivered into the owning session's event loop.
pub enum PeerEvent {
    /// Local description needs (re)negotiation
    NegotiationNeeded,
    /// Local ICE candidate discovered
    LocalCandidate(IceCandidate),
    /// Connectivity changed
    TransportState(TransportState),
    /// Remote side created a data channel
    DataChannel(Arc<dyn DataChannel>),
    /// Data channel became usable
    ChannelOpen { label: String },
    /// Text frame received on the data channel
    ChannelMessage { label: String, text: String },
    /// Data channel closed
    ChannelClose { label: String },
    /// Data channel error
    ChannelError { label: String, error: String },
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::NegotiationNeeded => write!(f, "NegotiationNeeded"),
            PeerEvent::LocalCandidate(c) => write!(f, "LocalCandidate({})", c.candidate),
            PeerEvent::TransportState(s) => write!(f, "TransportState({:?})", s),
            PeerEvent::DataChannel(dc) => write!(f, "DataChannel({})", dc.label()),
            PeerEvent::ChannelOpen { label } => write!(f, "ChannelOpen({})", label),
            PeerEvent::ChannelMessage { label, text } => {
                write!(f, "ChannelMessage({}, {} bytes)", label, text.len())
            }
            PeerEvent::ChannelClose { label } => write!(f, "ChannelClose({})", label),
            PeerEvent::ChannelError { label, error } => {
                write!(f, "ChannelError({}, {})", label, error)
            }
        }
    }
}

/// Sender half that collaborators use to feed events to a session
pub type PeerEventTx = mpsc::UnboundedSender<PeerEvent>;

/// Ordered, reliable, message-oriented channel to the remote peer
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    /// Send a text frame
    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    /// Check if the channel is open
    fn is_open(&self) -> bool;

    /// Close the channel
    async fn close(&self);
}

/// Connectivity substrate for one peer connection
///
/// Mirrors the native RTCPeerConnection capabilities the negotiation engine
/// drives; it is not reimplemented here.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create a data channel; raises `NegotiationNeeded`
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    /// Apply a local description (offer, answer or rollback)
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Restart ICE; raises `NegotiationNeeded`
    async fn restart_ice(&self) -> Result<(), TransportError>;

    fn signaling_state(&self) -> SignalingState;

    async fn close(&self);
}

/// Factory for peer connections
///
/// Each session creates exactly one connection and owns it for its lifetime.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        local_peer_id: &str,
        events: PeerEventTx,
    ) -> Result<Arc<dyn PeerConnection>, TransportError>;
}
