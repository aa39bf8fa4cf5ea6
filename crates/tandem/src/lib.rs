//! Two-peer WebRTC sessions for tandem
//!
//! This crate pairs two peers under a shared session key, negotiates a
//! single data channel between them, and runs a small application protocol
//! (chat, code snippets, chunked file transfer) over it.
//!
//! # Overview
//!
//! - **Signaling**: append-only per-session log plus presence records, behind
//!   the [`SignalingService`] trait
//! - **Roles**: the lexicographically smallest peer id is impolite and opens
//!   the data channel
//! - **Negotiation**: perfect negotiation; glare resolves to one offer
//! - **Transfer**: offer/approve/reject handshake, then ordered 64 KiB base64
//!   chunks
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tandem::{MemoryPersistence, MemorySignaling, MockNetwork, Session, SessionOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let signaling = MemorySignaling::new();
//!     let network = MockNetwork::new();
//!
//!     let (handle, mut events) = Session::connect(
//!         SessionOptions::new("abc123", "peer-a"),
//!         signaling,
//!         Arc::new(network.factory()),
//!         Arc::new(MemoryPersistence::new()),
//!     )
//!     .await?;
//!
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     handle.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod error;
pub mod mock;
pub mod negotiation;
pub mod persist;
pub mod protocol;
#[cfg(feature = "webrtc")]
pub mod real_factory;
pub mod role;
pub mod router;
pub mod session;
pub mod signaling;
pub mod transfer;
pub mod transport;
pub mod types;

pub use channel::{ChannelStats, DataChannelTransport};
pub use error::SessionError;
pub use mock::{MemorySignaling, MockConnectionFactory, MockFault, MockNetwork};
pub use negotiation::{NegotiationEngine, NegotiationOutcome, NegotiationPhase};
pub use persist::{DirectoryPersistence, MemoryPersistence, PersistError, Persistence};
pub use protocol::{
    chunk_count, ChatMessage, DataSnippet, Envelope, FileChunk, FileMetadata, FileRef,
};
#[cfg(feature = "webrtc")]
pub use real_factory::RealConnectionFactory;
pub use role::{assign_roles, local_role};
pub use router::{MessageRouter, RouterStats};
pub use session::{
    DisconnectReport, Session, SessionEvent, SessionEvents, SessionHandle, SessionOptions,
    SessionStats,
};
pub use signaling::SignalingChannel;
pub use transfer::{Direction, FileSource, TransferInfo, TransferManager, TransferStatus};
pub use transport::{
    DataChannel, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventTx, PresenceSet,
    SignalingService, Subscription, TransportError,
};
pub use types::{
    ConnectionState, IceCandidate, PeerId, PresenceRecord, Role, SdpType, SessionConfig,
    SessionDescription, SignalingKind, SignalingMessage, SignalingState, TransportState,
    DATA_CHANNEL_LABEL, DEFAULT_CHUNK_DELAY_MS, DEFAULT_CHUNK_SIZE,
};
