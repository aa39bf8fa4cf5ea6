//! WebRTC connectivity substrate
//!
//! Wraps the webrtc crate behind [`PeerConnectionFactory`]. Every callback
//! the native connection raises is forwarded into the owning session as a
//! [`PeerEvent`]; the session never touches webrtc types directly.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::transport::{
    DataChannel, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventTx, TransportError,
};
use crate::types::{IceCandidate, SdpType, SessionDescription, SignalingState, TransportState};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

fn failed(e: webrtc::Error) -> TransportError {
    TransportError::ConnectionFailed(e.to_string())
}

fn refused(e: webrtc::Error) -> TransportError {
    TransportError::Negotiation(e.to_string())
}

/// Native data channel; frames and lifecycle arrive as session events
struct RealDataChannel {
    label: String,
    dc: Arc<RTCDataChannel>,
}

impl RealDataChannel {
    fn wire(dc: Arc<RTCDataChannel>, events: PeerEventTx) -> Arc<Self> {
        let label = dc.label().to_string();

        let tx = events.clone();
        let l = label.clone();
        dc.on_open(Box::new(move || {
            let _ = tx.send(PeerEvent::ChannelOpen { label: l.clone() });
            Box::pin(async {})
        }));

        let tx = events.clone();
        let l = label.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        let _ = tx.send(PeerEvent::ChannelMessage {
                            label: l.clone(),
                            text,
                        });
                    }
                    Err(_) => warn!("[WebRTC] dropping non-UTF-8 text frame on '{}'", l),
                }
            } else {
                warn!("[WebRTC] dropping binary frame on '{}'", l);
            }
            Box::pin(async {})
        }));

        let tx = events.clone();
        let l = label.clone();
        dc.on_close(Box::new(move || {
            let _ = tx.send(PeerEvent::ChannelClose { label: l.clone() });
            Box::pin(async {})
        }));

        let tx = events;
        let l = label.clone();
        dc.on_error(Box::new(move |e: webrtc::Error| {
            let _ = tx.send(PeerEvent::ChannelError {
                label: l.clone(),
                error: e.to_string(),
            });
            Box::pin(async {})
        }));

        Arc::new(Self { label, dc })
    }
}

#[async_trait]
impl DataChannel for RealDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn close(&self) {
        let _ = self.dc.close().await;
    }
}

/// Native peer connection
pub struct RealPeerConnection {
    pc: Arc<RTCPeerConnection>,
    events: PeerEventTx,
    /// Candidates that arrived before the remote description
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    ice_restart: AtomicBool,
}

impl RealPeerConnection {
    fn wire(pc: &Arc<RTCPeerConnection>, events: &PeerEventTx) {
        let tx = events.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let _ = tx.send(PeerEvent::NegotiationNeeded);
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(json) => {
                        let _ = tx.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_m_line_index: json.sdp_mline_index,
                        }));
                    }
                    Err(e) => warn!("[WebRTC] cannot serialize local candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            debug!("[WebRTC] connection state: {:?}", s);
            let state = match s {
                RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                    Some(TransportState::New)
                }
                RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
                RTCPeerConnectionState::Connected => Some(TransportState::Connected),
                RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
                RTCPeerConnectionState::Failed => Some(TransportState::Failed),
                RTCPeerConnectionState::Closed => Some(TransportState::Closed),
            };
            if let Some(state) = state {
                let _ = tx.send(PeerEvent::TransportState(state));
            }
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            debug!("[WebRTC] remote opened data channel '{}'", dc.label());
            let channel = RealDataChannel::wire(dc, tx.clone());
            let _ = tx.send(PeerEvent::DataChannel(channel));
            Box::pin(async {})
        }));
    }

    async fn flush_pending_candidates(&self) -> Result<(), TransportError> {
        let pending = std::mem::take(&mut *self.pending_candidates.lock().await);
        for init in pending {
            self.pc
                .add_ice_candidate(init)
                .await
                .map_err(|e| TransportError::InvalidInput(e.to_string()))?;
        }
        Ok(())
    }
}

fn to_native(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpType::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            return Ok(rollback);
        }
    };
    parsed.map_err(|e| TransportError::InvalidInput(e.to_string()))
}

#[async_trait]
impl PeerConnection for RealPeerConnection {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        // Default init: ordered and reliable
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(failed)?;
        let channel: Arc<dyn DataChannel> = RealDataChannel::wire(dc, self.events.clone());
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let options = if self.ice_restart.swap(false, Ordering::AcqRel) {
            Some(RTCOfferOptions {
                ice_restart: true,
                ..Default::default()
            })
        } else {
            None
        };
        let offer = self.pc.create_offer(options).await.map_err(refused)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(refused)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let native = to_native(desc)?;
        self.pc.set_local_description(native).await.map_err(refused)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let native = to_native(desc)?;
        self.pc
            .set_remote_description(native)
            .await
            .map_err(refused)?;
        self.flush_pending_candidates().await
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            ..Default::default()
        };
        if self.pc.remote_description().await.is_none() {
            debug!("[WebRTC] queueing candidate until remote description is set");
            self.pending_candidates.lock().await.push(init);
            return Ok(());
        }
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::InvalidInput(e.to_string()))
    }

    async fn restart_ice(&self) -> Result<(), TransportError> {
        self.ice_restart.store(true, Ordering::Release);
        let _ = self.events.send(PeerEvent::NegotiationNeeded);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
        }
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("[WebRTC] close failed: {}", e);
        }
    }
}

/// Factory producing native WebRTC connections
pub struct RealConnectionFactory {
    stun_servers: Vec<String>,
}

impl RealConnectionFactory {
    pub fn new(stun_servers: Vec<String>) -> Self {
        Self { stun_servers }
    }
}

#[async_trait]
impl PeerConnectionFactory for RealConnectionFactory {
    async fn create(
        &self,
        local_peer_id: &str,
        events: PeerEventTx,
    ) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(failed)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(failed)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.stun_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(failed)?);
        RealPeerConnection::wire(&pc, &events);
        debug!("[WebRTC] created peer connection for {}", local_peer_id);

        let conn: Arc<dyn PeerConnection> = Arc::new(RealPeerConnection {
            pc,
            events,
            pending_candidates: Mutex::new(Vec::new()),
            ice_restart: AtomicBool::new(false),
        });
        Ok(conn)
    }
}
