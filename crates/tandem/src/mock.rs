//! Mock implementations for testing and local demos
//!
//! Provides an in-memory signaling log and a mock connectivity substrate
//! that pairs in-process data channels instead of using real relays and
//! WebRTC. The substrate follows the RTCPeerConnection offer/answer state
//! rules closely enough to exercise perfect negotiation, including rollback.

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::transport::{
    DataChannel, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventTx, PresenceSet,
    SignalingService, Subscription, TransportError,
};
use crate::types::{
    IceCandidate, PresenceRecord, SdpType, SessionDescription, SignalingMessage, SignalingState,
    TransportState,
};

// ============================================================================
// In-memory signaling log
// ============================================================================

#[derive(Default)]
struct SessionLog {
    messages: Vec<SignalingMessage>,
    subscribers: Vec<mpsc::UnboundedSender<SignalingMessage>>,
    presence: PresenceSet,
    presence_subscribers: Vec<mpsc::UnboundedSender<PresenceSet>>,
}

impl SessionLog {
    fn broadcast_presence(&mut self) {
        let snapshot = self.presence.clone();
        self.presence_subscribers
            .retain(|tx| tx.send(snapshot.clone()).is_ok());
    }
}

/// Append-only signaling log held in memory, shared by every peer of a test
pub struct MemorySignaling {
    sessions: RwLock<HashMap<String, SessionLog>>,
    online: AtomicBool,
}

impl MemorySignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulate losing the relay connection; every operation fails while offline
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }

    /// Snapshot of the session log
    pub async fn messages(&self, session_key: &str) -> Vec<SignalingMessage> {
        self.sessions
            .read()
            .await
            .get(session_key)
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }

    /// Snapshot of the session presence set
    pub async fn presence(&self, session_key: &str) -> PresenceSet {
        self.sessions
            .read()
            .await
            .get(session_key)
            .map(|s| s.presence.clone())
            .unwrap_or_default()
    }

    fn check_online(&self) -> Result<(), TransportError> {
        if self.online.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

impl Default for MemorySignaling {
    fn default() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            online: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl SignalingService for MemorySignaling {
    async fn publish(&self, session_key: &str, msg: SignalingMessage) -> Result<(), TransportError> {
        self.check_online()?;
        let mut sessions = self.sessions.write().await;
        let log = sessions.entry(session_key.to_string()).or_default();
        log.messages.push(msg.clone());
        // Closed subscriptions are pruned on delivery
        log.subscribers.retain(|tx| tx.send(msg.clone()).is_ok());
        Ok(())
    }

    async fn subscribe(
        &self,
        session_key: &str,
    ) -> Result<Subscription<SignalingMessage>, TransportError> {
        self.check_online()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sessions = self.sessions.write().await;
        let log = sessions.entry(session_key.to_string()).or_default();
        // Replay history first; the write lock keeps it ordered before live deliveries
        for msg in &log.messages {
            let _ = tx.send(msg.clone());
        }
        log.subscribers.push(tx);
        Ok(Subscription::new(rx))
    }

    async fn set_presence(
        &self,
        session_key: &str,
        peer_id: &str,
        record: PresenceRecord,
    ) -> Result<(), TransportError> {
        self.check_online()?;
        let mut sessions = self.sessions.write().await;
        let log = sessions.entry(session_key.to_string()).or_default();
        log.presence.insert(peer_id.to_string(), record);
        log.broadcast_presence();
        Ok(())
    }

    async fn remove_presence(&self, session_key: &str, peer_id: &str) -> Result<(), TransportError> {
        self.check_online()?;
        let mut sessions = self.sessions.write().await;
        if let Some(log) = sessions.get_mut(session_key) {
            if log.presence.remove(peer_id).is_some() {
                log.broadcast_presence();
            }
        }
        Ok(())
    }

    async fn subscribe_presence(
        &self,
        session_key: &str,
    ) -> Result<Subscription<PresenceSet>, TransportError> {
        self.check_online()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sessions = self.sessions.write().await;
        let log = sessions.entry(session_key.to_string()).or_default();
        let _ = tx.send(log.presence.clone());
        log.presence_subscribers.push(tx);
        Ok(Subscription::new(rx))
    }
}

// ============================================================================
// Mock Data Channel
// ============================================================================

struct RemoteEnd {
    events: PeerEventTx,
    channel: Weak<MockDataChannel>,
}

/// In-process data channel; frames are delivered as events to the remote session
pub struct MockDataChannel {
    label: String,
    owner: String,
    network: Weak<MockNetwork>,
    open: AtomicBool,
    local_events: PeerEventTx,
    remote: Mutex<Option<RemoteEnd>>,
    frames_sent: AtomicU64,
}

impl MockDataChannel {
    fn new(label: &str, conn: &MockPeerConnection) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            owner: conn.peer_id.clone(),
            network: Arc::downgrade(&conn.network),
            open: AtomicBool::new(false),
            local_events: conn.events.clone(),
            remote: Mutex::new(None),
            frames_sent: AtomicU64::new(0),
        })
    }

    /// Connect two channel ends and raise `ChannelOpen` on both sides
    fn pair(a: &Arc<Self>, b: &Arc<Self>) {
        if let Ok(mut remote) = a.remote.lock() {
            *remote = Some(RemoteEnd {
                events: b.local_events.clone(),
                channel: Arc::downgrade(b),
            });
        }
        if let Ok(mut remote) = b.remote.lock() {
            *remote = Some(RemoteEnd {
                events: a.local_events.clone(),
                channel: Arc::downgrade(a),
            });
        }
        for end in [a, b] {
            end.open.store(true, Ordering::Release);
            let _ = end.local_events.send(PeerEvent::ChannelOpen {
                label: end.label.clone(),
            });
        }
    }

    fn is_paired(&self) -> bool {
        self.remote.lock().map(|r| r.is_some()).unwrap_or(false)
    }

    /// Frames sent through this end
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    fn shut(&self) -> bool {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.local_events.send(PeerEvent::ChannelClose {
                label: self.label.clone(),
            });
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        if let Some(network) = self.network.upgrade() {
            if network.take_fault(&self.owner, MockFault::ChannelSend) {
                return Err(TransportError::SendFailed(
                    "injected fault: ChannelSend".into(),
                ));
            }
        }
        let events = self
            .remote
            .lock()
            .ok()
            .and_then(|r| r.as_ref().map(|r| r.events.clone()))
            .ok_or(TransportError::NotConnected)?;
        events
            .send(PeerEvent::ChannelMessage {
                label: self.label.clone(),
                text,
            })
            .map_err(|_| TransportError::Disconnected)?;
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(&self) {
        if self.shut() {
            let remote = self
                .remote
                .lock()
                .ok()
                .and_then(|r| r.as_ref().and_then(|r| r.channel.upgrade()));
            if let Some(remote) = remote {
                remote.shut();
            }
        }
    }
}

// ============================================================================
// Mock Peer Connection
// ============================================================================

/// One-shot failures that can be injected into a peer's substrate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFault {
    CreateOffer,
    CreateAnswer,
    SetRemoteDescription,
    /// Next data channel frame sent by the peer
    ChannelSend,
}

struct ConnState {
    signaling: SignalingState,
    channels: Vec<Arc<MockDataChannel>>,
    remote_id: Option<u64>,
    remote_candidates: usize,
    ice_generation: u32,
    gathered: u32,
    offer_version: u64,
    linked: bool,
}

/// Mock peer connection following RTCPeerConnection signaling-state rules
pub struct MockPeerConnection {
    id: u64,
    peer_id: String,
    network: Arc<MockNetwork>,
    events: PeerEventTx,
    state: Mutex<ConnState>,
}

const MOCK_SDP_ORIGIN: &str = "tandem-mock";

impl MockPeerConnection {
    fn sdp(&self, version: u64, generation: u32, labels: &[String]) -> String {
        let mut sdp = format!(
            "v=0\r\no={} {} {} IN IP4 127.0.0.1\r\ns=-\r\na=ice-gen:{}\r\n",
            MOCK_SDP_ORIGIN, self.id, version, generation
        );
        for label in labels {
            sdp.push_str(&format!("a=channel:{}\r\n", label));
        }
        sdp
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ConnState) -> T) -> Result<T, TransportError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TransportError::ConnectionFailed("connection state poisoned".into()))?;
        if state.signaling == SignalingState::Closed {
            return Err(TransportError::Disconnected);
        }
        Ok(f(&mut state))
    }

    fn check_fault(&self, fault: MockFault) -> Result<(), TransportError> {
        if self.network.take_fault(&self.peer_id, fault) {
            return Err(TransportError::Negotiation(format!(
                "injected fault: {:?}",
                fault
            )));
        }
        Ok(())
    }

    /// Emit a host candidate each time a local description is applied
    fn gather(&self, state: &mut ConnState) {
        state.gathered += 1;
        let candidate = IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host generation {} ufrag m{}",
                state.gathered,
                40000 + self.id,
                state.ice_generation,
                self.id
            ),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        };
        let _ = self.events.send(PeerEvent::LocalCandidate(candidate));
    }

    fn ready_for(&self, remote_id: u64) -> bool {
        self.state
            .lock()
            .map(|s| {
                s.signaling == SignalingState::Stable
                    && s.remote_id == Some(remote_id)
                    && s.remote_candidates > 0
                    && s.gathered > 0
            })
            .unwrap_or(false)
    }

    /// Link data channels with the remote connection once both sides are ready
    fn try_link(&self) {
        let remote_id = match self.state.lock().ok().and_then(|s| s.remote_id) {
            Some(id) => id,
            None => return,
        };
        if !self.ready_for(remote_id) {
            return;
        }
        let remote = match self.network.connection(remote_id) {
            Some(r) => r,
            None => return,
        };
        if !remote.ready_for(self.id) {
            return;
        }
        self.network.link(self, &remote);
    }

    fn take_unpaired(&self) -> Vec<Arc<MockDataChannel>> {
        self.state
            .lock()
            .map(|s| {
                s.channels
                    .iter()
                    .filter(|c| !c.is_paired())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn adopt(&self, channel: Arc<MockDataChannel>) {
        if let Ok(mut s) = self.state.lock() {
            s.channels.push(channel);
        }
    }

    /// Mark linked; returns true the first time
    fn mark_linked(&self) -> bool {
        self.state
            .lock()
            .map(|mut s| !std::mem::replace(&mut s.linked, true))
            .unwrap_or(false)
    }
}

/// Parse the connection id out of a mock SDP
fn parse_mock_sdp(sdp: &str) -> Result<u64, TransportError> {
    if !sdp.starts_with("v=0") {
        return Err(TransportError::InvalidInput("SDP must start with v=0".into()));
    }
    sdp.lines()
        .find_map(|line| line.strip_prefix("o="))
        .and_then(|origin| {
            let mut parts = origin.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(MOCK_SDP_ORIGIN), Some(id)) => id.parse().ok(),
                _ => None,
            }
        })
        .ok_or_else(|| TransportError::InvalidInput("SDP has no usable origin line".into()))
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        let channel = MockDataChannel::new(label, self);
        self.with_state(|s| s.channels.push(channel.clone()))?;
        let _ = self.events.send(PeerEvent::NegotiationNeeded);
        Ok(channel as Arc<dyn DataChannel>)
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.check_fault(MockFault::CreateOffer)?;
        let (version, generation, labels) = self.with_state(|s| {
            s.offer_version += 1;
            let labels: Vec<String> = s.channels.iter().map(|c| c.label.clone()).collect();
            (s.offer_version, s.ice_generation, labels)
        })?;
        Ok(SessionDescription::offer(self.sdp(version, generation, &labels)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.check_fault(MockFault::CreateAnswer)?;
        let (signaling, version, generation) =
            self.with_state(|s| (s.signaling, s.offer_version, s.ice_generation))?;
        if signaling != SignalingState::HaveRemoteOffer {
            return Err(TransportError::Negotiation(format!(
                "cannot create answer in {:?}",
                signaling
            )));
        }
        Ok(SessionDescription::answer(self.sdp(version, generation, &[])))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let result = self.with_state(|s| match (desc.sdp_type, s.signaling) {
            (SdpType::Offer, SignalingState::Stable) => {
                s.signaling = SignalingState::HaveLocalOffer;
                self.gather(s);
                Ok(())
            }
            (SdpType::Answer, SignalingState::HaveRemoteOffer) => {
                s.signaling = SignalingState::Stable;
                self.gather(s);
                Ok(())
            }
            (SdpType::Rollback, SignalingState::HaveLocalOffer) => {
                s.signaling = SignalingState::Stable;
                Ok(())
            }
            (sdp_type, signaling) => Err(TransportError::Negotiation(format!(
                "cannot apply local {:?} in {:?}",
                sdp_type, signaling
            ))),
        })?;
        result?;
        self.try_link();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.check_fault(MockFault::SetRemoteDescription)?;
        if desc.sdp_type == SdpType::Rollback {
            return Err(TransportError::InvalidInput(
                "rollback is not a remote description".into(),
            ));
        }
        let remote_id = parse_mock_sdp(&desc.sdp)?;
        if self.network.connection(remote_id).is_none() {
            return Err(TransportError::Negotiation(format!(
                "remote connection {} is unknown",
                remote_id
            )));
        }
        let result = self.with_state(|s| match (desc.sdp_type, s.signaling) {
            (SdpType::Offer, SignalingState::Stable) => {
                s.signaling = SignalingState::HaveRemoteOffer;
                s.remote_id = Some(remote_id);
                Ok(())
            }
            (SdpType::Answer, SignalingState::HaveLocalOffer) => {
                s.signaling = SignalingState::Stable;
                s.remote_id = Some(remote_id);
                Ok(())
            }
            (sdp_type, signaling) => Err(TransportError::Negotiation(format!(
                "cannot apply remote {:?} in {:?}",
                sdp_type, signaling
            ))),
        })?;
        result?;
        self.try_link();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        if !candidate.candidate.starts_with("candidate:") {
            return Err(TransportError::InvalidInput(format!(
                "malformed candidate: {}",
                candidate.candidate
            )));
        }
        let result = self.with_state(|s| {
            if s.remote_id.is_none() {
                return Err(TransportError::InvalidInput(
                    "candidate received before remote description".into(),
                ));
            }
            s.remote_candidates += 1;
            Ok(())
        })?;
        result?;
        self.try_link();
        Ok(())
    }

    async fn restart_ice(&self) -> Result<(), TransportError> {
        self.with_state(|s| s.ice_generation += 1)?;
        let _ = self.events.send(PeerEvent::NegotiationNeeded);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state
            .lock()
            .map(|s| s.signaling)
            .unwrap_or(SignalingState::Closed)
    }

    async fn close(&self) {
        let channels = match self.state.lock() {
            Ok(mut s) => {
                s.signaling = SignalingState::Closed;
                std::mem::take(&mut s.channels)
            }
            Err(_) => return,
        };
        join_all(channels.iter().map(|c| c.close())).await;
        debug!("[Mock] connection {} ({}) closed", self.id, self.peer_id);
    }
}

// ============================================================================
// Mock Network
// ============================================================================

#[derive(Default)]
struct NetworkState {
    next_id: u64,
    connections: HashMap<u64, Weak<MockPeerConnection>>,
    faults: HashMap<String, Vec<MockFault>>,
}

/// Shared registry that lets mock connections find and link with each other
#[derive(Default)]
pub struct MockNetwork {
    state: Mutex<NetworkState>,
    link_lock: Mutex<()>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a connection factory attached to this network
    pub fn factory(self: &Arc<Self>) -> MockConnectionFactory {
        MockConnectionFactory {
            network: self.clone(),
        }
    }

    /// Make the next matching operation of `peer_id` fail
    pub fn inject_fault(&self, peer_id: &str, fault: MockFault) {
        if let Ok(mut state) = self.state.lock() {
            state
                .faults
                .entry(peer_id.to_string())
                .or_default()
                .push(fault);
        }
    }

    fn take_fault(&self, peer_id: &str, fault: MockFault) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        match state.faults.get_mut(peer_id) {
            Some(faults) => match faults.iter().position(|f| *f == fault) {
                Some(i) => {
                    faults.remove(i);
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    fn register(self: &Arc<Self>, peer_id: &str, events: PeerEventTx) -> Arc<MockPeerConnection> {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.next_id += 1;
        let conn = Arc::new(MockPeerConnection {
            id: state.next_id,
            peer_id: peer_id.to_string(),
            network: self.clone(),
            events,
            state: Mutex::new(ConnState {
                signaling: SignalingState::Stable,
                channels: Vec::new(),
                remote_id: None,
                remote_candidates: 0,
                ice_generation: 0,
                gathered: 0,
                offer_version: 0,
                linked: false,
            }),
        });
        state.connections.insert(conn.id, Arc::downgrade(&conn));
        conn
    }

    fn connection(&self, id: u64) -> Option<Arc<MockPeerConnection>> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.connections.get(&id).and_then(Weak::upgrade))
    }

    /// Pair unpaired channels across both connections
    fn link(&self, a: &MockPeerConnection, b: &MockPeerConnection) {
        let _guard = self.link_lock.lock();

        let first_link = a.mark_linked() | b.mark_linked();
        if first_link {
            for conn in [a, b] {
                let _ = conn.events.send(PeerEvent::TransportState(TransportState::Connecting));
                let _ = conn.events.send(PeerEvent::TransportState(TransportState::Connected));
            }
            debug!("[Mock] linked connections {} <-> {}", a.id, b.id);
        }

        for (local, remote) in [(a, b), (b, a)] {
            for channel in local.take_unpaired() {
                let counterpart = MockDataChannel::new(&channel.label, remote);
                remote.adopt(counterpart.clone());
                let _ = remote
                    .events
                    .send(PeerEvent::DataChannel(counterpart.clone()));
                MockDataChannel::pair(&channel, &counterpart);
            }
        }
    }
}

/// Mock peer connection factory
///
/// Creates mock connections registered with a shared [`MockNetwork`].
pub struct MockConnectionFactory {
    network: Arc<MockNetwork>,
}

#[async_trait]
impl PeerConnectionFactory for MockConnectionFactory {
    async fn create(
        &self,
        local_peer_id: &str,
        events: PeerEventTx,
    ) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let conn: Arc<dyn PeerConnection> = self.network.register(local_peer_id, events);
        Ok(conn)
    }
}
