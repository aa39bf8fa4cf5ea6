//! Perfect-negotiation state machine
//!
//! Drives offer/answer/candidate exchange over the connectivity substrate and
//! owns the session's authoritative [`ConnectionState`].
//!
//! Collision handling follows the WebRTC "perfect negotiation" pattern:
//! - An offer arriving while we are making one, or while our substrate is not
//!   `stable`, is a collision
//! - The impolite peer ignores the colliding offer (and the stale candidates
//!   that follow it) and waits for an answer to its own
//! - The polite peer rolls back its own offer and answers the remote one
//!
//! Exactly one offer survives any simultaneous-offer race.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{negotiation_error, SessionError};
use crate::signaling::SignalingChannel;
use crate::transport::{PeerConnection, TransportError};
use crate::types::{
    ConnectionState, IceCandidate, Role, SdpType, SessionDescription, SignalingState,
    TransportState,
};

/// Negotiation phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    /// Nothing negotiated yet
    Idle,
    /// Creating and applying a local offer
    MakingOffer,
    /// Local offer published, waiting for the answer
    HaveLocalOffer,
    /// Remote offer applied, answer in progress
    HaveRemoteOffer,
    /// Descriptions agreed, data channel not open
    Stable,
    /// Data channel open
    Connected,
    /// Terminal; requires teardown and a fresh connect
    Failed,
}

/// What a negotiation input did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationOutcome {
    /// Offer created and published
    OfferSent,
    /// Trigger suppressed (offer already in flight, not stable, or failed)
    Skipped,
    /// Remote offer answered; `rolled_back` when our own offer was discarded first
    AcceptedOffer { rolled_back: bool },
    /// Colliding remote offer discarded (impolite side)
    IgnoredOffer,
    /// Answer to our offer applied
    AppliedAnswer,
    /// Answer arrived with no offer outstanding
    StaleAnswer,
    CandidateApplied,
    /// Candidate dropped because it belonged to an ignored offer
    CandidateIgnored,
}

pub struct NegotiationEngine {
    role: Role,
    pc: Arc<dyn PeerConnection>,
    phase: NegotiationPhase,
    ignore_offer: bool,
    negotiated: bool,
    channel_open: bool,
    state_tx: watch::Sender<ConnectionState>,
}

impl NegotiationEngine {
    pub fn new(role: Role, pc: Arc<dyn PeerConnection>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            role,
            pc,
            phase: NegotiationPhase::Idle,
            ignore_offer: false,
            negotiated: false,
            channel_open: false,
            state_tx,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Roles may change while presence settles, before the first offer
    pub fn set_role(&mut self, role: Role) {
        if role != self.role {
            debug!("[Negotiation] role {} -> {}", self.role, role);
            self.role = role;
        }
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Observe connection state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_failed(&self) -> bool {
        self.phase == NegotiationPhase::Failed
    }

    pub fn peer_connection(&self) -> &Arc<dyn PeerConnection> {
        &self.pc
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            info!("[Negotiation] connection state: {}", state);
        }
    }

    fn begin_connecting(&self) {
        if self.state() == ConnectionState::Disconnected {
            self.set_state(ConnectionState::Connecting);
        }
    }

    /// Recompute the phase from the substrate after a step completes
    fn settle(&mut self) {
        if self.is_failed() {
            return;
        }
        self.phase = match self.pc.signaling_state() {
            SignalingState::HaveLocalOffer => NegotiationPhase::HaveLocalOffer,
            SignalingState::HaveRemoteOffer => NegotiationPhase::HaveRemoteOffer,
            SignalingState::Stable if self.channel_open => NegotiationPhase::Connected,
            SignalingState::Stable if self.negotiated => NegotiationPhase::Stable,
            SignalingState::Stable => NegotiationPhase::Idle,
            SignalingState::Closed => NegotiationPhase::Idle,
        };
    }

    /// Record a failure; terminal errors move the engine to `Failed`
    fn fail(&mut self, err: SessionError) -> SessionError {
        if err.is_terminal() {
            warn!("[Negotiation] terminal failure: {}", err);
            self.phase = NegotiationPhase::Failed;
            self.set_state(ConnectionState::Failed);
        } else {
            self.settle();
        }
        err
    }

    fn substrate_failure(&mut self, e: TransportError) -> SessionError {
        self.fail(negotiation_error(e))
    }

    /// Negotiation trigger (data channel created, ICE restart)
    pub async fn on_negotiation_needed(
        &mut self,
        signaling: &SignalingChannel,
    ) -> Result<NegotiationOutcome, SessionError> {
        if self.is_failed() {
            return Ok(NegotiationOutcome::Skipped);
        }
        if self.phase == NegotiationPhase::MakingOffer
            || self.pc.signaling_state() != SignalingState::Stable
        {
            debug!(
                "[Negotiation] negotiation needed while {:?}; skipping",
                self.phase
            );
            return Ok(NegotiationOutcome::Skipped);
        }

        self.phase = NegotiationPhase::MakingOffer;
        self.begin_connecting();

        let offer = match self.pc.create_offer().await {
            Ok(offer) => offer,
            Err(e) => return Err(self.substrate_failure(e)),
        };
        if let Err(e) = self.pc.set_local_description(offer.clone()).await {
            return Err(self.substrate_failure(e));
        }
        self.settle();

        if let Err(e) = signaling.publish_offer(&offer).await {
            return Err(self.fail(e));
        }
        debug!("[Negotiation] offer sent ({})", self.role);
        Ok(NegotiationOutcome::OfferSent)
    }

    /// Remote offer or answer from the signaling log
    pub async fn on_remote_description(
        &mut self,
        desc: SessionDescription,
        signaling: &SignalingChannel,
    ) -> Result<NegotiationOutcome, SessionError> {
        if self.is_failed() {
            return Ok(NegotiationOutcome::Skipped);
        }
        match desc.sdp_type {
            SdpType::Offer => self.accept_offer(desc, signaling).await,
            SdpType::Answer => self.apply_answer(desc).await,
            SdpType::Rollback => Err(SessionError::InvalidInput(
                "rollback is not a remote description".into(),
            )),
        }
    }

    async fn accept_offer(
        &mut self,
        offer: SessionDescription,
        signaling: &SignalingChannel,
    ) -> Result<NegotiationOutcome, SessionError> {
        let collision = self.phase == NegotiationPhase::MakingOffer
            || self.pc.signaling_state() != SignalingState::Stable;

        self.ignore_offer = !self.role.is_polite() && collision;
        if self.ignore_offer {
            warn!("[Negotiation] offer collision; impolite, ignoring remote offer");
            return Ok(NegotiationOutcome::IgnoredOffer);
        }

        if collision {
            info!("[Negotiation] offer collision; polite, rolling back local offer");
            if let Err(e) = self
                .pc
                .set_local_description(SessionDescription::rollback())
                .await
            {
                return Err(self.substrate_failure(e));
            }
        }

        if let Err(e) = self.pc.set_remote_description(offer).await {
            let err = self.substrate_failure(e);
            if collision && !self.is_failed() {
                // Our rolled-back offer is gone and the remote one never applied
                warn!(
                    "[Negotiation] remote offer refused after rollback ({}); re-offering",
                    err
                );
                self.on_negotiation_needed(signaling).await?;
            }
            return Err(err);
        }
        self.phase = NegotiationPhase::HaveRemoteOffer;
        self.begin_connecting();

        let answer = match self.pc.create_answer().await {
            Ok(answer) => answer,
            Err(e) => return Err(self.substrate_failure(e)),
        };
        if let Err(e) = self.pc.set_local_description(answer.clone()).await {
            return Err(self.substrate_failure(e));
        }
        self.negotiated = true;
        self.settle();

        if let Err(e) = signaling.publish_answer(&answer).await {
            return Err(self.fail(e));
        }
        debug!("[Negotiation] answer sent");
        Ok(NegotiationOutcome::AcceptedOffer {
            rolled_back: collision,
        })
    }

    async fn apply_answer(
        &mut self,
        answer: SessionDescription,
    ) -> Result<NegotiationOutcome, SessionError> {
        if self.pc.signaling_state() != SignalingState::HaveLocalOffer {
            warn!(
                "[Negotiation] answer received in {:?} with no offer outstanding; dropping",
                self.phase
            );
            return Ok(NegotiationOutcome::StaleAnswer);
        }
        if let Err(e) = self.pc.set_remote_description(answer).await {
            return Err(self.substrate_failure(e));
        }
        self.negotiated = true;
        self.settle();
        debug!("[Negotiation] answer applied");
        Ok(NegotiationOutcome::AppliedAnswer)
    }

    /// Remote ICE candidate from the signaling log
    pub async fn on_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<NegotiationOutcome, SessionError> {
        if self.is_failed() {
            return Ok(NegotiationOutcome::Skipped);
        }
        match self.pc.add_ice_candidate(candidate).await {
            Ok(()) => Ok(NegotiationOutcome::CandidateApplied),
            Err(e) if self.ignore_offer => {
                debug!("[Negotiation] dropping candidate of ignored offer: {}", e);
                Ok(NegotiationOutcome::CandidateIgnored)
            }
            Err(e) => Err(SessionError::InvalidInput(e.to_string())),
        }
    }

    /// Connectivity change reported by the substrate
    pub fn on_transport_state(&mut self, state: TransportState) {
        if self.is_failed() {
            return;
        }
        debug!("[Negotiation] transport state: {:?}", state);
        match state {
            TransportState::New => {}
            TransportState::Connecting => self.set_state(ConnectionState::Connecting),
            // The data path must be usable before the session counts as connected
            TransportState::Connected if self.channel_open => {
                self.set_state(ConnectionState::Connected)
            }
            TransportState::Connected => self.set_state(ConnectionState::Connecting),
            TransportState::Disconnected | TransportState::Closed => {
                self.channel_open = false;
                self.settle();
                self.set_state(ConnectionState::Disconnected);
            }
            TransportState::Failed => {
                self.phase = NegotiationPhase::Failed;
                self.set_state(ConnectionState::Failed);
            }
        }
    }

    pub fn on_channel_open(&mut self) {
        if self.is_failed() {
            return;
        }
        self.channel_open = true;
        self.settle();
        self.set_state(ConnectionState::Connected);
    }

    pub fn on_channel_close(&mut self) {
        if self.is_failed() {
            return;
        }
        self.channel_open = false;
        self.settle();
        self.set_state(ConnectionState::Disconnected);
    }

    pub fn on_channel_error(&mut self, error: &str) {
        if self.is_failed() {
            return;
        }
        warn!("[Negotiation] data channel error: {}", error);
        self.channel_open = false;
        self.phase = NegotiationPhase::Failed;
        self.set_state(ConnectionState::Failed);
    }

    /// Terminal failure raised outside negotiation (signaling loss)
    pub fn on_terminal_error(&mut self, err: &SessionError) {
        if err.is_terminal() {
            self.phase = NegotiationPhase::Failed;
            self.set_state(ConnectionState::Failed);
        }
    }

    /// Close the substrate; the session is torn down afterwards
    pub async fn shutdown(&mut self) {
        self.pc.close().await;
        self.channel_open = false;
        self.ignore_offer = false;
        self.phase = NegotiationPhase::Idle;
        self.set_state(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MemorySignaling, MockFault, MockNetwork};
    use crate::transport::{PeerConnectionFactory, PeerEvent};
    use crate::types::{SignalingKind, SignalingMessage};
    use tokio::sync::mpsc;

    struct Side {
        engine: NegotiationEngine,
        signaling: SignalingChannel,
        events: mpsc::UnboundedReceiver<PeerEvent>,
    }

    impl Side {
        async fn new(
            network: &Arc<MockNetwork>,
            service: &Arc<MemorySignaling>,
            peer_id: &str,
            role: Role,
        ) -> Self {
            let (tx, events) = mpsc::unbounded_channel();
            let pc = network.factory().create(peer_id, tx).await.unwrap();
            Self {
                engine: NegotiationEngine::new(role, pc),
                signaling: SignalingChannel::new(service.clone(), "abc123", peer_id),
                events,
            }
        }

        fn candidates(&mut self) -> Vec<IceCandidate> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                if let PeerEvent::LocalCandidate(c) = event {
                    out.push(c);
                }
            }
            out
        }

        /// Feed channel/transport events into the engine
        fn pump(&mut self) {
            while let Ok(event) = self.events.try_recv() {
                match event {
                    PeerEvent::TransportState(s) => self.engine.on_transport_state(s),
                    PeerEvent::ChannelOpen { .. } => self.engine.on_channel_open(),
                    PeerEvent::ChannelClose { .. } => self.engine.on_channel_close(),
                    _ => {}
                }
            }
        }
    }

    fn last_of(log: &[SignalingMessage], sender: &str, kind: SignalingKind) -> SessionDescription {
        log.iter()
            .rev()
            .find(|m| m.sender_id == sender && m.kind == kind)
            .and_then(|m| m.description().ok())
            .expect("description in log")
    }

    async fn exchange_candidates(a: &mut Side, b: &mut Side) {
        for c in a.candidates() {
            b.engine.on_remote_candidate(c).await.unwrap();
        }
        for c in b.candidates() {
            a.engine.on_remote_candidate(c).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_offer_answer_reaches_connected() {
        let network = MockNetwork::new();
        let service = MemorySignaling::new();
        let mut a = Side::new(&network, &service, "peer-a", Role::Impolite).await;
        let mut b = Side::new(&network, &service, "peer-b", Role::Polite).await;

        a.engine
            .peer_connection()
            .create_data_channel("tandem")
            .await
            .unwrap();
        let outcome = a.engine.on_negotiation_needed(&a.signaling).await.unwrap();
        assert_eq!(outcome, NegotiationOutcome::OfferSent);
        assert_eq!(a.engine.phase(), NegotiationPhase::HaveLocalOffer);
        assert_eq!(a.engine.state(), ConnectionState::Connecting);

        let log = service.messages("abc123").await;
        let offer = last_of(&log, "peer-a", SignalingKind::Offer);
        let outcome = b
            .engine
            .on_remote_description(offer, &b.signaling)
            .await
            .unwrap();
        assert_eq!(outcome, NegotiationOutcome::AcceptedOffer { rolled_back: false });

        let log = service.messages("abc123").await;
        let answer = last_of(&log, "peer-b", SignalingKind::Answer);
        let outcome = a
            .engine
            .on_remote_description(answer, &a.signaling)
            .await
            .unwrap();
        assert_eq!(outcome, NegotiationOutcome::AppliedAnswer);
        assert_eq!(a.engine.phase(), NegotiationPhase::Stable);

        exchange_candidates(&mut a, &mut b).await;
        a.pump();
        b.pump();

        assert_eq!(a.engine.state(), ConnectionState::Connected);
        assert_eq!(b.engine.state(), ConnectionState::Connected);
        assert_eq!(a.engine.phase(), NegotiationPhase::Connected);
    }

    #[tokio::test]
    async fn test_glare_converges_to_one_offer() {
        let network = MockNetwork::new();
        let service = MemorySignaling::new();
        let mut a = Side::new(&network, &service, "peer-a", Role::Impolite).await;
        let mut b = Side::new(&network, &service, "peer-b", Role::Polite).await;

        a.engine
            .peer_connection()
            .create_data_channel("tandem")
            .await
            .unwrap();

        // Both sides offer before seeing each other's offer
        a.engine.on_negotiation_needed(&a.signaling).await.unwrap();
        b.engine.on_negotiation_needed(&b.signaling).await.unwrap();

        let log = service.messages("abc123").await;
        let offer_a = last_of(&log, "peer-a", SignalingKind::Offer);
        let offer_b = last_of(&log, "peer-b", SignalingKind::Offer);

        let outcome_a = a
            .engine
            .on_remote_description(offer_b, &a.signaling)
            .await
            .unwrap();
        assert_eq!(outcome_a, NegotiationOutcome::IgnoredOffer);
        assert!(!a.engine.is_failed());

        let outcome_b = b
            .engine
            .on_remote_description(offer_a, &b.signaling)
            .await
            .unwrap();
        assert_eq!(outcome_b, NegotiationOutcome::AcceptedOffer { rolled_back: true });

        let log = service.messages("abc123").await;
        let answers: Vec<_> = log
            .iter()
            .filter(|m| m.kind == SignalingKind::Answer)
            .collect();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].sender_id, "peer-b");

        let answer = last_of(&log, "peer-b", SignalingKind::Answer);
        assert_eq!(
            a.engine
                .on_remote_description(answer, &a.signaling)
                .await
                .unwrap(),
            NegotiationOutcome::AppliedAnswer
        );

        exchange_candidates(&mut a, &mut b).await;

        // Exactly one data channel reaches the polite side
        let mut channels = 0;
        let mut opened = false;
        while let Ok(event) = b.events.try_recv() {
            match event {
                PeerEvent::DataChannel(_) => channels += 1,
                PeerEvent::ChannelOpen { .. } => {
                    opened = true;
                    b.engine.on_channel_open();
                }
                _ => {}
            }
        }
        a.pump();
        assert_eq!(channels, 1);
        assert!(opened);
        assert_eq!(a.engine.state(), ConnectionState::Connected);
        assert_eq!(b.engine.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_ignored_offer_candidates_are_swallowed() {
        let network = MockNetwork::new();
        let service = MemorySignaling::new();
        let mut a = Side::new(&network, &service, "peer-a", Role::Impolite).await;
        let mut b = Side::new(&network, &service, "peer-b", Role::Polite).await;

        a.engine.on_negotiation_needed(&a.signaling).await.unwrap();
        b.engine.on_negotiation_needed(&b.signaling).await.unwrap();
        let log = service.messages("abc123").await;
        let offer_b = last_of(&log, "peer-b", SignalingKind::Offer);
        a.engine
            .on_remote_description(offer_b, &a.signaling)
            .await
            .unwrap();

        // A has no remote description yet, so B's candidate cannot apply
        let stale = b.candidates().pop().unwrap();
        let outcome = a.engine.on_remote_candidate(stale).await.unwrap();
        assert_eq!(outcome, NegotiationOutcome::CandidateIgnored);
    }

    #[tokio::test]
    async fn test_duplicate_trigger_is_noop() {
        let network = MockNetwork::new();
        let service = MemorySignaling::new();
        let mut a = Side::new(&network, &service, "peer-a", Role::Impolite).await;

        a.engine.on_negotiation_needed(&a.signaling).await.unwrap();
        let second = a.engine.on_negotiation_needed(&a.signaling).await.unwrap();
        assert_eq!(second, NegotiationOutcome::Skipped);

        let offers = service
            .messages("abc123")
            .await
            .into_iter()
            .filter(|m| m.kind == SignalingKind::Offer)
            .count();
        assert_eq!(offers, 1);
    }

    #[tokio::test]
    async fn test_stale_answer_dropped() {
        let network = MockNetwork::new();
        let service = MemorySignaling::new();
        let mut a = Side::new(&network, &service, "peer-a", Role::Impolite).await;

        let outcome = a
            .engine
            .on_remote_description(SessionDescription::answer("v=0"), &a.signaling)
            .await
            .unwrap();
        assert_eq!(outcome, NegotiationOutcome::StaleAnswer);
        assert_eq!(a.engine.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_create_offer_failure_is_terminal() {
        let network = MockNetwork::new();
        let service = MemorySignaling::new();
        let mut a = Side::new(&network, &service, "peer-a", Role::Impolite).await;

        network.inject_fault("peer-a", MockFault::CreateOffer);
        let err = a
            .engine
            .on_negotiation_needed(&a.signaling)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Negotiation(_)));
        assert_eq!(a.engine.phase(), NegotiationPhase::Failed);
        assert_eq!(a.engine.state(), ConnectionState::Failed);

        // No self-healing
        let outcome = a.engine.on_negotiation_needed(&a.signaling).await.unwrap();
        assert_eq!(outcome, NegotiationOutcome::Skipped);
        assert_eq!(a.engine.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_malformed_offer_is_invalid_input() {
        let network = MockNetwork::new();
        let service = MemorySignaling::new();
        let mut b = Side::new(&network, &service, "peer-b", Role::Polite).await;

        let err = b
            .engine
            .on_remote_description(SessionDescription::offer("garbage"), &b.signaling)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidInput(_)));
        assert!(!b.engine.is_failed());
        assert_eq!(b.engine.phase(), NegotiationPhase::Idle);
    }

    #[tokio::test]
    async fn test_refused_offer_after_rollback_reoffers() {
        let network = MockNetwork::new();
        let service = MemorySignaling::new();
        let mut a = Side::new(&network, &service, "peer-a", Role::Impolite).await;
        let mut b = Side::new(&network, &service, "peer-b", Role::Polite).await;

        b.engine.on_negotiation_needed(&b.signaling).await.unwrap();
        assert_eq!(b.engine.phase(), NegotiationPhase::HaveLocalOffer);

        let err = b
            .engine
            .on_remote_description(SessionDescription::offer("garbage"), &b.signaling)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidInput(_)));
        assert!(!b.engine.is_failed());
        assert_eq!(b.engine.phase(), NegotiationPhase::HaveLocalOffer);

        let log = service.messages("abc123").await;
        let offers = log
            .iter()
            .filter(|m| m.sender_id == "peer-b" && m.kind == SignalingKind::Offer)
            .count();
        assert_eq!(offers, 2);

        // The fresh offer still negotiates
        let offer = last_of(&log, "peer-b", SignalingKind::Offer);
        let outcome = a
            .engine
            .on_remote_description(offer, &a.signaling)
            .await
            .unwrap();
        assert_eq!(outcome, NegotiationOutcome::AcceptedOffer { rolled_back: false });
        let answer = last_of(&service.messages("abc123").await, "peer-a", SignalingKind::Answer);
        assert_eq!(
            b.engine
                .on_remote_description(answer, &b.signaling)
                .await
                .unwrap(),
            NegotiationOutcome::AppliedAnswer
        );
    }

    #[tokio::test]
    async fn test_unknown_remote_offer_is_terminal() {
        let network = MockNetwork::new();
        let service = MemorySignaling::new();
        let mut b = Side::new(&network, &service, "peer-b", Role::Polite).await;

        let offer = SessionDescription::offer("v=0\r\no=tandem-mock 999 1 IN IP4 127.0.0.1\r\n");
        let err = b
            .engine
            .on_remote_description(offer, &b.signaling)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Negotiation(_)));
        assert_eq!(b.engine.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_bad_candidate_reported_without_state_change() {
        let network = MockNetwork::new();
        let service = MemorySignaling::new();
        let mut b = Side::new(&network, &service, "peer-b", Role::Polite).await;

        let err = b
            .engine
            .on_remote_candidate(IceCandidate {
                candidate: "bogus".into(),
                sdp_mid: None,
                sdp_m_line_index: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidInput(_)));
        assert_eq!(b.engine.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_transport_connected_needs_open_channel() {
        let network = MockNetwork::new();
        let service = MemorySignaling::new();
        let mut a = Side::new(&network, &service, "peer-a", Role::Impolite).await;

        a.engine.on_transport_state(TransportState::Connected);
        assert_eq!(a.engine.state(), ConnectionState::Connecting);

        a.engine.on_channel_open();
        assert_eq!(a.engine.state(), ConnectionState::Connected);

        a.engine.on_transport_state(TransportState::Closed);
        assert_eq!(a.engine.state(), ConnectionState::Disconnected);

        a.engine.on_transport_state(TransportState::Failed);
        assert_eq!(a.engine.state(), ConnectionState::Failed);
        a.engine.on_channel_open();
        assert_eq!(a.engine.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_signaling_loss_fails_engine() {
        let network = MockNetwork::new();
        let service = MemorySignaling::new();
        let mut a = Side::new(&network, &service, "peer-a", Role::Impolite).await;

        service.set_online(false);
        let err = a
            .engine
            .on_negotiation_needed(&a.signaling)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Signaling(_)));
        assert_eq!(a.engine.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_state_watch_observes_transitions() {
        let network = MockNetwork::new();
        let service = MemorySignaling::new();
        let mut a = Side::new(&network, &service, "peer-a", Role::Impolite).await;
        let mut watch = a.engine.watch_state();

        a.engine.on_negotiation_needed(&a.signaling).await.unwrap();
        assert!(watch.has_changed().unwrap());
        assert_eq!(*watch.borrow_and_update(), ConnectionState::Connecting);
    }
}
