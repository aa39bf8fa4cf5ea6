//! Two-peer session
//!
//! A session owns one peer connection, one data channel and every file
//! transfer for a single session key. All mutable state lives in one spawned
//! task; signaling deliveries, presence snapshots, substrate events, chunk
//! ticks and application commands are serialized through its `select!` loop,
//! so nothing in here takes a lock.
//!
//! Applications drive the session through a cloneable [`SessionHandle`] and
//! observe it through a stream of [`SessionEvent`]s.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelStats, DataChannelTransport};
use crate::error::{negotiation_error, SessionError};
use crate::negotiation::{NegotiationEngine, NegotiationOutcome};
use crate::persist::Persistence;
use crate::protocol::{ChatMessage, DataSnippet, Envelope, FileChunk};
use crate::role::local_role;
use crate::router::{MessageRouter, RouterStats};
use crate::signaling::SignalingChannel;
use crate::transfer::{
    ChunkOutcome, FileSource, TransferInfo, TransferManager, TransferStatus,
};
use crate::transport::{
    PeerConnectionFactory, PeerEvent, PresenceSet, SignalingService, Subscription,
};
use crate::types::{
    ConnectionState, PeerId, Role, SdpType, SessionConfig, SignalingKind, SignalingMessage,
};

/// Notification delivered to the application
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    RoleAssigned(Role),
    Chat(ChatMessage),
    DataSnippet(DataSnippet),
    /// Remote offered a file; answer with approve or reject
    IncomingFile(TransferInfo),
    TransferUpdated(TransferInfo),
    FileReceived { info: TransferInfo, path: PathBuf },
    Error(SessionError),
}

pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// Outcome of a local disconnect
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisconnectReport {
    /// Transfers that were still in progress
    pub discarded_transfers: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub channel: ChannelStats,
    pub router: RouterStats,
    pub transfers: usize,
}

/// Identity and tuning of one session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub session_key: String,
    pub local_peer_id: PeerId,
    pub config: SessionConfig,
}

impl SessionOptions {
    pub fn new(session_key: impl Into<String>, local_peer_id: impl Into<PeerId>) -> Self {
        Self {
            session_key: session_key.into(),
            local_peer_id: local_peer_id.into(),
            config: SessionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Command {
    Send {
        envelope: Envelope,
        reply: Reply<()>,
    },
    OfferFile {
        source: FileSource,
        name: String,
        mime: Option<String>,
        reply: Reply<TransferInfo>,
    },
    Decide {
        file_id: String,
        approve: bool,
        reply: Reply<TransferInfo>,
    },
    Transfer {
        file_id: String,
        reply: oneshot::Sender<Option<TransferInfo>>,
    },
    Transfers {
        reply: oneshot::Sender<Vec<TransferInfo>>,
    },
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
    Renegotiate {
        reply: Reply<()>,
    },
    Disconnect {
        reply: oneshot::Sender<DisconnectReport>,
    },
}

/// Entry point for joining a session
pub struct Session;

impl Session {
    /// Join `options.session_key` as `options.local_peer_id`
    ///
    /// Announces presence, publishes `ready`, subscribes to the signaling log
    /// and presence, creates the peer connection and spawns the session task.
    pub async fn connect(
        options: SessionOptions,
        signaling: Arc<dyn SignalingService>,
        factory: Arc<dyn PeerConnectionFactory>,
        persistence: Arc<dyn Persistence>,
    ) -> Result<(SessionHandle, SessionEvents), SessionError> {
        if options.session_key.is_empty() {
            return Err(SessionError::InvalidInput("empty session key".into()));
        }
        if options.local_peer_id.is_empty() {
            return Err(SessionError::InvalidInput("empty peer id".into()));
        }

        let mut channel = SignalingChannel::new(
            signaling,
            options.session_key.clone(),
            options.local_peer_id.clone(),
        );
        channel.announce().await?;
        channel.publish_ready().await?;
        let log = channel.subscribe().await?;
        let presence = channel.subscribe_presence().await?;

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let pc = match factory.create(&options.local_peer_id, peer_tx).await {
            Ok(pc) => pc,
            Err(e) => {
                let _ = channel.withdraw().await;
                return Err(negotiation_error(e));
            }
        };

        // A lone peer is impolite until presence says otherwise
        let engine = NegotiationEngine::new(Role::Impolite, pc);
        let state = engine.watch_state();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();

        info!(
            "[Session] {} joined session {}",
            options.local_peer_id, options.session_key
        );

        let session = SessionLoop {
            local_peer_id: options.local_peer_id.clone(),
            transfers: TransferManager::new(options.config.chunk_size),
            config: options.config,
            signaling: channel,
            engine,
            transport: DataChannelTransport::new(),
            router: MessageRouter::new(),
            persistence,
            events: events_tx,
            tick_tx,
            role: None,
            remote_peer: None,
            channel_requested: false,
            remote_closed: false,
            last_state: ConnectionState::Disconnected,
            joined: HashMap::new(),
            held: VecDeque::new(),
        };
        tokio::spawn(session.run(log, presence, peer_rx, tick_rx, command_rx));

        let handle = SessionHandle {
            local_peer_id: options.local_peer_id,
            session_key: options.session_key,
            commands: command_tx,
            state,
        };
        Ok((handle, events_rx))
    }
}

/// Cloneable control handle for a running session
#[derive(Clone)]
pub struct SessionHandle {
    local_peer_id: PeerId,
    session_key: String,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl SessionHandle {
    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Check if the session task is still running
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Wait until the session reaches `target`
    ///
    /// Fails early if the session fails or its task ends first.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), SessionError> {
        let mut rx = self.state.clone();
        let reached = {
            let state = rx
                .wait_for(|s| *s == target || *s == ConnectionState::Failed)
                .await
                .map_err(|_| SessionError::Closed)?;
            *state
        };
        if reached == target {
            Ok(())
        } else {
            Err(SessionError::Negotiation(format!(
                "session failed while waiting for {}",
                target
            )))
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn send_chat(&self, text: impl Into<String>) -> Result<(), SessionError> {
        let envelope = Envelope::Chat(ChatMessage::new(text));
        self.request(|reply| Command::Send { envelope, reply })
            .await?
    }

    pub async fn send_snippet(
        &self,
        content: impl Into<String>,
        language: Option<String>,
    ) -> Result<(), SessionError> {
        let envelope = Envelope::DataSnippet(DataSnippet {
            content: content.into(),
            language,
        });
        self.request(|reply| Command::Send { envelope, reply })
            .await?
    }

    /// Offer in-memory bytes; chunks flow once the remote approves
    pub async fn offer_file(
        &self,
        bytes: impl Into<Bytes>,
        name: impl Into<String>,
        mime: Option<String>,
    ) -> Result<TransferInfo, SessionError> {
        let source = FileSource::Memory(bytes.into());
        let name = name.into();
        self.request(|reply| Command::OfferFile {
            source,
            name,
            mime,
            reply,
        })
        .await?
    }

    /// Offer a file on disk; it is read one chunk at a time
    pub async fn offer_path(
        &self,
        path: impl AsRef<Path>,
        mime: Option<String>,
    ) -> Result<TransferInfo, SessionError> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                SessionError::InvalidInput(format!("no file name in {}", path.display()))
            })?
            .to_string();
        let source = FileSource::Path(path.to_path_buf());
        self.request(|reply| Command::OfferFile {
            source,
            name,
            mime,
            reply,
        })
        .await?
    }

    pub async fn approve_file(&self, file_id: &str) -> Result<TransferInfo, SessionError> {
        let file_id = file_id.to_string();
        self.request(|reply| Command::Decide {
            file_id,
            approve: true,
            reply,
        })
        .await?
    }

    pub async fn reject_file(&self, file_id: &str) -> Result<TransferInfo, SessionError> {
        let file_id = file_id.to_string();
        self.request(|reply| Command::Decide {
            file_id,
            approve: false,
            reply,
        })
        .await?
    }

    pub async fn transfer_status(
        &self,
        file_id: &str,
    ) -> Result<Option<TransferStatus>, SessionError> {
        Ok(self.transfer(file_id).await?.map(|info| info.status))
    }

    pub async fn transfer(&self, file_id: &str) -> Result<Option<TransferInfo>, SessionError> {
        let file_id = file_id.to_string();
        self.request(|reply| Command::Transfer { file_id, reply })
            .await
    }

    pub async fn transfers(&self) -> Result<Vec<TransferInfo>, SessionError> {
        self.request(|reply| Command::Transfers { reply }).await
    }

    pub async fn stats(&self) -> Result<SessionStats, SessionError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Restart ICE and negotiate again
    pub async fn renegotiate(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Renegotiate { reply })
            .await?
    }

    /// Leave the session; calling again has no further effect
    pub async fn disconnect(&self) -> DisconnectReport {
        self.request(|reply| Command::Disconnect { reply })
            .await
            .unwrap_or_default()
    }
}

/// State owned by the session task
struct SessionLoop {
    local_peer_id: PeerId,
    config: SessionConfig,
    signaling: SignalingChannel,
    engine: NegotiationEngine,
    transport: DataChannelTransport,
    transfers: TransferManager,
    router: MessageRouter,
    persistence: Arc<dyn Persistence>,
    events: mpsc::UnboundedSender<SessionEvent>,
    tick_tx: mpsc::UnboundedSender<String>,
    role: Option<Role>,
    remote_peer: Option<PeerId>,
    channel_requested: bool,
    remote_closed: bool,
    last_state: ConnectionState,
    /// Latest presence stamp seen per remote peer; entries outlive departures
    joined: HashMap<PeerId, u64>,
    /// Messages from joins presence has not shown yet
    held: VecDeque<SignalingMessage>,
}

/// Upper bound on messages held back waiting for presence
const MAX_HELD_MESSAGES: usize = 256;

/// How a stamped message relates to what presence says about its sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freshness {
    Current,
    /// Left over from an earlier join of the same peer id
    Stale,
    /// Presence has not caught up with this join yet
    Ahead,
}

impl SessionLoop {
    async fn run(
        mut self,
        mut log: Subscription<SignalingMessage>,
        mut presence: Subscription<PresenceSet>,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
        mut ticks: mpsc::UnboundedReceiver<String>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let mut log_open = true;
        let mut presence_open = true;
        let mut peer_open = true;

        let disconnect_reply = loop {
            tokio::select! {
                msg = log.recv(), if log_open => match msg {
                    Some(msg) => self.on_signaling(msg).await,
                    None => {
                        log_open = false;
                        self.report(
                            "signaling",
                            SessionError::Signaling("signaling subscription closed".into()),
                        );
                    }
                },
                set = presence.recv(), if presence_open => match set {
                    Some(set) => self.on_presence(set).await,
                    None => {
                        presence_open = false;
                        warn!("[Session] presence subscription closed");
                    }
                },
                event = peer_events.recv(), if peer_open => match event {
                    Some(event) => self.on_peer_event(event).await,
                    None => peer_open = false,
                },
                Some(file_id) = ticks.recv() => self.send_next_chunk(&file_id).await,
                cmd = commands.recv() => match cmd {
                    Some(Command::Disconnect { reply }) => break Some(reply),
                    Some(cmd) => self.on_command(cmd).await,
                    None => {
                        debug!("[Session] all handles dropped");
                        break None;
                    }
                },
            }
            self.sync_state();
        };

        let report = self.teardown().await;
        log.unsubscribe();
        presence.unsubscribe();
        if let Some(reply) = disconnect_reply {
            let _ = reply.send(report);
        }
        info!(
            "[Session] {} left session {}",
            self.local_peer_id,
            self.signaling.session_key()
        );
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn sync_state(&mut self) {
        let state = self.engine.state();
        if state != self.last_state {
            self.last_state = state;
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn report(&mut self, context: &str, err: SessionError) {
        if err.is_terminal() {
            error!("[Session] {}: {}", context, err);
            self.engine.on_terminal_error(&err);
        } else {
            warn!("[Session] {}: {}", context, err);
        }
        self.emit(SessionEvent::Error(err));
    }

    fn negotiated(&mut self, context: &str, result: Result<NegotiationOutcome, SessionError>) {
        match result {
            Ok(outcome) => debug!("[Session] {}: {:?}", context, outcome),
            Err(e) => self.report(context, e),
        }
    }

    fn transfer_updated(&self, file_id: &str) {
        if let Some(info) = self.transfers.info(file_id) {
            self.emit(SessionEvent::TransferUpdated(info));
        }
    }

    // ------------------------------------------------------------------
    // Signaling and presence
    // ------------------------------------------------------------------

    fn freshness(&self, msg: &SignalingMessage) -> Freshness {
        // Unstamped messages cannot be told apart; take them as current
        let Some(sent) = msg.joined_at else {
            return Freshness::Current;
        };
        match self.joined.get(&msg.sender_id) {
            Some(&known) if sent == known => Freshness::Current,
            Some(&known) if sent < known => Freshness::Stale,
            _ => Freshness::Ahead,
        }
    }

    async fn on_signaling(&mut self, msg: SignalingMessage) {
        if msg.is_from(&self.local_peer_id) {
            return;
        }
        match self.freshness(&msg) {
            Freshness::Current => {}
            Freshness::Stale => {
                debug!(
                    "[Session] dropping {} from an earlier join of {}",
                    msg.kind, msg.sender_id
                );
                return;
            }
            Freshness::Ahead => {
                if self.held.len() >= MAX_HELD_MESSAGES {
                    if let Some(dropped) = self.held.pop_front() {
                        warn!(
                            "[Session] too many held messages; dropping {} from {}",
                            dropped.kind, dropped.sender_id
                        );
                    }
                }
                self.held.push_back(msg);
                return;
            }
        }
        if self.remote_closed && msg.kind != SignalingKind::Ready {
            debug!(
                "[Session] transport closed; ignoring {} from {}",
                msg.kind, msg.sender_id
            );
            return;
        }

        match msg.kind {
            SignalingKind::Offer | SignalingKind::Answer => {
                let desc = match msg.description() {
                    Ok(desc) => desc,
                    Err(e) => return self.report("malformed description", e.into()),
                };
                let expected = if msg.kind == SignalingKind::Offer {
                    SdpType::Offer
                } else {
                    SdpType::Answer
                };
                if desc.sdp_type != expected {
                    let err = SessionError::InvalidInput(format!(
                        "{} message carries a {:?} description",
                        msg.kind, desc.sdp_type
                    ));
                    return self.report("malformed description", err);
                }
                let result = self
                    .engine
                    .on_remote_description(desc, &self.signaling)
                    .await;
                self.negotiated("remote description", result);
            }
            SignalingKind::Candidate => {
                let candidate = match msg.ice_candidate() {
                    Ok(c) => c,
                    Err(e) => return self.report("malformed candidate", e.into()),
                };
                let result = self.engine.on_remote_candidate(candidate).await;
                self.negotiated("remote candidate", result);
            }
            SignalingKind::Ready => {
                info!("[Session] peer {} is ready", msg.sender_id);
            }
            SignalingKind::Disconnect => self.on_remote_disconnect(&msg.sender_id).await,
        }
    }

    async fn on_remote_disconnect(&mut self, sender: &str) {
        if self.remote_peer.as_deref() != Some(sender) {
            warn!(
                "[Session] disconnect from {} who is not our peer; ignoring",
                sender
            );
            return;
        }
        info!("[Session] peer {} disconnected", sender);
        self.remote_closed = true;
        self.transport.close().await;
        self.engine.shutdown().await;
        let discarded = self.transfers.discard_all();
        if discarded > 0 {
            info!("[Session] discarded {} unfinished transfers", discarded);
        }
    }

    async fn on_presence(&mut self, set: PresenceSet) {
        for (peer, record) in &set {
            if peer.as_str() != self.local_peer_id {
                self.joined.insert(peer.clone(), record.joined_at);
            }
        }

        let Some(role) = local_role(&self.local_peer_id, set.keys()) else {
            warn!("[Session] own presence record missing from snapshot");
            return;
        };

        if self.role != Some(role) {
            info!("[Session] {} is {}", self.local_peer_id, role);
            self.role = Some(role);
            self.engine.set_role(role);
            self.emit(SessionEvent::RoleAssigned(role));
        }

        let remote = set
            .keys()
            .find(|p| p.as_str() != self.local_peer_id)
            .cloned();
        if let Some(now) = remote {
            if self.remote_peer.as_deref() != Some(now.as_str()) {
                info!("[Session] peer {} present", now);
                self.remote_peer = Some(now);
            }
        } else if let Some(before) = &self.remote_peer {
            info!("[Session] peer {} left presence", before);
        }

        // The impolite side opens the channel once a second peer shows up
        if role == Role::Impolite
            && set.len() >= 2
            && !self.channel_requested
            && !self.remote_closed
        {
            self.channel_requested = true;
            let label = self.config.channel_label.clone();
            match self
                .engine
                .peer_connection()
                .create_data_channel(&label)
                .await
            {
                Ok(channel) => self.transport.attach(channel),
                Err(e) => self.report("creating data channel", negotiation_error(e)),
            }
        }

        for msg in std::mem::take(&mut self.held) {
            self.on_signaling(msg).await;
        }
    }

    // ------------------------------------------------------------------
    // Substrate events
    // ------------------------------------------------------------------

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::NegotiationNeeded => {
                if self.remote_closed {
                    return;
                }
                let result = self.engine.on_negotiation_needed(&self.signaling).await;
                self.negotiated("negotiation needed", result);
            }
            PeerEvent::LocalCandidate(candidate) => {
                if self.engine.is_failed() || self.remote_closed {
                    return;
                }
                if let Err(e) = self.signaling.publish_candidate(&candidate).await {
                    self.report("publishing candidate", e);
                }
            }
            PeerEvent::TransportState(state) => self.engine.on_transport_state(state),
            PeerEvent::DataChannel(channel) => {
                if channel.label() != self.config.channel_label {
                    warn!(
                        "[Session] remote opened channel '{}', expected '{}'",
                        channel.label(),
                        self.config.channel_label
                    );
                }
                self.transport.attach(channel);
            }
            PeerEvent::ChannelOpen { label } => {
                info!("[Session] data channel '{}' open", label);
                self.engine.on_channel_open();
            }
            PeerEvent::ChannelMessage { text, .. } => self.on_frame(&text).await,
            PeerEvent::ChannelClose { label } => {
                info!("[Session] data channel '{}' closed", label);
                self.engine.on_channel_close();
            }
            PeerEvent::ChannelError { label, error } => {
                warn!("[Session] data channel '{}' error: {}", label, error);
                self.engine.on_channel_error(&error);
            }
        }
    }

    // ------------------------------------------------------------------
    // Application messages
    // ------------------------------------------------------------------

    async fn on_frame(&mut self, text: &str) {
        self.transport.record_received(text);
        let Some(envelope) = self.router.route(text) else {
            return;
        };

        match envelope {
            Envelope::Chat(chat) => self.emit(SessionEvent::Chat(chat)),
            Envelope::DataSnippet(snippet) => self.emit(SessionEvent::DataSnippet(snippet)),
            Envelope::FileMetadata(meta) => match self.transfers.on_metadata(meta) {
                Ok(info) => self.emit(SessionEvent::IncomingFile(info)),
                Err(e) => self.report("file metadata", e),
            },
            Envelope::FileApprove(file) => match self.transfers.on_approve(&file.file_id) {
                Ok(info) => {
                    self.emit(SessionEvent::TransferUpdated(info));
                    self.send_next_chunk(&file.file_id).await;
                }
                Err(e) => self.report("file approve", e),
            },
            Envelope::FileReject(file) => match self.transfers.on_reject(&file.file_id) {
                Ok(info) => self.emit(SessionEvent::TransferUpdated(info)),
                Err(e) => self.report("file reject", e),
            },
            Envelope::FileChunk(chunk) => self.on_chunk(chunk).await,
        }
    }

    async fn on_chunk(&mut self, chunk: FileChunk) {
        let file_id = chunk.file_id.clone();
        match self.transfers.on_chunk(chunk) {
            Ok(ChunkOutcome::Stored { .. }) | Ok(ChunkOutcome::Dropped) => {}
            Ok(ChunkOutcome::Complete { info, bytes }) => {
                match self.persistence.persist(&bytes, &info.name).await {
                    Ok(path) => {
                        self.emit(SessionEvent::TransferUpdated(info.clone()));
                        self.emit(SessionEvent::FileReceived { info, path });
                    }
                    Err(e) => {
                        let reason = format!("persist failed: {}", e);
                        self.transfers.fail(&file_id, reason.clone());
                        self.transfer_updated(&file_id);
                        self.report("file chunk", SessionError::transfer(&file_id, reason));
                    }
                }
            }
            Err(e) => {
                if matches!(e, SessionError::Transfer { .. }) {
                    self.transfer_updated(&file_id);
                }
                self.report("file chunk", e);
            }
        }
    }

    async fn send_next_chunk(&mut self, file_id: &str) {
        let chunk = match self.transfers.next_chunk(file_id).await {
            Ok(Some(chunk)) => chunk,
            // Finished, rejected or discarded
            Ok(None) | Err(SessionError::UnknownTransfer(_)) => return,
            Err(e) => {
                self.transfer_updated(file_id);
                return self.report("reading chunk", e);
            }
        };

        if let Err(e) = self.transport.send(&Envelope::FileChunk(chunk)).await {
            self.transfers
                .fail(file_id, format!("chunk send failed: {}", e));
            self.transfer_updated(file_id);
            return self.report("sending chunk", e);
        }

        match self.transfers.mark_sent(file_id) {
            Ok(true) => self.schedule_tick(file_id),
            Ok(false) => self.transfer_updated(file_id),
            Err(_) => {}
        }
    }

    fn schedule_tick(&self, file_id: &str) {
        let tx = self.tick_tx.clone();
        let file_id = file_id.to_string();
        let delay = Duration::from_millis(self.config.chunk_delay_ms);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(file_id);
        });
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send { envelope, reply } => {
                let _ = reply.send(self.transport.send(&envelope).await);
            }
            Command::OfferFile {
                source,
                name,
                mime,
                reply,
            } => {
                let _ = reply.send(self.offer_file(source, &name, mime).await);
            }
            Command::Decide {
                file_id,
                approve,
                reply,
            } => {
                let _ = reply.send(self.decide(&file_id, approve).await);
            }
            Command::Transfer { file_id, reply } => {
                let _ = reply.send(self.transfers.info(&file_id));
            }
            Command::Transfers { reply } => {
                let _ = reply.send(self.transfers.list());
            }
            Command::Stats { reply } => {
                let _ = reply.send(SessionStats {
                    channel: self.transport.stats(),
                    router: self.router.stats().clone(),
                    transfers: self.transfers.list().len(),
                });
            }
            Command::Renegotiate { reply } => {
                let _ = reply.send(self.renegotiate().await);
            }
            Command::Disconnect { reply } => {
                // Handled by the loop; a late one only gets an empty report
                let _ = reply.send(DisconnectReport::default());
            }
        }
    }

    async fn offer_file(
        &mut self,
        source: FileSource,
        name: &str,
        mime: Option<String>,
    ) -> Result<TransferInfo, SessionError> {
        if !self.transport.is_open() {
            return Err(SessionError::ChannelSend("data channel not open".into()));
        }
        let (metadata, info) = self.transfers.offer(source, name, mime).await?;
        let file_id = metadata.id.clone();
        if let Err(e) = self.transport.send(&Envelope::FileMetadata(metadata)).await {
            self.transfers
                .fail(&file_id, format!("metadata send failed: {}", e));
            return Err(e);
        }
        self.emit(SessionEvent::TransferUpdated(info.clone()));
        Ok(info)
    }

    async fn decide(&mut self, file_id: &str, approve: bool) -> Result<TransferInfo, SessionError> {
        if !self.transport.is_open() {
            return Err(SessionError::ChannelSend("data channel not open".into()));
        }
        let reply = self.transfers.decision_reply(file_id)?;
        let envelope = if approve {
            Envelope::FileApprove(reply)
        } else {
            Envelope::FileReject(reply)
        };
        // Still pending on failure so the decision can be retried
        self.transport.send(&envelope).await?;
        if approve {
            self.transfers.approve(file_id)?;
        } else {
            self.transfers.reject(file_id)?;
        }
        let info = self
            .transfers
            .info(file_id)
            .ok_or_else(|| SessionError::UnknownTransfer(file_id.to_string()))?;
        self.emit(SessionEvent::TransferUpdated(info.clone()));
        Ok(info)
    }

    async fn renegotiate(&mut self) -> Result<(), SessionError> {
        if self.remote_closed {
            return Err(SessionError::InvalidInput(
                "peer disconnected; reconnect instead".into(),
            ));
        }
        if self.engine.is_failed() {
            return Err(SessionError::Negotiation(
                "session failed; reconnect instead".into(),
            ));
        }
        info!("[Session] restarting ICE");
        self.engine
            .peer_connection()
            .restart_ice()
            .await
            .map_err(negotiation_error)
    }

    async fn teardown(&mut self) -> DisconnectReport {
        self.transport.close().await;
        self.engine.shutdown().await;
        if let Err(e) = self.signaling.publish_disconnect().await {
            warn!("[Session] could not announce disconnect: {}", e);
        }
        if let Err(e) = self.signaling.withdraw().await {
            warn!("[Session] could not withdraw presence: {}", e);
        }
        let discarded = self.transfers.discard_all();
        self.sync_state();
        DisconnectReport {
            discarded_transfers: discarded,
        }
    }
}
