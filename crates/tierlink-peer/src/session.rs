//! Peer session: one channel, the peer table, and the event/command API
//!
//! A session moves `Disconnected -> Connecting -> Connected`, and can reach
//! `Failed` from either of the latter two. The channel's connectivity signal
//! drives `Connected`; a channel close returns to `Disconnected`. Leaving a
//! room, by request or because the channel went away, resets every piece of
//! transient state before the session can be used for another room.
//!
//! Nothing is retried automatically. After a failure, call [`PeerSession::retry`]
//! to re-run the last create or join with the same parameters.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tierlink_core::types::{
    generate_peer_id, now_millis, ConnectionQuality, IceCandidate, PeerId, PeerInfo, PeerRole,
    SessionStatus, TransferId, TransportKind,
};
use tierlink_core::{
    CodecLimits, Config, Frame, FrameDecoder, Message, MessageBody, RateLimiter, RoomCode,
    SessionError,
};
use tierlink_signal::SignalingStore;

use crate::chunk::{transfer_messages, ChunkOutcome, ChunkReassembler};
use crate::signaling::{CreateRoomOptions, JoinResult, SignalingEvent, SignalingSession};
use crate::transport::{ChannelState, NegotiationChannel, PeerConnection, PeerConnector};

/// Events published by a session
#[derive(Clone, Debug)]
pub enum SessionEvent {
    StatusChanged(SessionStatus),
    PeerJoined(PeerInfo),
    PeerLeft(PeerId),
    QualityChanged {
        quality: ConnectionQuality,
        transport: Option<TransportKind>,
    },
    SyncReceived {
        sender_id: PeerId,
        board_id: String,
        delta: Bytes,
        sequence: u64,
    },
    SyncRequested {
        sender_id: PeerId,
        board_id: String,
    },
    FullDocument {
        sender_id: PeerId,
        board_id: String,
        document: Bytes,
    },
    Chat {
        sender_id: PeerId,
        board_id: String,
        content: String,
        timestamp: u64,
    },
    ImageReceived {
        sender_id: PeerId,
        transfer_id: TransferId,
        data: Bytes,
    },
    ImageRequested {
        sender_id: PeerId,
        transfer_id: TransferId,
    },
    /// Envelope for the replication engine; `target_id` is not filtered here
    CrdtMessage {
        sender_id: PeerId,
        target_id: PeerId,
        payload: Bytes,
    },
    /// The host removed this session from the room
    Kicked,
    /// The host closed the room
    RoomClosed,
    /// Surfaced once per failure, alongside `StatusChanged(Failed)`
    Error(SessionError),
}

/// Construction options
#[derive(Clone, Debug)]
pub struct PeerSessionOptions {
    pub display_name: String,
    pub capabilities: Vec<String>,
    pub config: Config,
}

impl Default for PeerSessionOptions {
    fn default() -> Self {
        Self {
            display_name: "Anonymous".into(),
            capabilities: Vec::new(),
            config: Config::default(),
        }
    }
}

#[derive(Clone, Debug)]
struct ActiveRoom {
    code: RoomCode,
    host_id: PeerId,
}

#[derive(Clone, Debug)]
enum LastAttempt {
    Create(CreateRoomOptions),
    Join {
        code: RoomCode,
        password: Option<String>,
    },
}

/// Store-side cleanup owed after leaving a room
struct StoreCleanup {
    code: String,
    role: PeerRole,
}

/// Side effects of an inbound message, run after the state lock is released
#[derive(Debug)]
enum Action {
    Emit(SessionEvent),
    AddCandidate(IceCandidate),
    Leave(SessionEvent),
}

struct SessionState {
    generation: u64,
    role: Option<PeerRole>,
    room: Option<ActiveRoom>,
    /// The remote peer this channel belongs to, fixed by its first `PeerJoin`
    remote: Option<PeerId>,
    peers: HashMap<PeerId, PeerInfo>,
    /// Last sequence assigned to an outbound sync
    next_sequence: u64,
    /// Highest sync sequence accepted per remote peer
    watermarks: HashMap<PeerId, u64>,
    reassembler: ChunkReassembler,
    decoder: FrameDecoder,
    connection: Option<Arc<dyn PeerConnection>>,
    tasks: Vec<JoinHandle<()>>,
    last_attempt: Option<LastAttempt>,
    quality: Option<(ConnectionQuality, Option<TransportKind>)>,
}

impl SessionState {
    fn new(config: &Config) -> Self {
        Self {
            generation: 0,
            role: None,
            room: None,
            remote: None,
            peers: HashMap::new(),
            next_sequence: 0,
            watermarks: HashMap::new(),
            reassembler: reassembler_for(config),
            decoder: decoder_for(config),
            connection: None,
            tasks: Vec::new(),
            last_attempt: None,
            quality: None,
        }
    }

    fn forget_peer(&mut self, peer_id: &str, limiter: &RateLimiter) -> Option<PeerInfo> {
        self.watermarks.remove(peer_id);
        self.reassembler.purge_sender(peer_id);
        limiter.remove(peer_id);
        self.peers.remove(peer_id)
    }
}

fn reassembler_for(config: &Config) -> ChunkReassembler {
    ChunkReassembler::new(config.transfer.max_chunks(), config.transfer.stale_after())
        .with_sender_limits(
            config.transfer.max_pending_per_sender,
            config.transfer.max_image_bytes,
        )
}

fn decoder_for(config: &Config) -> FrameDecoder {
    FrameDecoder::with_limits(CodecLimits {
        max_payload: config.transfer.max_image_bytes.max(tierlink_core::CHUNK_SIZE),
        max_chunk: config.transfer.chunk_size,
        max_total_chunks: config.transfer.max_chunks(),
        ..CodecLimits::default()
    })
}

struct Inner {
    local_id: PeerId,
    display_name: String,
    capabilities: Vec<String>,
    config: Config,
    connector: Arc<dyn PeerConnector>,
    signaling: SignalingSession,
    limiter: RateLimiter,
    status: watch::Sender<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
    state: Mutex<SessionState>,
}

/// Handle to a peer session; clones share the same session
#[derive(Clone)]
pub struct PeerSession {
    inner: Arc<Inner>,
}

impl PeerSession {
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        store: Arc<dyn SignalingStore>,
        options: PeerSessionOptions,
    ) -> Self {
        let PeerSessionOptions {
            display_name,
            capabilities,
            config,
        } = options;
        let (status, _) = watch::channel(SessionStatus::Disconnected);
        let (events, _) = broadcast::channel(config.session.event_capacity.max(1));

        let inner = Inner {
            local_id: generate_peer_id(),
            display_name,
            capabilities,
            connector,
            signaling: SignalingSession::new(store, &config),
            limiter: RateLimiter::with_config(config.limits.messages()),
            status,
            events,
            state: Mutex::new(SessionState::new(&config)),
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    pub fn display_name(&self) -> &str {
        &self.inner.display_name
    }

    pub fn status(&self) -> SessionStatus {
        *self.inner.status.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    /// Known remote peers, oldest first
    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.inner.state.lock().peers.values().cloned().collect();
        peers.sort_by(|a, b| a.connected_at.cmp(&b.connected_at).then(a.id.cmp(&b.id)));
        peers
    }

    pub fn room_code(&self) -> Option<RoomCode> {
        self.inner.state.lock().room.as_ref().map(|r| r.code.clone())
    }

    pub fn role(&self) -> Option<PeerRole> {
        self.inner.state.lock().role
    }

    pub fn is_host(&self) -> bool {
        let state = self.inner.state.lock();
        state.role == Some(PeerRole::Host) && state.room.is_some()
    }

    pub fn connection_quality(&self) -> Option<(ConnectionQuality, Option<TransportKind>)> {
        self.inner.state.lock().quality
    }

    /// Host a new room
    pub async fn create_room(&self, options: CreateRoomOptions) -> Result<RoomCode, SessionError> {
        self.leave_if_active().await;
        let inner = &self.inner;
        let generation = inner.begin_attempt(PeerRole::Host, LastAttempt::Create(options.clone()));

        let channel = match inner.open_channel(generation).await {
            Ok(channel) => channel,
            Err(e) => {
                inner.fail(generation, e.clone());
                return Err(e);
            }
        };

        match inner
            .signaling
            .host_create_room(&inner.local_id, channel, &options)
            .await
        {
            Ok(code) => {
                if !inner.record_room(generation, code.clone(), inner.local_id.clone()) {
                    inner.spawn_cleanup(Some(StoreCleanup {
                        code: code.short_code().to_string(),
                        role: PeerRole::Host,
                    }));
                    return Err(SessionError::ChannelNotReady);
                }
                info!("Hosting room {}", code);
                Ok(code)
            }
            Err(e) => {
                inner.fail(generation, e.clone());
                Err(e)
            }
        }
    }

    /// Join a room by short or long code
    pub async fn join_room(
        &self,
        code: &str,
        password: Option<&str>,
    ) -> Result<JoinResult, SessionError> {
        let code = RoomCode::parse(code)?;
        self.leave_if_active().await;
        let inner = &self.inner;
        let generation = inner.begin_attempt(
            PeerRole::Client,
            LastAttempt::Join {
                code: code.clone(),
                password: password.map(str::to_string),
            },
        );

        let channel = match inner.open_channel(generation).await {
            Ok(channel) => channel,
            Err(e) => {
                inner.fail(generation, e.clone());
                return Err(e);
            }
        };

        match inner
            .signaling
            .client_join_room(&code, password, channel)
            .await
        {
            Ok(joined) => {
                if !inner.record_room(generation, joined.code.clone(), joined.host_id.clone()) {
                    inner.spawn_cleanup(Some(StoreCleanup {
                        code: joined.code.short_code().to_string(),
                        role: PeerRole::Client,
                    }));
                    return Err(SessionError::ChannelNotReady);
                }
                info!("Joined room {} hosted by {}", joined.code, joined.host_id);
                Ok(joined)
            }
            Err(e) => {
                inner.fail(generation, e.clone());
                Err(e)
            }
        }
    }

    /// Re-run the last create or join with the same parameters
    pub async fn retry(&self) -> Result<RoomCode, SessionError> {
        let last = self.inner.state.lock().last_attempt.clone();
        match last {
            Some(LastAttempt::Create(options)) => self.create_room(options).await,
            Some(LastAttempt::Join { code, password }) => self
                .join_room(&code.to_string(), password.as_deref())
                .await
                .map(|joined| joined.code),
            None => Err(SessionError::NotFound("no previous room attempt".into())),
        }
    }

    /// Leave the current room and return to `Disconnected`
    pub async fn leave_room(&self) {
        let cleanup = self.inner.teardown(SessionStatus::Disconnected, true);
        self.inner.cleanup_store(cleanup).await;
    }

    async fn leave_if_active(&self) {
        let active = {
            let state = self.inner.state.lock();
            state.room.is_some() || state.connection.is_some()
        };
        if active {
            self.leave_room().await;
        }
    }

    /// Send a CRDT delta; sequences start at 1 for each room
    pub fn send_sync(&self, board_id: &str, delta: impl Into<Bytes>) -> bool {
        let Some(connection) = self.inner.ready_connection("sync") else {
            return false;
        };
        let sequence = {
            let mut state = self.inner.state.lock();
            state.next_sequence += 1;
            state.next_sequence
        };
        self.inner.transmit(
            &connection,
            MessageBody::Sync {
                board_id: board_id.to_string(),
                delta: delta.into(),
                sequence,
            },
        )
    }

    pub fn request_sync(&self, board_id: &str) -> bool {
        self.inner.send(MessageBody::SyncRequest {
            board_id: board_id.to_string(),
        })
    }

    /// Send a whole document, optionally addressed to one peer
    pub fn send_full_document(
        &self,
        board_id: &str,
        document: impl Into<Bytes>,
        target_peer_id: Option<&str>,
    ) -> bool {
        self.inner.send(MessageBody::FullSync {
            board_id: board_id.to_string(),
            document: document.into(),
            target_peer_id: target_peer_id.map(str::to_string),
        })
    }

    pub fn send_chat(&self, board_id: &str, content: &str) -> bool {
        if content.len() > tierlink_core::MAX_CHAT_LEN {
            warn!(
                "Chat message of {} bytes exceeds {}, not sent",
                content.len(),
                tierlink_core::MAX_CHAT_LEN
            );
            return false;
        }
        self.inner.send(MessageBody::Chat {
            board_id: board_id.to_string(),
            content: content.to_string(),
            timestamp: now_millis(),
        })
    }

    /// Send an image as paced chunks followed by a completion notice
    pub async fn send_image(&self, transfer_id: &str, data: impl Into<Bytes>) -> bool {
        let data = data.into();
        let transfer = &self.inner.config.transfer;
        if data.len() > transfer.max_image_bytes {
            warn!(
                "Image {} is {} bytes, over the {} byte limit",
                transfer_id,
                data.len(),
                transfer.max_image_bytes
            );
            return false;
        }
        let Some(connection) = self.inner.ready_connection("image") else {
            return false;
        };

        let messages = transfer_messages(
            &self.inner.local_id,
            transfer_id,
            &data,
            transfer.chunk_size,
        );
        let last_chunk = messages.len().saturating_sub(2);
        debug!(
            "Sending image {} ({} bytes, {} chunks)",
            transfer_id,
            data.len(),
            messages.len() - 1
        );

        for (index, message) in messages.into_iter().enumerate() {
            if self.status() != SessionStatus::Connected {
                warn!("Channel closed while sending image {}", transfer_id);
                return false;
            }
            if !self.inner.transmit(&connection, message.body) {
                return false;
            }
            if index < last_chunk && !transfer.inter_chunk_delay().is_zero() {
                tokio::time::sleep(transfer.inter_chunk_delay()).await;
            }
        }
        true
    }

    pub fn request_image(&self, transfer_id: &str) -> bool {
        self.inner.send(MessageBody::ImageRequest {
            transfer_id: transfer_id.to_string(),
        })
    }

    /// Send an opaque replication-engine message addressed to one peer
    pub fn send_crdt(&self, target_peer_id: &str, payload: impl Into<Bytes>) -> bool {
        self.inner.send(MessageBody::CrdtEnvelope {
            target_peer_id: target_peer_id.to_string(),
            payload: payload.into(),
        })
    }

    /// Remove a peer from the room (host only)
    pub fn kick_peer(&self, peer_id: &str) -> Result<(), SessionError> {
        self.inner.require_host()?;
        info!("Kicking peer {}", peer_id);
        self.inner.send(MessageBody::PeerLeave {
            peer_id: peer_id.to_string(),
        });

        let removed = {
            let mut state = self.inner.state.lock();
            state.forget_peer(peer_id, &self.inner.limiter)
        };
        if removed.is_some() {
            self.inner.emit(SessionEvent::PeerLeft(peer_id.to_string()));
        }
        Ok(())
    }

    /// Notify every peer and tear the room down (host only)
    pub async fn close_room(&self) -> Result<(), SessionError> {
        self.inner.require_host()?;
        info!("Closing room");
        self.leave_room().await;
        Ok(())
    }

    /// Wait until the session is `Connected`
    pub async fn wait_connected(&self, wait: Duration) -> Result<(), SessionError> {
        let mut status = self.inner.status.subscribe();
        let reached = tokio::time::timeout(wait, async move {
            loop {
                let current = *status.borrow_and_update();
                match current {
                    SessionStatus::Connected => return Ok(()),
                    SessionStatus::Failed => {
                        return Err(SessionError::Transport("session failed".into()))
                    }
                    _ => {}
                }
                if status.changed().await.is_err() {
                    return Err(SessionError::ChannelNotReady);
                }
            }
        })
        .await;
        reached.map_err(|_| SessionError::Timeout("connection".into()))?
    }
}

impl Inner {
    fn current(&self, generation: u64) -> bool {
        self.state.lock().generation == generation
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn set_status(&self, next: SessionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            info!("Session {} -> {:?}", self.local_id, next);
            self.emit(SessionEvent::StatusChanged(next));
        }
    }

    fn begin_attempt(&self, role: PeerRole, attempt: LastAttempt) -> u64 {
        let generation = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.role = Some(role);
            state.last_attempt = Some(attempt);
            state.generation
        };
        self.set_status(SessionStatus::Connecting);
        generation
    }

    /// Open a connection and start the tasks that watch it
    async fn open_channel(
        self: &Arc<Self>,
        generation: u64,
    ) -> Result<NegotiationChannel, SessionError> {
        let opened = self.connector.open().await?;
        let (channel, frames) = opened.into_parts();

        let tasks = vec![
            tokio::spawn(drive_channel(
                Arc::downgrade(self),
                generation,
                frames,
                channel.state.clone(),
            )),
            tokio::spawn(pump_signaling(
                Arc::downgrade(self),
                generation,
                self.signaling.subscribe(),
            )),
        ];

        let mut state = self.state.lock();
        if state.generation != generation {
            for task in tasks {
                task.abort();
            }
            channel.connection.close();
            return Err(SessionError::ChannelNotReady);
        }
        state.connection = Some(channel.connection.clone());
        state.tasks.extend(tasks);
        Ok(channel)
    }

    fn record_room(&self, generation: u64, code: RoomCode, host_id: PeerId) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        state.room = Some(ActiveRoom { code, host_id });
        true
    }

    fn require_host(&self) -> Result<(), SessionError> {
        let state = self.state.lock();
        if state.role == Some(PeerRole::Host) && state.room.is_some() {
            Ok(())
        } else {
            Err(SessionError::Unauthorized(
                "host role with an active room required".into(),
            ))
        }
    }

    /// The channel, if the session is connected; logs and returns `None` otherwise
    fn ready_connection(&self, what: &str) -> Option<Arc<dyn PeerConnection>> {
        if *self.status.borrow() != SessionStatus::Connected {
            warn!("{}: {}, not sent", SessionError::ChannelNotReady, what);
            return None;
        }
        self.state.lock().connection.clone()
    }

    fn send(&self, body: MessageBody) -> bool {
        match self.ready_connection(body.kind()) {
            Some(connection) => self.transmit(&connection, body),
            None => false,
        }
    }

    fn transmit(&self, connection: &Arc<dyn PeerConnection>, body: MessageBody) -> bool {
        let message = Message::new(self.local_id.clone(), body);
        let frames = match message.encode() {
            Ok(frames) => frames,
            Err(e) => {
                warn!("Failed to encode {}: {}", message.body.kind(), e);
                return false;
            }
        };
        for frame in frames {
            if let Err(e) = connection.send(frame) {
                warn!("Failed to send {}: {}", message.body.kind(), e);
                return false;
            }
        }
        true
    }

    fn send_join(&self, connection: &Arc<dyn PeerConnection>) {
        self.transmit(
            connection,
            MessageBody::PeerJoin {
                peer_id: self.local_id.clone(),
                peer_name: self.display_name.clone(),
                capabilities: self.capabilities.clone(),
            },
        );
    }

    /// Reset every piece of transient state and close the channel
    ///
    /// Returns the store cleanup owed for the room that was left.
    fn teardown(&self, next: SessionStatus, notify_remote: bool) -> Option<StoreCleanup> {
        self.signaling.stop();

        let (room, role, peers, connection, tasks) = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.next_sequence = 0;
            state.watermarks.clear();
            state.reassembler.clear();
            if state.decoder.has_pending() {
                debug!("Discarding a chunk header still waiting for its data");
            }
            state.decoder.reset();
            state.quality = None;
            state.remote = None;
            (
                state.room.take(),
                state.role.take(),
                std::mem::take(&mut state.peers),
                state.connection.take(),
                std::mem::take(&mut state.tasks),
            )
        };
        self.limiter.clear();
        for task in tasks {
            task.abort();
        }

        if let Some(connection) = connection {
            if notify_remote && *self.status.borrow() == SessionStatus::Connected {
                self.transmit(
                    &connection,
                    MessageBody::PeerLeave {
                        peer_id: self.local_id.clone(),
                    },
                );
            }
            connection.close();
        }

        self.set_status(next);
        for peer_id in peers.into_keys() {
            self.emit(SessionEvent::PeerLeft(peer_id));
        }

        match (room, role) {
            (Some(room), Some(role)) => Some(StoreCleanup {
                code: room.code.short_code().to_string(),
                role,
            }),
            _ => None,
        }
    }

    /// Enter `Failed` and surface the error once
    fn fail(self: &Arc<Self>, generation: u64, error: SessionError) {
        if !self.current(generation) {
            return;
        }
        warn!("Session {} failed: {}", self.local_id, error);
        let cleanup = self.teardown(SessionStatus::Failed, true);
        self.emit(SessionEvent::Error(error));
        self.spawn_cleanup(cleanup);
    }

    /// Channel went away or the host ended our membership
    fn depart(self: &Arc<Self>, generation: u64, reason: Option<SessionEvent>) {
        if !self.current(generation) {
            return;
        }
        let cleanup = self.teardown(SessionStatus::Disconnected, false);
        if let Some(reason) = reason {
            self.emit(reason);
        }
        self.spawn_cleanup(cleanup);
    }

    /// Store cleanup runs detached so it survives the abort of the task that triggered it
    fn spawn_cleanup(self: &Arc<Self>, cleanup: Option<StoreCleanup>) {
        if cleanup.is_none() {
            return;
        }
        let store = self.signaling.store().clone();
        tokio::spawn(async move { release_room(store.as_ref(), cleanup).await });
    }

    async fn cleanup_store(&self, cleanup: Option<StoreCleanup>) {
        release_room(self.signaling.store().as_ref(), cleanup).await;
    }

    fn on_open(&self, generation: u64) {
        let connection = {
            let state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.connection.clone()
        };
        // Announce before reporting Connected so the join leads every other message
        if let Some(connection) = connection {
            self.send_join(&connection);
        }
        self.set_status(SessionStatus::Connected);
    }

    fn on_quality(&self, generation: u64, quality: ConnectionQuality, transport: Option<TransportKind>) {
        {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.quality = Some((quality, transport));
            for peer in state.peers.values_mut() {
                peer.connection_quality = Some(quality);
                peer.transport_kind = transport;
            }
        }
        self.emit(SessionEvent::QualityChanged { quality, transport });
    }

    async fn handle_frame(self: &Arc<Self>, generation: u64, frame: Frame) {
        let actions = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            match state.decoder.push(frame) {
                Ok(Some(message)) => route(&mut state, &self.local_id, &self.limiter, message),
                Ok(None) => return,
                Err(e) => {
                    debug!("Dropping inbound frame: {}", SessionError::from(e));
                    return;
                }
            }
        };

        for action in actions {
            match action {
                Action::Emit(event) => self.emit(event),
                Action::AddCandidate(candidate) => {
                    if let Err(e) = self.signaling.add_remote_candidate(candidate).await {
                        warn!("Trickled candidate rejected: {}", e);
                    }
                }
                Action::Leave(reason) => {
                    info!("Leaving room: {:?}", reason);
                    self.depart(generation, Some(reason));
                    return;
                }
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.signaling.stop();
        let state = self.state.get_mut();
        for task in state.tasks.drain(..) {
            task.abort();
        }
        if let Some(connection) = state.connection.take() {
            connection.close();
        }
    }
}

/// Apply one validated inbound message to the session state
fn route(
    state: &mut SessionState,
    local_id: &str,
    limiter: &RateLimiter,
    message: Message,
) -> Vec<Action> {
    let Message { sender_id, body } = message;
    if sender_id == local_id {
        debug!("Ignoring {} echoed from our own id", body.kind());
        return Vec::new();
    }
    if !accepts_sender(state, &sender_id, &body) {
        return Vec::new();
    }

    // Chunks are paced by the sender and bounded by the image size limit
    if !matches!(body, MessageBody::ImageChunk { .. }) && !limiter.admit(&sender_id) {
        debug!(
            "{}: dropping {} from {}",
            SessionError::RateLimited(sender_id.clone()),
            body.kind(),
            sender_id
        );
        return Vec::new();
    }

    match body {
        MessageBody::Sync {
            board_id,
            delta,
            sequence,
        } => {
            let watermark = state.watermarks.get(&sender_id).copied().unwrap_or(0);
            if sequence <= watermark {
                debug!(
                    "Dropping sync {} from {}: at or below watermark {}",
                    sequence, sender_id, watermark
                );
                return Vec::new();
            }
            if sequence > watermark + 1 {
                warn!(
                    "Sync gap from {}: expected {}, got {}",
                    sender_id,
                    watermark + 1,
                    sequence
                );
            }
            state.watermarks.insert(sender_id.clone(), sequence);
            vec![Action::Emit(SessionEvent::SyncReceived {
                sender_id,
                board_id,
                delta,
                sequence,
            })]
        }
        MessageBody::SyncRequest { board_id } => {
            vec![Action::Emit(SessionEvent::SyncRequested {
                sender_id,
                board_id,
            })]
        }
        MessageBody::FullSync {
            board_id,
            document,
            target_peer_id,
        } => {
            if target_peer_id.as_deref().is_some_and(|target| target != local_id) {
                debug!("Full document for {:?} is not ours", target_peer_id);
                return Vec::new();
            }
            vec![Action::Emit(SessionEvent::FullDocument {
                sender_id,
                board_id,
                document,
            })]
        }
        MessageBody::Chat {
            board_id,
            content,
            timestamp,
        } => vec![Action::Emit(SessionEvent::Chat {
            sender_id,
            board_id,
            content,
            timestamp,
        })],
        MessageBody::PeerJoin {
            peer_id,
            peer_name,
            capabilities,
        } => {
            if state.remote.is_none() {
                info!("Channel bound to peer {}", sender_id);
                state.remote = Some(sender_id.clone());
            }
            let role = state.role.map(PeerRole::counterpart).unwrap_or(PeerRole::Client);
            let (quality, transport) = match state.quality {
                Some((quality, transport)) => (Some(quality), transport),
                None => (None, None),
            };
            let info = PeerInfo {
                id: peer_id.clone(),
                name: peer_name,
                role,
                connected_at: now_millis(),
                capabilities,
                connection_quality: quality,
                transport_kind: transport,
            };
            match state.peers.insert(peer_id.clone(), info.clone()) {
                None => {
                    info!("Peer {} ({}) joined", info.name, peer_id);
                    vec![Action::Emit(SessionEvent::PeerJoined(info))]
                }
                Some(_) => {
                    debug!("Peer {} re-announced itself", peer_id);
                    Vec::new()
                }
            }
        }
        MessageBody::PeerLeave { peer_id } => {
            let from_host = state.role == Some(PeerRole::Client)
                && state
                    .room
                    .as_ref()
                    .is_some_and(|room| room.host_id == sender_id);
            if peer_id == local_id {
                if !from_host {
                    warn!("Ignoring removal sent by {}: only the host can kick", sender_id);
                    return Vec::new();
                }
                info!("Kicked by {}", sender_id);
                return vec![Action::Leave(SessionEvent::Kicked)];
            }
            if peer_id != sender_id {
                warn!("Ignoring leave for {} sent by {}", peer_id, sender_id);
                return Vec::new();
            }
            if from_host {
                info!("Host {} closed the room", peer_id);
                return vec![Action::Leave(SessionEvent::RoomClosed)];
            }
            match state.forget_peer(&peer_id, limiter) {
                Some(_) => {
                    info!("Peer {} left", peer_id);
                    vec![Action::Emit(SessionEvent::PeerLeft(peer_id))]
                }
                None => Vec::new(),
            }
        }
        MessageBody::IceCandidate { candidate } => vec![Action::AddCandidate(candidate)],
        MessageBody::ImageChunk {
            transfer_id,
            chunk_index,
            total_chunks,
            data,
        } => match state
            .reassembler
            .receive(&sender_id, &transfer_id, chunk_index, total_chunks, data)
        {
            ChunkOutcome::Complete(data) => {
                info!("Image {} from {} received ({} bytes)", transfer_id, sender_id, data.len());
                vec![Action::Emit(SessionEvent::ImageReceived {
                    sender_id,
                    transfer_id,
                    data,
                })]
            }
            ChunkOutcome::Rejected(reason) => {
                debug!("Chunk of {} from {} rejected: {}", transfer_id, sender_id, reason);
                Vec::new()
            }
            ChunkOutcome::Pending { .. } | ChunkOutcome::Duplicate => Vec::new(),
        },
        MessageBody::ImageRequest { transfer_id } => {
            vec![Action::Emit(SessionEvent::ImageRequested {
                sender_id,
                transfer_id,
            })]
        }
        MessageBody::ImageComplete { transfer_id } => {
            state.reassembler.complete(&sender_id, &transfer_id);
            Vec::new()
        }
        MessageBody::CrdtEnvelope {
            target_peer_id,
            payload,
        } => vec![Action::Emit(SessionEvent::CrdtMessage {
            sender_id,
            target_id: target_peer_id,
            payload,
        })],
    }
}

/// Whether a message may enter the session at all
///
/// The channel carries exactly one remote peer. Until that peer has announced
/// itself with a `PeerJoin` naming its own id, nothing else is accepted; after
/// that, messages claiming any other sender are dropped.
fn accepts_sender(state: &SessionState, sender_id: &str, body: &MessageBody) -> bool {
    if let MessageBody::PeerJoin { peer_id, .. } = body {
        if peer_id != sender_id {
            warn!("Rejecting announcement of {} sent by {}", peer_id, sender_id);
            return false;
        }
    }

    match &state.remote {
        Some(remote) if remote == sender_id => true,
        Some(remote) => {
            warn!(
                "Dropping {} from {}: channel belongs to {}",
                body.kind(),
                sender_id,
                remote
            );
            false
        }
        None if !matches!(body, MessageBody::PeerJoin { .. }) => {
            debug!("Dropping {} from {}: peer has not joined", body.kind(), sender_id);
            false
        }
        None => {
            let expected_host = state
                .room
                .as_ref()
                .filter(|_| state.role == Some(PeerRole::Client))
                .map(|room| room.host_id.as_str());
            match expected_host {
                Some(host_id) if host_id != sender_id => {
                    warn!("Rejecting join from {}: room is hosted by {}", sender_id, host_id);
                    false
                }
                _ => true,
            }
        }
    }
}

/// Delete the room (host) or give up our seat (client)
async fn release_room(store: &dyn SignalingStore, cleanup: Option<StoreCleanup>) {
    let Some(StoreCleanup { code, role }) = cleanup else {
        return;
    };
    let result = match role {
        PeerRole::Host => store.delete_room(&code).await.map(|_| ()),
        PeerRole::Client => store.decrement_peer_count(&code).await.map(|_| ()),
    };
    match result {
        Ok(()) => debug!("Released room {} as {:?}", code, role),
        Err(e) => debug!("Room {} cleanup skipped: {}", code, e),
    }
}

/// Drive one channel: inbound frames and connectivity changes
///
/// Queued frames are handled before a state change, so a `PeerLeave` sent
/// just ahead of a close is still seen.
async fn drive_channel(
    inner: Weak<Inner>,
    generation: u64,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    mut state: watch::Receiver<ChannelState>,
) {
    loop {
        tokio::select! {
            biased;

            frame = frames.recv() => {
                let Some(session) = inner.upgrade() else {
                    return;
                };
                match frame {
                    Some(frame) => session.handle_frame(generation, frame).await,
                    None => {
                        session.depart(generation, None);
                        return;
                    }
                }
            }
            changed = state.changed() => {
                if changed.is_err() {
                    return;
                }
                let current = *state.borrow_and_update();
                let Some(session) = inner.upgrade() else {
                    return;
                };
                match current {
                    ChannelState::Open => session.on_open(generation),
                    ChannelState::Closed => {
                        info!("Channel closed");
                        session.depart(generation, None);
                        return;
                    }
                    ChannelState::Failed => {
                        session.fail(generation, SessionError::Transport("channel failed".into()));
                        return;
                    }
                    ChannelState::New | ChannelState::Connecting => {}
                }
            }
        }
    }
}

async fn pump_signaling(
    inner: Weak<Inner>,
    generation: u64,
    mut events: broadcast::Receiver<SignalingEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Missed {} signaling events", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(session) = inner.upgrade() else {
            return;
        };

        match event {
            SignalingEvent::AnswerApplied => debug!("Answer applied, waiting for the channel"),
            SignalingEvent::LocalCandidate(candidate) => {
                let connection = {
                    let state = session.state.lock();
                    if state.generation != generation {
                        return;
                    }
                    state.connection.clone()
                };
                if let Some(connection) = connection {
                    session.transmit(&connection, MessageBody::IceCandidate { candidate });
                }
            }
            SignalingEvent::Quality { quality, transport } => {
                session.on_quality(generation, quality, transport)
            }
            SignalingEvent::Failed(error) => {
                session.fail(generation, error);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(role: PeerRole) -> SessionState {
        let mut state = SessionState::new(&Config::default());
        state.role = Some(role);
        state
    }

    /// Session whose channel already belongs to `remote`
    fn bound(role: PeerRole, remote: &str) -> SessionState {
        let mut state = state(role);
        state.remote = Some(remote.to_string());
        state
    }

    fn join(sender: &str, peer_id: &str) -> Message {
        Message::new(
            sender,
            MessageBody::PeerJoin {
                peer_id: peer_id.into(),
                peer_name: peer_id.to_uppercase(),
                capabilities: Vec::new(),
            },
        )
    }

    fn leave(sender: &str, peer_id: &str) -> Message {
        Message::new(sender, MessageBody::PeerLeave { peer_id: peer_id.into() })
    }

    fn sync(sender: &str, sequence: u64) -> Message {
        Message::new(
            sender,
            MessageBody::Sync {
                board_id: "b1".into(),
                delta: Bytes::from_static(&[1, 2, 3]),
                sequence,
            },
        )
    }

    fn emitted(actions: &[Action]) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, Action::Emit(_)))
            .count()
    }

    #[test]
    fn test_stale_sequence_dropped() {
        let mut state = bound(PeerRole::Client, "peer");
        let limiter = RateLimiter::new();

        assert_eq!(emitted(&route(&mut state, "me", &limiter, sync("peer", 1))), 1);
        assert_eq!(emitted(&route(&mut state, "me", &limiter, sync("peer", 2))), 1);
        assert_eq!(emitted(&route(&mut state, "me", &limiter, sync("peer", 2))), 0);
        assert_eq!(emitted(&route(&mut state, "me", &limiter, sync("peer", 1))), 0);
        assert_eq!(state.watermarks.get("peer"), Some(&2));
    }

    #[test]
    fn test_sequence_gap_tolerated() {
        let mut state = bound(PeerRole::Client, "peer");
        let limiter = RateLimiter::new();

        route(&mut state, "me", &limiter, sync("peer", 1));
        assert_eq!(emitted(&route(&mut state, "me", &limiter, sync("peer", 5))), 1);
        assert_eq!(state.watermarks.get("peer"), Some(&5));
    }

    #[test]
    fn test_join_binds_channel() {
        let mut state = state(PeerRole::Host);
        let limiter = RateLimiter::new();

        // Nothing is accepted before the peer announces itself
        assert_eq!(emitted(&route(&mut state, "me", &limiter, sync("guest", 1))), 0);
        // An announcement on behalf of someone else is refused
        assert_eq!(emitted(&route(&mut state, "me", &limiter, join("guest", "ghost"))), 0);
        assert!(state.remote.is_none());

        assert_eq!(emitted(&route(&mut state, "me", &limiter, join("guest", "guest"))), 1);
        assert_eq!(state.remote.as_deref(), Some("guest"));
        assert_eq!(emitted(&route(&mut state, "me", &limiter, sync("guest", 1))), 1);

        // A second identity on the same channel is ignored
        assert_eq!(emitted(&route(&mut state, "me", &limiter, join("other", "other"))), 0);
        assert_eq!(emitted(&route(&mut state, "me", &limiter, sync("other", 1))), 0);
        assert_eq!(state.peers.len(), 1);
        assert_eq!(state.watermarks.len(), 1);
    }

    #[test]
    fn test_client_only_accepts_host_join() {
        let mut state = state(PeerRole::Client);
        state.room = Some(ActiveRoom {
            code: RoomCode::parse("TIER-ABCDEF").unwrap(),
            host_id: "host".into(),
        });
        let limiter = RateLimiter::new();

        assert_eq!(emitted(&route(&mut state, "me", &limiter, join("imposter", "imposter"))), 0);
        assert_eq!(emitted(&route(&mut state, "me", &limiter, join("host", "host"))), 1);
        assert_eq!(state.peers.get("host").map(|p| p.role), Some(PeerRole::Host));
    }

    #[test]
    fn test_rotating_sender_ids_cannot_evade_limits() {
        let mut state = state(PeerRole::Host);
        let limiter = RateLimiter::new();
        route(&mut state, "me", &limiter, join("peer", "peer"));

        let admitted: usize = (0..500)
            .map(|n| {
                let message = Message::new(
                    format!("spoof-{}", n),
                    MessageBody::SyncRequest {
                        board_id: "b1".into(),
                    },
                );
                emitted(&route(&mut state, "me", &limiter, message))
            })
            .sum();
        assert_eq!(admitted, 0);
        assert_eq!(limiter.stats().total_tracked, 1);

        // Announcing made-up peers from the bound id does not grow the table
        for n in 0..500 {
            route(&mut state, "me", &limiter, join("peer", &format!("ghost-{}", n)));
        }
        assert_eq!(state.peers.len(), 1);
        assert!(state.peers.contains_key("peer"));
    }

    #[test]
    fn test_rate_limited_messages_dropped() {
        let mut state = bound(PeerRole::Host, "peer");
        let limiter = RateLimiter::new();

        let admitted: usize = (1..=25)
            .map(|seq| emitted(&route(&mut state, "me", &limiter, sync("peer", seq))))
            .sum();
        assert_eq!(admitted, 20);
    }

    #[test]
    fn test_image_chunks_bypass_limiter() {
        let mut state = bound(PeerRole::Host, "peer");
        let limiter = RateLimiter::new();
        let data = Bytes::from(vec![7u8; 40 * 1024]);

        let mut completed = 0;
        for message in transfer_messages("peer", "img", &data, 1024) {
            completed += emitted(&route(&mut state, "me", &limiter, message));
        }
        assert_eq!(completed, 1);
    }

    #[test]
    fn test_full_sync_target_filtered() {
        let mut state = bound(PeerRole::Client, "peer");
        let limiter = RateLimiter::new();
        let full = |target: Option<&str>| {
            Message::new(
                "peer",
                MessageBody::FullSync {
                    board_id: "b1".into(),
                    document: Bytes::from_static(b"doc"),
                    target_peer_id: target.map(str::to_string),
                },
            )
        };

        assert_eq!(emitted(&route(&mut state, "me", &limiter, full(Some("me")))), 1);
        assert_eq!(emitted(&route(&mut state, "me", &limiter, full(None))), 1);
        assert_eq!(emitted(&route(&mut state, "me", &limiter, full(Some("other")))), 0);
    }

    #[test]
    fn test_peer_leave_meanings() {
        let limiter = RateLimiter::new();
        let mut client = bound(PeerRole::Client, "host");
        client.room = Some(ActiveRoom {
            code: RoomCode::parse("TIER-ABCDEF").unwrap(),
            host_id: "host".into(),
        });

        let kicked = route(&mut client, "me", &limiter, leave("host", "me"));
        assert!(matches!(kicked.as_slice(), [Action::Leave(SessionEvent::Kicked)]));

        let closed = route(&mut client, "me", &limiter, leave("host", "host"));
        assert!(matches!(closed.as_slice(), [Action::Leave(SessionEvent::RoomClosed)]));

        let mut host = state(PeerRole::Host);
        host.room = Some(ActiveRoom {
            code: RoomCode::parse("TIER-ABCDEF").unwrap(),
            host_id: "me".into(),
        });
        route(&mut host, "me", &limiter, join("guest", "guest"));
        assert_eq!(host.peers.get("guest").map(|p| p.role), Some(PeerRole::Client));

        // A guest cannot remove the host, nor speak for another peer
        assert!(route(&mut host, "me", &limiter, leave("guest", "me")).is_empty());
        assert!(route(&mut host, "me", &limiter, leave("guest", "someone")).is_empty());
        assert_eq!(host.peers.len(), 1);

        let left = route(&mut host, "me", &limiter, leave("guest", "guest"));
        assert!(matches!(left.as_slice(), [Action::Emit(SessionEvent::PeerLeft(id))] if id == "guest"));
        assert!(host.peers.is_empty());
    }

    #[test]
    fn test_departed_sender_transfers_purged() {
        let mut state = bound(PeerRole::Host, "guest");
        let limiter = RateLimiter::new();
        let chunk = Message::new(
            "guest",
            MessageBody::ImageChunk {
                transfer_id: "img".into(),
                chunk_index: 0,
                total_chunks: 2,
                data: Bytes::from_static(b"half"),
            },
        );
        route(&mut state, "me", &limiter, chunk);
        assert_eq!(state.reassembler.pending_count(), 1);

        route(&mut state, "me", &limiter, leave("guest", "guest"));
        assert_eq!(state.reassembler.pending_count(), 0);
    }

    #[test]
    fn test_own_messages_ignored() {
        let mut state = bound(PeerRole::Host, "peer");
        let limiter = RateLimiter::new();
        assert!(route(&mut state, "me", &limiter, sync("me", 1)).is_empty());
    }
}
