//! Offer/answer/candidate exchange through a signaling store
//!
//! Neither side holds a live connection to the store. The host writes its
//! offer and polls for the answer; both sides poll for the other's
//! candidates until the channel reports open. Candidates gathered after the
//! channel opens are handed to the session to travel over the channel itself.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use tierlink_core::room_code::{try_hash_password, verify_password};
use tierlink_core::types::{
    CandidateSide, ConnectionQuality, IceCandidate, PeerId, PeerRole, SessionDescription,
    TransportKind,
};
use tierlink_core::{Config, RateLimiter, RoomCode, SessionConfig, SessionError};
use tierlink_signal::{Room, SignalingStore, StoreError};

use crate::transport::{ChannelState, NegotiationChannel, PeerConnection, TransportError};

/// Attempts at finding an unused room code before giving up
const CODE_ATTEMPTS: usize = 5;

/// Options for creating a room
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateRoomOptions {
    /// Board document URL embedded in the long room code
    pub document_url: Option<String>,
    /// Clients must present this password to join
    pub password: Option<String>,
}

/// Outcome of a successful join
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinResult {
    pub code: RoomCode,
    pub host_id: PeerId,
    pub document_url: Option<String>,
}

/// Progress reported by the background exchange tasks
#[derive(Clone, Debug)]
pub enum SignalingEvent {
    /// Host applied the client's answer
    AnswerApplied,
    /// Candidate gathered after the channel opened
    LocalCandidate(IceCandidate),
    /// Channel opened; tier derived from the candidates seen
    Quality {
        quality: ConnectionQuality,
        transport: Option<TransportKind>,
    },
    /// The exchange failed after the create/join call returned
    Failed(SessionError),
}

/// Remote candidates seen during one negotiation
#[derive(Default)]
struct RemoteCandidates {
    described: bool,
    buffered: Vec<IceCandidate>,
    seen: HashSet<String>,
    /// Candidate lines from both sides, for quality classification
    observed: Vec<String>,
}

/// One negotiation attempt
struct Negotiation {
    code: String,
    role: PeerRole,
    connection: Arc<dyn PeerConnection>,
    state: watch::Receiver<ChannelState>,
    remote: Mutex<RemoteCandidates>,
}

impl Negotiation {
    fn local_side(&self) -> CandidateSide {
        self.role.into()
    }

    fn remote_side(&self) -> CandidateSide {
        self.role.counterpart().into()
    }

    fn is_open(&self) -> bool {
        *self.state.borrow() == ChannelState::Open
    }

    fn observe_local(&self, candidate: &IceCandidate) {
        self.remote.lock().observed.push(candidate.candidate.clone());
    }

    /// Apply a remote candidate exactly once
    ///
    /// Candidates that arrive before the remote description are buffered.
    async fn apply_remote(&self, candidate: IceCandidate) -> Result<bool, TransportError> {
        {
            let mut remote = self.remote.lock();
            if !remote.seen.insert(candidate.dedup_key()) {
                return Ok(false);
            }
            remote.observed.push(candidate.candidate.clone());
            if !remote.described {
                remote.buffered.push(candidate);
                return Ok(true);
            }
        }

        match self.connection.add_remote_candidate(candidate.clone()).await {
            Ok(()) => Ok(true),
            Err(TransportError::NoRemoteDescription) => {
                self.remote.lock().buffered.push(candidate);
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Remote description applied: flush buffered candidates
    async fn mark_described(&self) {
        let buffered = {
            let mut remote = self.remote.lock();
            remote.described = true;
            std::mem::take(&mut remote.buffered)
        };
        for candidate in buffered {
            if let Err(e) = self.connection.add_remote_candidate(candidate).await {
                warn!("Buffered candidate rejected for {}: {}", self.code, e);
            }
        }
    }

    fn quality(&self) -> (ConnectionQuality, Option<TransportKind>) {
        let remote = self.remote.lock();
        ConnectionQuality::classify(remote.observed.iter().map(String::as_str))
    }
}

/// Drives one room's signaling exchange at a time
pub struct SignalingSession {
    store: Arc<dyn SignalingStore>,
    config: SessionConfig,
    max_peers: u32,
    room_ttl: Duration,
    join_limiter: RateLimiter,
    events: broadcast::Sender<SignalingEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    negotiation: Mutex<Option<Arc<Negotiation>>>,
}

impl SignalingSession {
    pub fn new(store: Arc<dyn SignalingStore>, config: &Config) -> Self {
        let (events, _) = broadcast::channel(config.session.event_capacity.max(1));
        Self {
            store,
            config: config.session.clone(),
            max_peers: config.signal.max_peers_per_room,
            room_ttl: Duration::from_secs(config.signal.room_ttl_secs),
            join_limiter: RateLimiter::with_config(config.limits.joins()),
            events,
            tasks: Mutex::new(Vec::new()),
            negotiation: Mutex::new(None),
        }
    }

    /// Subscribe to background exchange events
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<dyn SignalingStore> {
        &self.store
    }

    /// Allocate a room, publish an offer, and start polling for the answer
    pub async fn host_create_room(
        &self,
        host_id: &str,
        channel: NegotiationChannel,
        options: &CreateRoomOptions,
    ) -> Result<RoomCode, SessionError> {
        self.stop();

        let code = self.allocate_room(host_id, options).await?;
        let short = code.short_code().to_string();

        match self.publish_offer(&short, channel).await {
            Ok(()) => {
                info!("Room {} created, waiting for a peer", short);
                Ok(code)
            }
            Err(e) => {
                self.stop();
                if let Err(cleanup) = self.store.delete_room(&short).await {
                    warn!("Failed to roll back room {}: {}", short, cleanup);
                }
                Err(e)
            }
        }
    }

    async fn allocate_room(
        &self,
        host_id: &str,
        options: &CreateRoomOptions,
    ) -> Result<RoomCode, SessionError> {
        let password_hash = options
            .password
            .as_deref()
            .map(try_hash_password)
            .transpose()
            .map_err(|e| SessionError::Store(format!("password hashing failed: {}", e)))?;

        for _ in 0..CODE_ATTEMPTS {
            let code = RoomCode::try_generate()
                .map_err(|e| SessionError::Store(format!("room code generation failed: {}", e)))?;
            let room = Room::new(code.short_code(), host_id, self.room_ttl)
                .with_document_url(options.document_url.clone())
                .with_password_hash(password_hash.clone());

            match self.store.create_room(room).await {
                Ok(()) => {
                    return Ok(match &options.document_url {
                        Some(url) => code.with_document_url(url.clone()),
                        None => code,
                    })
                }
                Err(StoreError::AlreadyExists(taken)) => {
                    debug!("Room code {} already taken, regenerating", taken);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SessionError::Store("no free room code".into()))
    }

    async fn publish_offer(&self, code: &str, channel: NegotiationChannel) -> Result<(), SessionError> {
        let NegotiationChannel {
            connection,
            local_candidates,
            state,
        } = channel;

        let offer = connection.create_offer().await?;
        self.wait_gathering(&connection).await;
        self.store.set_offer(code, offer).await?;

        let negotiation = self.begin(code, PeerRole::Host, connection, state);
        self.spawn(pump_local_candidates(
            negotiation.clone(),
            self.store.clone(),
            self.events.clone(),
            local_candidates,
        ));
        self.spawn(poll_answer(
            negotiation.clone(),
            self.store.clone(),
            self.events.clone(),
            self.config.clone(),
        ));
        self.spawn(poll_candidates(
            negotiation,
            self.store.clone(),
            self.events.clone(),
            self.config.candidate_poll(),
        ));
        Ok(())
    }

    /// Join an existing room and answer its offer
    pub async fn client_join_room(
        &self,
        code: &RoomCode,
        password: Option<&str>,
        channel: NegotiationChannel,
    ) -> Result<JoinResult, SessionError> {
        self.stop();
        let short = code.short_code().to_string();

        self.join_limiter.cleanup_expired();
        if !self.join_limiter.admit(&short) {
            warn!("Join attempts for {} exceeded the limit", short);
            return Err(SessionError::RateLimited(short));
        }

        let room = self.store.require_room(&short).await?;
        if let Some(stored) = room.password_hash.as_deref() {
            match password {
                Some(password) if verify_password(password, stored) => {}
                Some(_) => return Err(SessionError::Unauthorized("wrong room password".into())),
                None => return Err(SessionError::Unauthorized("room requires a password".into())),
            }
        }

        let peers = self.store.increment_peer_count(&short, self.max_peers).await?;
        debug!("Joined {} as peer {} of {}", short, peers, self.max_peers);

        match self.answer_offer(&short, channel).await {
            Ok(()) => {
                let document_url = code
                    .document_url()
                    .map(str::to_string)
                    .or(room.document_url);
                info!("Answer submitted for {}", short);
                Ok(JoinResult {
                    code: code.clone(),
                    host_id: room.host_id,
                    document_url,
                })
            }
            Err(e) => {
                self.stop();
                if let Err(cleanup) = self.store.decrement_peer_count(&short).await {
                    debug!("Failed to release seat in {}: {}", short, cleanup);
                }
                Err(e)
            }
        }
    }

    async fn answer_offer(&self, code: &str, channel: NegotiationChannel) -> Result<(), SessionError> {
        let NegotiationChannel {
            connection,
            local_candidates,
            state,
        } = channel;

        let offer = self.poll_offer(code).await?;
        let answer = connection.create_answer(offer).await?;

        let negotiation = self.begin(code, PeerRole::Client, connection.clone(), state);
        negotiation.mark_described().await;

        self.wait_gathering(&connection).await;
        self.store.set_answer(code, answer).await?;

        self.spawn(pump_local_candidates(
            negotiation.clone(),
            self.store.clone(),
            self.events.clone(),
            local_candidates,
        ));
        self.spawn(poll_candidates(
            negotiation,
            self.store.clone(),
            self.events.clone(),
            self.config.candidate_poll(),
        ));
        Ok(())
    }

    /// Bounded poll for the host's offer
    async fn poll_offer(&self, code: &str) -> Result<SessionDescription, SessionError> {
        for attempt in 1..=self.config.offer_poll_attempts {
            if let Some(offer) = self.store.get_offer(code).await? {
                return Ok(offer);
            }
            debug!(
                "No offer in {} yet (attempt {}/{})",
                code, attempt, self.config.offer_poll_attempts
            );
            sleep(self.config.offer_poll_interval()).await;
        }
        Err(SessionError::Timeout("offer".into()))
    }

    async fn wait_gathering(&self, connection: &Arc<dyn PeerConnection>) {
        let wait = self.config.gathering_timeout();
        if timeout(wait, connection.wait_gathering_complete()).await.is_err() {
            warn!("Candidate gathering still running after {:?}, proceeding", wait);
        }
    }

    /// Apply a candidate the remote trickled over the channel
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<bool, SessionError> {
        let negotiation = self.negotiation.lock().clone();
        match negotiation {
            Some(negotiation) => Ok(negotiation.apply_remote(candidate).await?),
            None => {
                debug!("Dropping trickled candidate: no negotiation in progress");
                Ok(false)
            }
        }
    }

    /// Stop every polling task and forget the current negotiation
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(negotiation) = self.negotiation.lock().take() {
            debug!("Signaling for {} stopped", negotiation.code);
        }
    }

    /// Whether background tasks are still polling
    pub fn is_active(&self) -> bool {
        self.tasks.lock().iter().any(|task| !task.is_finished())
    }

    fn begin(
        &self,
        code: &str,
        role: PeerRole,
        connection: Arc<dyn PeerConnection>,
        state: watch::Receiver<ChannelState>,
    ) -> Arc<Negotiation> {
        let negotiation = Arc::new(Negotiation {
            code: code.to_string(),
            role,
            connection,
            state,
            remote: Mutex::new(RemoteCandidates::default()),
        });
        *self.negotiation.lock() = Some(negotiation.clone());
        negotiation
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().push(tokio::spawn(task));
    }
}

impl Drop for SignalingSession {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Publish local candidates: to the store while negotiating, as events once open
async fn pump_local_candidates(
    negotiation: Arc<Negotiation>,
    store: Arc<dyn SignalingStore>,
    events: broadcast::Sender<SignalingEvent>,
    mut candidates: mpsc::UnboundedReceiver<IceCandidate>,
) {
    let side = negotiation.local_side();
    while let Some(candidate) = candidates.recv().await {
        negotiation.observe_local(&candidate);

        if negotiation.is_open() {
            let _ = events.send(SignalingEvent::LocalCandidate(candidate));
            continue;
        }

        if let Err(e) = store
            .append_candidate(&negotiation.code, side, candidate)
            .await
        {
            warn!("Failed to publish {} candidate: {}", side.as_str(), e);
            let _ = events.send(SignalingEvent::Failed(e.into()));
            return;
        }
    }
}

/// Host side: wait for the client's answer, then for the channel to open
async fn poll_answer(
    negotiation: Arc<Negotiation>,
    store: Arc<dyn SignalingStore>,
    events: broadcast::Sender<SignalingEvent>,
    config: SessionConfig,
) {
    let deadline = Instant::now() + config.answer_timeout();

    let answer = loop {
        if Instant::now() >= deadline {
            warn!("No answer for {} within {:?}", negotiation.code, config.answer_timeout());
            let _ = events.send(SignalingEvent::Failed(SessionError::Timeout("answer".into())));
            return;
        }
        match store.get_answer(&negotiation.code).await {
            Ok(Some(answer)) => break answer,
            Ok(None) => sleep(config.answer_poll()).await,
            Err(e) => {
                warn!("Answer poll for {} failed: {}", negotiation.code, e);
                let _ = events.send(SignalingEvent::Failed(e.into()));
                return;
            }
        }
    };

    if let Err(e) = negotiation.connection.accept_answer(answer).await {
        let _ = events.send(SignalingEvent::Failed(e.into()));
        return;
    }
    negotiation.mark_described().await;
    info!("Answer applied for {}", negotiation.code);
    let _ = events.send(SignalingEvent::AnswerApplied);

    let mut state = negotiation.state.clone();
    let settled = timeout(
        config.connect_timeout(),
        state.wait_for(|s| *s == ChannelState::Open || s.is_terminal()),
    )
    .await
    .is_ok();
    if !settled {
        warn!(
            "Channel for {} not open after {:?}, still waiting",
            negotiation.code,
            config.connect_timeout()
        );
    }
}

/// Both sides: apply the remote's stored candidates until the channel opens
async fn poll_candidates(
    negotiation: Arc<Negotiation>,
    store: Arc<dyn SignalingStore>,
    events: broadcast::Sender<SignalingEvent>,
    interval: Duration,
) {
    let side = negotiation.remote_side();
    let mut state = negotiation.state.clone();

    loop {
        let current = *state.borrow_and_update();
        if current == ChannelState::Open {
            let (quality, transport) = negotiation.quality();
            info!(
                "Channel for {} open ({:?}, {:?})",
                negotiation.code, quality, transport
            );
            let _ = events.send(SignalingEvent::Quality { quality, transport });
            return;
        }
        if current.is_terminal() {
            debug!("Channel for {} ended during negotiation", negotiation.code);
            return;
        }

        match store.get_candidates(&negotiation.code, side).await {
            Ok(candidates) => {
                for candidate in candidates {
                    if let Err(e) = negotiation.apply_remote(candidate).await {
                        warn!("Remote candidate rejected for {}: {}", negotiation.code, e);
                    }
                }
            }
            Err(e) => {
                warn!("Candidate poll for {} failed: {}", negotiation.code, e);
                let _ = events.send(SignalingEvent::Failed(e.into()));
                return;
            }
        }

        tokio::select! {
            _ = sleep(interval) => {}
            changed = state.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
