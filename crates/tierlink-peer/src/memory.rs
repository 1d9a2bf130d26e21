//! In-process transport
//!
//! `MemoryNetwork` is an explicit switchboard: an answer names the offering
//! endpoint, and the two are linked. The pair opens once each end has a remote
//! description and at least one remote candidate. Closing either end closes
//! both.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use tierlink_core::types::{IceCandidate, SessionDescription};
use tierlink_core::Frame;

use crate::transport::{
    ChannelState, OpenedConnection, PeerConnection, PeerConnector, TransportError,
};

const SDP_PREFIX: &str = "memory:";

/// Switchboard shared by every endpoint it opens
#[derive(Clone)]
pub struct MemoryNetwork {
    board: Arc<Switchboard>,
}

struct Switchboard {
    endpoints: Mutex<HashMap<u64, Weak<MemoryEndpoint>>>,
    next_id: AtomicU64,
    frames_sent: AtomicUsize,
    opens_to_fail: AtomicUsize,
    candidate_types: Vec<String>,
    gathering_delay: Duration,
}

impl MemoryNetwork {
    /// Every endpoint advertises a single host candidate
    pub fn new() -> Self {
        Self::with_candidate_types(&["host"])
    }

    /// Endpoints advertise one candidate per listed type (`host`, `srflx`, `relay`)
    pub fn with_candidate_types(types: &[&str]) -> Self {
        Self::build(types.iter().map(|t| t.to_string()).collect(), Duration::ZERO)
    }

    /// Gathering takes `delay` to report completion
    pub fn with_gathering_delay(self, delay: Duration) -> Self {
        Self::build(self.board.candidate_types.clone(), delay)
    }

    fn build(candidate_types: Vec<String>, gathering_delay: Duration) -> Self {
        Self {
            board: Arc::new(Switchboard {
                endpoints: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                frames_sent: AtomicUsize::new(0),
                opens_to_fail: AtomicUsize::new(0),
                candidate_types,
                gathering_delay,
            }),
        }
    }

    /// Total frames accepted by any endpoint's `send`
    pub fn frames_sent(&self) -> usize {
        self.board.frames_sent.load(Ordering::SeqCst)
    }

    /// Make the next `n` calls to `open` fail
    pub fn fail_next_opens(&self, n: usize) {
        self.board.opens_to_fail.store(n, Ordering::SeqCst);
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerConnector for MemoryNetwork {
    async fn open(&self) -> Result<OpenedConnection, TransportError> {
        let fail = self
            .board
            .opens_to_fail
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(TransportError::Negotiation("connection refused".into()));
        }

        let id = self.board.next_id.fetch_add(1, Ordering::SeqCst);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (candidates_tx, candidates_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ChannelState::New);

        let endpoint = Arc::new(MemoryEndpoint {
            id,
            board: self.board.clone(),
            state_tx,
            inbound: frames_tx,
            candidates: candidates_tx,
            link: Mutex::new(Link::default()),
        });
        self.board
            .endpoints
            .lock()
            .insert(id, Arc::downgrade(&endpoint));
        debug!("Memory endpoint {} opened", id);

        Ok(OpenedConnection {
            connection: endpoint,
            frames: frames_rx,
            local_candidates: candidates_rx,
            state: state_rx,
        })
    }
}

#[derive(Default)]
struct Link {
    remote: Option<Weak<MemoryEndpoint>>,
    described: bool,
    remote_candidates: usize,
}

/// One end of an in-process channel
pub struct MemoryEndpoint {
    id: u64,
    board: Arc<Switchboard>,
    state_tx: watch::Sender<ChannelState>,
    /// Frames the peer sends land here
    inbound: mpsc::UnboundedSender<Frame>,
    candidates: mpsc::UnboundedSender<IceCandidate>,
    link: Mutex<Link>,
}

impl MemoryEndpoint {
    fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, next: ChannelState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == next || current.is_terminal() {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            debug!("Memory endpoint {} -> {:?}", self.id, next);
        }
    }

    fn peer(&self) -> Option<Arc<MemoryEndpoint>> {
        self.link.lock().remote.as_ref().and_then(Weak::upgrade)
    }

    fn lookup(&self, desc: &SessionDescription) -> Result<Arc<MemoryEndpoint>, TransportError> {
        let id = desc
            .sdp
            .strip_prefix(SDP_PREFIX)
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| TransportError::Negotiation(format!("unrecognised sdp `{}`", desc.sdp)))?;

        self.board
            .endpoints
            .lock()
            .get(&id)
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransportError::Negotiation(format!("endpoint {} is gone", id)))
    }

    fn link_to(&self, remote: &Arc<MemoryEndpoint>) {
        let mut link = self.link.lock();
        link.remote = Some(Arc::downgrade(remote));
        link.described = true;
    }

    fn gather(&self) {
        for (n, kind) in self.board.candidate_types.iter().enumerate() {
            let line = format!(
                "candidate:{n} 1 udp {prio} 10.{a}.{b}.{n} {port} typ {kind}",
                n = n + 1,
                prio = 2_122_260_223u32.saturating_sub(n as u32 * 1000),
                a = (self.id >> 8) & 0xff,
                b = self.id & 0xff,
                port = 50_000 + n,
                kind = kind,
            );
            let _ = self.candidates.send(IceCandidate::new(line));
        }
    }

    fn is_ready(&self) -> bool {
        let link = self.link.lock();
        link.described && link.remote_candidates > 0 && link.remote.is_some()
    }

    fn try_open(&self) {
        if !self.is_ready() || self.state().is_terminal() {
            return;
        }
        if let Some(peer) = self.peer() {
            if peer.is_ready() && !peer.state().is_terminal() {
                self.set_state(ChannelState::Open);
                peer.set_state(ChannelState::Open);
            }
        }
    }
}

#[async_trait]
impl PeerConnection for MemoryEndpoint {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.set_state(ChannelState::Connecting);
        self.gather();
        Ok(SessionDescription::offer(format!("{}{}", SDP_PREFIX, self.id)))
    }

    async fn create_answer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        let remote = self.lookup(&offer)?;
        self.link_to(&remote);
        self.set_state(ChannelState::Connecting);
        self.gather();
        Ok(SessionDescription::answer(format!("{}{}", SDP_PREFIX, self.id)))
    }

    async fn accept_answer(&self, answer: SessionDescription) -> Result<(), TransportError> {
        let remote = self.lookup(&answer)?;
        self.link_to(&remote);
        self.try_open();
        Ok(())
    }

    async fn add_remote_candidate(&self, _candidate: IceCandidate) -> Result<(), TransportError> {
        {
            let mut link = self.link.lock();
            if !link.described {
                return Err(TransportError::NoRemoteDescription);
            }
            link.remote_candidates += 1;
        }
        self.try_open();
        Ok(())
    }

    async fn wait_gathering_complete(&self) {
        if !self.board.gathering_delay.is_zero() {
            tokio::time::sleep(self.board.gathering_delay).await;
        }
    }

    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.state() != ChannelState::Open {
            return Err(TransportError::NotOpen);
        }
        let peer = self.peer().ok_or(TransportError::Closed)?;
        peer.inbound.send(frame).map_err(|_| TransportError::Closed)?;
        self.board.frames_sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.set_state(ChannelState::Closed);
        if let Some(peer) = self.peer() {
            peer.set_state(ChannelState::Closed);
        }
        self.board.endpoints.lock().remove(&self.id);
    }
}

impl Drop for MemoryEndpoint {
    fn drop(&mut self) {
        self.board.endpoints.lock().remove(&self.id);
        if let Some(peer) = self.peer() {
            peer.set_state(ChannelState::Closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    async fn connected_pair(network: &MemoryNetwork) -> (OpenedConnection, OpenedConnection) {
        let mut host = network.open().await.unwrap();
        let mut client = network.open().await.unwrap();

        let offer = host.connection.create_offer().await.unwrap();
        let answer = client.connection.create_answer(offer).await.unwrap();
        host.connection.accept_answer(answer).await.unwrap();

        let host_candidate = host.local_candidates.recv().await.unwrap();
        let client_candidate = client.local_candidates.recv().await.unwrap();
        client
            .connection
            .add_remote_candidate(host_candidate)
            .await
            .unwrap();
        host.connection
            .add_remote_candidate(client_candidate)
            .await
            .unwrap();

        (host, client)
    }

    #[tokio::test]
    async fn test_pair_opens_and_carries_frames() {
        let network = MemoryNetwork::new();
        let (host, mut client) = connected_pair(&network).await;

        assert_eq!(*host.state.borrow(), ChannelState::Open);
        assert_eq!(*client.state.borrow(), ChannelState::Open);

        host.connection
            .send(Frame::Binary(Bytes::from_static(b"abc")))
            .unwrap();
        assert_eq!(
            client.frames.recv().await,
            Some(Frame::Binary(Bytes::from_static(b"abc")))
        );
        assert_eq!(network.frames_sent(), 1);
    }

    #[tokio::test]
    async fn test_candidate_before_description_rejected() {
        let network = MemoryNetwork::new();
        let client = network.open().await.unwrap();
        let err = client
            .connection
            .add_remote_candidate(IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 1 typ host"))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::NoRemoteDescription);
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let network = MemoryNetwork::new();
        let host = network.open().await.unwrap();
        assert_eq!(
            host.connection.send(Frame::Text("x".into())),
            Err(TransportError::NotOpen)
        );
        assert_eq!(network.frames_sent(), 0);
    }

    #[tokio::test]
    async fn test_close_closes_both_ends() {
        let network = MemoryNetwork::new();
        let (host, client) = connected_pair(&network).await;

        client.connection.close();
        assert_eq!(*client.state.borrow(), ChannelState::Closed);
        assert_eq!(*host.state.borrow(), ChannelState::Closed);
        assert!(host.connection.send(Frame::Text("x".into())).is_err());
    }

    #[tokio::test]
    async fn test_injected_open_failure() {
        let network = MemoryNetwork::new();
        network.fail_next_opens(1);
        assert!(network.open().await.is_err());
        assert!(network.open().await.is_ok());
    }

    #[tokio::test]
    async fn test_candidate_types() {
        let network = MemoryNetwork::with_candidate_types(&["host", "relay"]);
        let mut host = network.open().await.unwrap();
        host.connection.create_offer().await.unwrap();

        let first = host.local_candidates.recv().await.unwrap();
        let second = host.local_candidates.recv().await.unwrap();
        assert!(first.candidate.ends_with("typ host"));
        assert!(second.candidate.ends_with("typ relay"));
    }
}
