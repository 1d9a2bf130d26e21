//! Bridge between a peer session and a CRDT replication engine
//!
//! The engine sees the usual network contract: `ready`, `peer-candidate`,
//! `peer-disconnected` and `message` events, plus `send` and `disconnect`.
//!
//! A 1:1 room has a single remote endpoint, so `send` broadcasts an envelope
//! that carries its target, and the receiving adapter drops envelopes that are
//! not addressed to it. Rooms with more than two peers would need per-peer
//! channels or a relay.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tierlink_core::types::{PeerId, PeerInfo, SessionStatus};

use crate::session::{PeerSession, SessionEvent};

/// Message exchanged with the replication engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepoMessage {
    pub sender_id: PeerId,
    pub target_id: PeerId,
    pub data: Bytes,
}

/// Events delivered to the replication engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkEvent {
    Ready,
    PeerCandidate { peer_id: PeerId, peer_name: String },
    PeerDisconnected { peer_id: PeerId },
    Message(RepoMessage),
    Close,
}

struct Attachment {
    local_id: PeerId,
    events: mpsc::UnboundedSender<NetworkEvent>,
    task: JoinHandle<()>,
}

/// Network adapter over one [`PeerSession`]
pub struct CrdtNetworkAdapter {
    session: PeerSession,
    ready: Arc<AtomicBool>,
    attachment: Mutex<Option<Attachment>>,
}

impl CrdtNetworkAdapter {
    pub fn new(session: PeerSession) -> Self {
        Self {
            session,
            ready: Arc::new(AtomicBool::new(false)),
            attachment: Mutex::new(None),
        }
    }

    pub fn session(&self) -> &PeerSession {
        &self.session
    }

    /// Attach the engine under `local_id`
    ///
    /// Peers already known to the session are replayed as `PeerCandidate`
    /// events, followed by `Ready` if the session is connected. Envelopes are
    /// routed by peer id, so `local_id` should be the session's own id.
    pub fn connect(&self, local_id: impl Into<PeerId>) -> mpsc::UnboundedReceiver<NetworkEvent> {
        self.disconnect();

        let local_id = local_id.into();
        if local_id != self.session.local_id() {
            warn!(
                "Adapter attached as {} but the session is {}; envelopes are addressed to the session id",
                local_id,
                self.session.local_id()
            );
        }

        // Subscribe before the replay so nothing falls between the two
        let session_events = self.session.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut announced = HashSet::new();
        for peer in self.session.peers() {
            announce(&tx, &mut announced, &peer);
        }
        let connected = self.session.status() == SessionStatus::Connected;
        self.ready.store(connected, Ordering::SeqCst);
        if connected {
            let _ = tx.send(NetworkEvent::Ready);
        }

        let task = tokio::spawn(forward_events(
            session_events,
            tx.clone(),
            local_id.clone(),
            announced,
            self.ready.clone(),
        ));
        info!("Replication adapter attached as {}", local_id);

        *self.attachment.lock() = Some(Attachment {
            local_id,
            events: tx,
            task,
        });
        rx
    }

    /// Route an outbound engine message onto the channel
    pub fn send(&self, message: RepoMessage) -> bool {
        let attached = self
            .attachment
            .lock()
            .as_ref()
            .map(|a| a.local_id.clone());
        match attached {
            Some(local_id) if local_id != message.sender_id => {
                debug!(
                    "Outbound message claims sender {}, adapter is {}",
                    message.sender_id, local_id
                );
            }
            Some(_) => {}
            None => {
                warn!("Replication adapter is not connected, dropping message");
                return false;
            }
        }
        self.session.send_crdt(&message.target_id, message.data)
    }

    /// Detach the engine; it receives a final `Close`
    pub fn disconnect(&self) {
        if let Some(attachment) = self.attachment.lock().take() {
            attachment.task.abort();
            let _ = attachment.events.send(NetworkEvent::Close);
            self.ready.store(false, Ordering::SeqCst);
            info!("Replication adapter {} detached", attachment.local_id);
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

impl Drop for CrdtNetworkAdapter {
    fn drop(&mut self) {
        if let Some(attachment) = self.attachment.get_mut().take() {
            attachment.task.abort();
        }
    }
}

fn announce(
    tx: &mpsc::UnboundedSender<NetworkEvent>,
    announced: &mut HashSet<PeerId>,
    peer: &PeerInfo,
) {
    if announced.insert(peer.id.clone()) {
        let _ = tx.send(NetworkEvent::PeerCandidate {
            peer_id: peer.id.clone(),
            peer_name: peer.name.clone(),
        });
    }
}

async fn forward_events(
    mut session_events: broadcast::Receiver<SessionEvent>,
    tx: mpsc::UnboundedSender<NetworkEvent>,
    local_id: PeerId,
    mut announced: HashSet<PeerId>,
    ready: Arc<AtomicBool>,
) {
    loop {
        let event = match session_events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Replication adapter missed {} session events", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        let delivered = match event {
            SessionEvent::PeerJoined(peer) => {
                announce(&tx, &mut announced, &peer);
                true
            }
            SessionEvent::PeerLeft(peer_id) => {
                if announced.remove(&peer_id) {
                    tx.send(NetworkEvent::PeerDisconnected { peer_id }).is_ok()
                } else {
                    true
                }
            }
            SessionEvent::StatusChanged(SessionStatus::Connected) => {
                if !ready.swap(true, Ordering::SeqCst) {
                    tx.send(NetworkEvent::Ready).is_ok()
                } else {
                    true
                }
            }
            SessionEvent::StatusChanged(SessionStatus::Disconnected | SessionStatus::Failed) => {
                ready.store(false, Ordering::SeqCst);
                let mut ok = true;
                for peer_id in announced.drain() {
                    ok &= tx.send(NetworkEvent::PeerDisconnected { peer_id }).is_ok();
                }
                ok
            }
            SessionEvent::CrdtMessage {
                sender_id,
                target_id,
                payload,
            } => {
                if target_id == local_id {
                    tx.send(NetworkEvent::Message(RepoMessage {
                        sender_id,
                        target_id,
                        data: payload,
                    }))
                    .is_ok()
                } else {
                    debug!("Discarding envelope for {} (we are {})", target_id, local_id);
                    true
                }
            }
            _ => true,
        };

        if !delivered {
            debug!("Replication engine dropped its receiver, adapter stopping");
            return;
        }
    }
}
