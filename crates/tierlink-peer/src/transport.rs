//! Channel capability supplied to the session
//!
//! A `PeerConnector` opens one negotiation attempt. The resulting
//! `PeerConnection` produces and consumes descriptors and candidates, and once
//! open carries frames in order. NAT traversal lives behind these traits.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use tierlink_core::types::{IceCandidate, SessionDescription};
use tierlink_core::{Frame, SessionError};

/// Connectivity of the underlying channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelState {
    New,
    Connecting,
    Open,
    Closed,
    Failed,
}

impl ChannelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Failed)
    }
}

/// Transport errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("channel is not open")]
    NotOpen,

    #[error("channel closed")]
    Closed,

    #[error("remote description has not been applied")]
    NoRemoteDescription,

    #[error("negotiation failed: {0}")]
    Negotiation(String),
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        SessionError::Transport(e.to_string())
    }
}

/// One side of a negotiated channel
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Produce a local offer and start gathering candidates
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Apply a remote offer and produce a local answer
    async fn create_answer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, TransportError>;

    /// Apply the remote answer to a local offer
    async fn accept_answer(&self, answer: SessionDescription) -> Result<(), TransportError>;

    /// Fails with `NoRemoteDescription` until a remote descriptor is applied
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Resolves once local candidate gathering has finished
    async fn wait_gathering_complete(&self);

    /// Queue one frame; never blocks
    fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Close both directions
    fn close(&self);
}

/// A freshly opened connection and its event streams
pub struct OpenedConnection {
    pub connection: Arc<dyn PeerConnection>,
    /// Inbound frames in channel order
    pub frames: mpsc::UnboundedReceiver<Frame>,
    /// Locally gathered candidates
    pub local_candidates: mpsc::UnboundedReceiver<IceCandidate>,
    pub state: watch::Receiver<ChannelState>,
}

impl OpenedConnection {
    /// Separate the negotiation half from the inbound frame stream
    pub fn into_parts(self) -> (NegotiationChannel, mpsc::UnboundedReceiver<Frame>) {
        (
            NegotiationChannel {
                connection: self.connection,
                local_candidates: self.local_candidates,
                state: self.state,
            },
            self.frames,
        )
    }
}

/// What the signaling exchange needs from a connection
pub struct NegotiationChannel {
    pub connection: Arc<dyn PeerConnection>,
    pub local_candidates: mpsc::UnboundedReceiver<IceCandidate>,
    pub state: watch::Receiver<ChannelState>,
}

/// Factory for negotiation attempts
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn open(&self) -> Result<OpenedConnection, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(ChannelState::Closed.is_terminal());
        assert!(ChannelState::Failed.is_terminal());
        assert!(!ChannelState::Open.is_terminal());
        assert!(!ChannelState::New.is_terminal());
    }

    #[test]
    fn test_transport_error_maps_to_session_error() {
        let err: SessionError = TransportError::NotOpen.into();
        assert!(matches!(err, SessionError::Transport(_)));
    }
}
