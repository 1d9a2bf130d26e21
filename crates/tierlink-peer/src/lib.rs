//! Tierlink Peer
//!
//! Everything that runs on a participating peer:
//!
//! - `transport`: the channel capability a session is given (NAT traversal lives behind it)
//! - `memory`: in-process transport for tests and demos
//! - `signaling`: offer/answer/candidate exchange through a signaling store
//! - `session`: `PeerSession`, the peer table and the event/command API
//! - `chunk`: chunked image transfers and out-of-order reassembly
//! - `adapter`: bridge to a CRDT replication engine

pub mod adapter;
pub mod chunk;
pub mod memory;
pub mod session;
pub mod signaling;
pub mod transport;

pub use adapter::{CrdtNetworkAdapter, NetworkEvent, RepoMessage};
pub use chunk::{split_payload, transfer_messages, ChunkOutcome, ChunkReassembler};
pub use memory::{MemoryEndpoint, MemoryNetwork};
pub use session::{PeerSession, PeerSessionOptions, SessionEvent};
pub use signaling::{CreateRoomOptions, JoinResult, SignalingEvent, SignalingSession};
pub use transport::{
    ChannelState, NegotiationChannel, OpenedConnection, PeerConnection, PeerConnector,
    TransportError,
};
