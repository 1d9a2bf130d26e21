//! Tierlink Signal
//!
//! Relay store for the offer/answer/candidate exchange. Peers never keep a
//! session open with the signaling side; they read and write room records and
//! poll for changes.
//!
//! # Protocol
//!
//! 1. Host creates a room and writes its offer and candidates
//! 2. Client bumps the room's peer count and reads the offer
//! 3. Client writes its answer and candidates
//! 4. Both sides poll for the other's candidates until the channel opens
//! 5. The room is deleted when the host leaves, the last peer leaves, or the TTL elapses

pub mod client;
pub mod messages;
pub mod room;
pub mod server;
pub mod storage;

pub use client::RemoteStore;
pub use messages::{ErrorCode, StoreRequest, StoreResponse};
pub use room::Room;
pub use server::RelayServer;
pub use storage::{MemoryStore, SignalingStore, SqliteStore, StoreError};

/// Default relay port
pub const DEFAULT_PORT: u16 = 8787;

/// Expiry sweep interval in seconds
pub const SWEEP_INTERVAL_SECS: u64 = 60;
