//! Tierlink Core - Shared types, wire protocol, and room codes
//!
//! This crate contains the foundational types used across all Tierlink components.
//! It has no dependencies on networking code.

pub mod config;
pub mod error;
pub mod protocol;
pub mod rate_limiter;
pub mod room_code;
pub mod types;

pub use config::{Config, ConfigError, LimitsConfig, SessionConfig, SignalConfig, TransferConfig};
pub use error::*;
pub use protocol::{CodecLimits, Frame, FrameDecoder, Header, Message, MessageBody};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterStats};
pub use room_code::RoomCode;
pub use types::*;

/// Chunk size in bytes (16 KB)
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Default room lifetime in seconds (1 hour)
pub const ROOM_TTL_SECS: u64 = 3600;

/// Peers admitted per room (host + one client)
pub const MAX_PEERS_PER_ROOM: u32 = 2;

/// Inbound messages per second per peer
pub const DEFAULT_MESSAGE_LIMIT: u32 = 20;

/// Join attempts per minute per room code
pub const DEFAULT_JOIN_LIMIT: u32 = 5;

/// Largest binary payload accepted on the channel (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Largest chunk count accepted for one transfer
pub const MAX_TOTAL_CHUNKS: u32 = (MAX_PAYLOAD_SIZE / CHUNK_SIZE) as u32;

/// Maximum chat message length in bytes
pub const MAX_CHAT_LEN: usize = 4096;

/// Maximum length of any identifier on the wire
pub const MAX_ID_LEN: usize = 128;
