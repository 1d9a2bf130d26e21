//! Error types for the Tierlink transport

use thiserror::Error;

/// Wire-level errors raised while framing or validating messages
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed metadata frame: {0}")]
    Malformed(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("binary frame without a pending metadata frame")]
    UnexpectedBinary,

    #[error("metadata frame `{0}` was not followed by its binary frame")]
    MissingPayload(&'static str),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("invalid room code: {0}")]
    InvalidRoomCode(String),
}

impl ProtocolError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ProtocolError::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Malformed(e.to_string())
    }
}

/// Session-level error taxonomy
///
/// `ChannelNotReady`, `Validation` and `RateLimited` are absorbed where they
/// are detected and only appear in logs or on the event stream. `Timeout`,
/// `Unauthorized`, `NotFound` and `RoomFull` are returned to callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("channel not ready")]
    ChannelNotReady,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("room {0} is full")]
    RoomFull(String),

    #[error("invalid room code: {0}")]
    InvalidRoomCode(String),

    #[error("signaling store error: {0}")]
    Store(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl SessionError {
    /// Whether the error is terminal for the current room attempt
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SessionError::ChannelNotReady
                | SessionError::Validation(_)
                | SessionError::RateLimited(_)
        )
    }
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::InvalidRoomCode(code) => SessionError::InvalidRoomCode(code),
            other => SessionError::Validation(other.to_string()),
        }
    }
}
