//! Relay protocol messages
//!
//! Each WebSocket text frame carries one JSON `StoreRequest`; the relay answers
//! every request with exactly one `StoreResponse`, in order.

use serde::{Deserialize, Serialize};

use tierlink_core::types::{CandidateSide, IceCandidate, SessionDescription};

use crate::room::Room;
use crate::storage::StoreError;

/// Store operations sent to the relay
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StoreRequest {
    CreateRoom { room: Room },
    GetRoom { code: String },
    DeleteRoom { code: String },
    SetOffer { code: String, offer: SessionDescription },
    SetAnswer { code: String, answer: SessionDescription },
    AppendCandidate {
        code: String,
        side: CandidateSide,
        candidate: IceCandidate,
    },
    IncrementPeerCount { code: String, max: u32 },
    DecrementPeerCount { code: String },
    SweepExpired,
    RoomCount,
}

/// Relay replies
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StoreResponse {
    /// Mutation applied
    Done,

    /// Room lookup result
    Room { room: Option<Room> },

    /// Deletion result
    Deleted { existed: bool },

    /// Peer count, sweep count or room count
    Count { value: u64 },

    /// Error response
    Error { code: ErrorCode, message: String },
}

/// Error codes
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Room not found or expired
    RoomNotFound,

    /// Code already used by a live room
    RoomExists,

    /// Room is full
    RoomFull,

    /// Too many join attempts
    RateLimited,

    /// Request could not be parsed
    BadRequest,

    /// Internal server error
    InternalError,
}

impl StoreRequest {
    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Operation name, for logs
    pub fn op(&self) -> &'static str {
        match self {
            StoreRequest::CreateRoom { .. } => "create_room",
            StoreRequest::GetRoom { .. } => "get_room",
            StoreRequest::DeleteRoom { .. } => "delete_room",
            StoreRequest::SetOffer { .. } => "set_offer",
            StoreRequest::SetAnswer { .. } => "set_answer",
            StoreRequest::AppendCandidate { .. } => "append_candidate",
            StoreRequest::IncrementPeerCount { .. } => "increment_peer_count",
            StoreRequest::DecrementPeerCount { .. } => "decrement_peer_count",
            StoreRequest::SweepExpired => "sweep_expired",
            StoreRequest::RoomCount => "room_count",
        }
    }
}

impl StoreResponse {
    /// Create an error message
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Turn an error reply back into the store error it stands for
    pub fn into_result(self) -> Result<StoreResponse, StoreError> {
        match self {
            StoreResponse::Error { code, message } => Err(match code {
                ErrorCode::RoomNotFound => StoreError::NotFound(message),
                ErrorCode::RoomExists => StoreError::AlreadyExists(message),
                ErrorCode::RoomFull => StoreError::RoomFull(message),
                ErrorCode::RateLimited => StoreError::RateLimited(message),
                ErrorCode::BadRequest | ErrorCode::InternalError => StoreError::Remote(message),
            }),
            other => Ok(other),
        }
    }
}

impl From<&StoreError> for StoreResponse {
    fn from(e: &StoreError) -> Self {
        match e {
            // The room code travels as the message so the client can rebuild the error
            StoreError::NotFound(code) => StoreResponse::error(ErrorCode::RoomNotFound, code),
            StoreError::AlreadyExists(code) => StoreResponse::error(ErrorCode::RoomExists, code),
            StoreError::RoomFull(code) => StoreResponse::error(ErrorCode::RoomFull, code),
            StoreError::RateLimited(code) => StoreResponse::error(ErrorCode::RateLimited, code),
            other => StoreResponse::error(ErrorCode::InternalError, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let msg = StoreRequest::AppendCandidate {
            code: "TIER-ABC234".into(),
            side: CandidateSide::Client,
            candidate: IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 9 typ host"),
        };

        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""op":"append_candidate""#));
        assert!(json.contains(r#""side":"client""#));

        assert_eq!(StoreRequest::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn test_unit_request_shape() {
        let json = StoreRequest::SweepExpired.to_json().unwrap();
        assert_eq!(json, r#"{"op":"sweep_expired"}"#);
    }

    #[test]
    fn test_error_message() {
        let msg = StoreResponse::error(ErrorCode::RoomNotFound, "TIER-ABC234");
        let json = msg.to_json().unwrap();

        assert!(json.contains("error"));
        assert!(json.contains("room_not_found"));
    }

    #[test]
    fn test_error_round_trip_to_store_error() {
        let response = StoreResponse::from(&StoreError::RoomFull("TIER-ABC234".into()));
        match response.into_result() {
            Err(StoreError::RoomFull(code)) => assert_eq!(code, "TIER-ABC234"),
            other => panic!("expected RoomFull, got {:?}", other),
        }

        assert!(matches!(StoreResponse::Done.into_result(), Ok(StoreResponse::Done)));
    }
}
