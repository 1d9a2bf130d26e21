//! Room records held by the signaling store

use std::time::Duration;

use serde::{Deserialize, Serialize};

use tierlink_core::types::{now_millis, CandidateSide, IceCandidate, PeerId, SessionDescription};

/// Everything two peers exchange through the store to open a channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    /// Short code (`TIER-XXXXXX`), the store key
    pub code: String,

    /// Peer that created the room
    pub host_id: PeerId,

    #[serde(default)]
    pub offer: Option<SessionDescription>,

    #[serde(default)]
    pub answer: Option<SessionDescription>,

    /// Append-only until the room is deleted
    #[serde(default)]
    pub host_candidates: Vec<IceCandidate>,

    #[serde(default)]
    pub client_candidates: Vec<IceCandidate>,

    /// Peers currently holding the room open, the host included
    pub peer_count: u32,

    /// Unix milliseconds
    pub created_at: u64,

    /// Unix milliseconds; reads at or past this instant treat the room as gone
    pub expires_at: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_url: Option<String>,

    /// `salt$hash` from `room_code::try_hash_password`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
}

impl Room {
    /// Create a room held open by its host
    pub fn new(code: impl Into<String>, host_id: impl Into<PeerId>, ttl: Duration) -> Self {
        let now = now_millis();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        Self {
            code: code.into(),
            host_id: host_id.into(),
            offer: None,
            answer: None,
            host_candidates: Vec::new(),
            client_candidates: Vec::new(),
            peer_count: 1,
            created_at: now,
            expires_at: now.saturating_add(ttl_ms),
            document_url: None,
            password_hash: None,
        }
    }

    pub fn with_document_url(mut self, url: Option<String>) -> Self {
        self.document_url = url;
        self
    }

    pub fn with_password_hash(mut self, hash: Option<String>) -> Self {
        self.password_hash = hash;
        self
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }

    pub fn candidates(&self, side: CandidateSide) -> &[IceCandidate] {
        match side {
            CandidateSide::Host => &self.host_candidates,
            CandidateSide::Client => &self.client_candidates,
        }
    }

    pub fn candidates_mut(&mut self, side: CandidateSide) -> &mut Vec<IceCandidate> {
        match side {
            CandidateSide::Host => &mut self.host_candidates,
            CandidateSide::Client => &mut self.client_candidates,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_creation() {
        let room = Room::new("TIER-ABC234", "host01", Duration::from_secs(3600));
        assert_eq!(room.peer_count, 1);
        assert!(room.offer.is_none());
        assert_eq!(room.expires_at - room.created_at, 3_600_000);
        assert!(!room.is_expired_at(now_millis()));
        assert!(room.is_expired_at(room.expires_at));
    }

    #[test]
    fn test_candidate_sides() {
        let mut room = Room::new("TIER-ABC234", "host01", Duration::from_secs(60));
        room.candidates_mut(CandidateSide::Client)
            .push(IceCandidate::new("candidate:1 1 udp 1 10.0.0.2 9 typ host"));

        assert!(room.candidates(CandidateSide::Host).is_empty());
        assert_eq!(room.candidates(CandidateSide::Client).len(), 1);
    }

    #[test]
    fn test_room_json_shape() {
        let room = Room::new("TIER-ABC234", "host01", Duration::from_secs(60));
        let json = serde_json::to_string(&room).unwrap();
        assert!(json.contains("hostId"));
        assert!(json.contains("expiresAt"));
        assert!(!json.contains("passwordHash"));
    }
}
