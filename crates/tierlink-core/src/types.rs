//! Shared types used by the signaling and session layers

use serde::{Deserialize, Serialize};

/// Peer identifier (16 hex chars, unique per session instance)
pub type PeerId = String;

/// Image transfer identifier chosen by the sender
pub type TransferId = String;

/// Role a peer plays in a room
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Host,
    Client,
}

impl PeerRole {
    /// The role of the other end of a 1:1 room
    pub fn counterpart(self) -> Self {
        match self {
            PeerRole::Host => PeerRole::Client,
            PeerRole::Client => PeerRole::Host,
        }
    }
}

/// Session lifecycle
///
/// `Disconnected -> Connecting -> Connected`, with `Failed` reachable from
/// `Connecting` or `Connected`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Connectivity tier derived from the negotiated candidate types
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Poor,
    Fair,
    Good,
    Excellent,
}

/// Kind of network path a candidate advertises
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Host,
    Srflx,
    Prflx,
    Relay,
}

impl TransportKind {
    /// Parse the `typ <kind>` token out of a candidate line
    pub fn from_candidate(candidate: &str) -> Option<Self> {
        let mut tokens = candidate.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "typ" {
                return match tokens.next()? {
                    "host" => Some(TransportKind::Host),
                    "srflx" => Some(TransportKind::Srflx),
                    "prflx" => Some(TransportKind::Prflx),
                    "relay" => Some(TransportKind::Relay),
                    _ => None,
                };
            }
        }
        None
    }
}

impl ConnectionQuality {
    /// Classify a connection from the candidate lines seen during negotiation.
    ///
    /// Any relay candidate means the path is relayed (`Fair`). Reflexive
    /// candidates without a relay give `Good`, host-only gives `Excellent`.
    /// With nothing recognisable the tier is `Poor`.
    pub fn classify<'a, I>(candidates: I) -> (ConnectionQuality, Option<TransportKind>)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut saw_host = false;
        let mut saw_reflexive = false;
        let mut saw_relay = false;

        for line in candidates {
            match TransportKind::from_candidate(line) {
                Some(TransportKind::Relay) => saw_relay = true,
                Some(TransportKind::Srflx) | Some(TransportKind::Prflx) => saw_reflexive = true,
                Some(TransportKind::Host) => saw_host = true,
                None => {}
            }
        }

        if saw_relay {
            (ConnectionQuality::Fair, Some(TransportKind::Relay))
        } else if saw_reflexive {
            (ConnectionQuality::Good, Some(TransportKind::Srflx))
        } else if saw_host {
            (ConnectionQuality::Excellent, Some(TransportKind::Host))
        } else {
            (ConnectionQuality::Poor, None)
        }
    }
}

/// A remote participant known to a session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: PeerId,
    pub name: String,
    pub role: PeerRole,
    /// Unix milliseconds
    pub connected_at: u64,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_quality: Option<ConnectionQuality>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_kind: Option<TransportKind>,
}

/// Which half of the negotiation a descriptor belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// Connection descriptor exchanged through the signaling store
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: DescriptionKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One network path advertised during negotiation
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }
    }

    /// Content-based key used to apply each candidate exactly once
    pub fn dedup_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.candidate,
            self.sdp_mid.as_deref().unwrap_or(""),
            self.sdp_m_line_index.map(|i| i as i64).unwrap_or(-1)
        )
    }
}

/// Candidate queue within a room record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateSide {
    Host,
    Client,
}

impl From<PeerRole> for CandidateSide {
    fn from(role: PeerRole) -> Self {
        match role {
            PeerRole::Host => CandidateSide::Host,
            PeerRole::Client => CandidateSide::Client,
        }
    }
}

impl CandidateSide {
    pub fn as_str(self) -> &'static str {
        match self {
            CandidateSide::Host => "host",
            CandidateSide::Client => "client",
        }
    }
}

/// Current Unix time in milliseconds
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}

/// Generate a random peer ID
///
/// # Panics
/// Panics if the system random number generator fails.
pub fn generate_peer_id() -> PeerId {
    try_generate_peer_id().expect("RNG failed - system entropy source unavailable")
}

/// Try to generate a random peer ID, returning an error if RNG fails
pub fn try_generate_peer_id() -> Result<PeerId, getrandom::Error> {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes)?;
    Ok(hex::encode(bytes))
}
