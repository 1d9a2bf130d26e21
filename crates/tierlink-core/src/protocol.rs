//! Wire protocol for the peer data channel
//!
//! Every message starts with a UTF-8 JSON metadata frame tagged by `type`.
//! Types that carry bytes (`sync`, `fullsync`, `image:chunk`, `crdt`) are
//! followed by exactly one raw binary frame; all other types are a single
//! JSON frame. Inbound frames are validated once, in [`FrameDecoder`], and the
//! resulting [`Message`] is trusted everywhere downstream.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ProtocolError;
use crate::types::{IceCandidate, PeerId, TransferId};
use crate::{CHUNK_SIZE, MAX_CHAT_LEN, MAX_ID_LEN, MAX_PAYLOAD_SIZE, MAX_TOTAL_CHUNKS};

/// One send on the underlying channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// JSON metadata frame as it appears on the wire
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Header {
    #[serde(rename = "sync", rename_all = "camelCase")]
    Sync {
        sender_id: PeerId,
        board_id: String,
        sequence: u64,
    },

    #[serde(rename = "sync-request", rename_all = "camelCase")]
    SyncRequest { sender_id: PeerId, board_id: String },

    #[serde(rename = "fullsync", rename_all = "camelCase")]
    FullSync {
        sender_id: PeerId,
        board_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_peer_id: Option<PeerId>,
    },

    #[serde(rename = "chat", rename_all = "camelCase")]
    Chat {
        sender_id: PeerId,
        board_id: String,
        content: String,
        #[serde(default)]
        timestamp: u64,
    },

    #[serde(rename = "peer-join", rename_all = "camelCase")]
    PeerJoin {
        sender_id: PeerId,
        peer_id: PeerId,
        peer_name: String,
        #[serde(default)]
        capabilities: Vec<String>,
    },

    #[serde(rename = "peer-leave", rename_all = "camelCase")]
    PeerLeave { sender_id: PeerId, peer_id: PeerId },

    #[serde(rename = "ice-candidate", rename_all = "camelCase")]
    IceCandidate {
        sender_id: PeerId,
        candidate: IceCandidate,
    },

    #[serde(rename = "image:chunk", rename_all = "camelCase")]
    ImageChunk {
        sender_id: PeerId,
        transfer_id: TransferId,
        chunk_index: u32,
        total_chunks: u32,
    },

    #[serde(rename = "image:request", rename_all = "camelCase")]
    ImageRequest {
        sender_id: PeerId,
        transfer_id: TransferId,
    },

    #[serde(rename = "image:complete", rename_all = "camelCase")]
    ImageComplete {
        sender_id: PeerId,
        transfer_id: TransferId,
    },

    #[serde(rename = "crdt", rename_all = "camelCase")]
    CrdtEnvelope {
        sender_id: PeerId,
        target_peer_id: PeerId,
    },
}

impl Header {
    /// Wire name of this message type
    pub fn kind(&self) -> &'static str {
        match self {
            Header::Sync { .. } => "sync",
            Header::SyncRequest { .. } => "sync-request",
            Header::FullSync { .. } => "fullsync",
            Header::Chat { .. } => "chat",
            Header::PeerJoin { .. } => "peer-join",
            Header::PeerLeave { .. } => "peer-leave",
            Header::IceCandidate { .. } => "ice-candidate",
            Header::ImageChunk { .. } => "image:chunk",
            Header::ImageRequest { .. } => "image:request",
            Header::ImageComplete { .. } => "image:complete",
            Header::CrdtEnvelope { .. } => "crdt",
        }
    }

    pub fn sender_id(&self) -> &str {
        match self {
            Header::Sync { sender_id, .. }
            | Header::SyncRequest { sender_id, .. }
            | Header::FullSync { sender_id, .. }
            | Header::Chat { sender_id, .. }
            | Header::PeerJoin { sender_id, .. }
            | Header::PeerLeave { sender_id, .. }
            | Header::IceCandidate { sender_id, .. }
            | Header::ImageChunk { sender_id, .. }
            | Header::ImageRequest { sender_id, .. }
            | Header::ImageComplete { sender_id, .. }
            | Header::CrdtEnvelope { sender_id, .. } => sender_id,
        }
    }

    /// Whether a binary frame must follow this metadata frame
    pub fn expects_binary(&self) -> bool {
        matches!(
            self,
            Header::Sync { .. }
                | Header::FullSync { .. }
                | Header::ImageChunk { .. }
                | Header::CrdtEnvelope { .. }
        )
    }
}

/// A validated message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub sender_id: PeerId,
    pub body: MessageBody,
}

/// Closed set of message variants
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageBody {
    Sync {
        board_id: String,
        delta: Bytes,
        sequence: u64,
    },
    SyncRequest {
        board_id: String,
    },
    FullSync {
        board_id: String,
        document: Bytes,
        target_peer_id: Option<PeerId>,
    },
    Chat {
        board_id: String,
        content: String,
        timestamp: u64,
    },
    PeerJoin {
        peer_id: PeerId,
        peer_name: String,
        capabilities: Vec<String>,
    },
    PeerLeave {
        peer_id: PeerId,
    },
    IceCandidate {
        candidate: IceCandidate,
    },
    ImageChunk {
        transfer_id: TransferId,
        chunk_index: u32,
        total_chunks: u32,
        data: Bytes,
    },
    ImageRequest {
        transfer_id: TransferId,
    },
    ImageComplete {
        transfer_id: TransferId,
    },
    CrdtEnvelope {
        target_peer_id: PeerId,
        payload: Bytes,
    },
}

impl MessageBody {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Sync { .. } => "sync",
            MessageBody::SyncRequest { .. } => "sync-request",
            MessageBody::FullSync { .. } => "fullsync",
            MessageBody::Chat { .. } => "chat",
            MessageBody::PeerJoin { .. } => "peer-join",
            MessageBody::PeerLeave { .. } => "peer-leave",
            MessageBody::IceCandidate { .. } => "ice-candidate",
            MessageBody::ImageChunk { .. } => "image:chunk",
            MessageBody::ImageRequest { .. } => "image:request",
            MessageBody::ImageComplete { .. } => "image:complete",
            MessageBody::CrdtEnvelope { .. } => "crdt",
        }
    }
}

impl Message {
    pub fn new(sender_id: impl Into<PeerId>, body: MessageBody) -> Self {
        Self {
            sender_id: sender_id.into(),
            body,
        }
    }

    /// Split into the wire header and the binary payload, if any
    pub fn to_parts(&self) -> (Header, Option<Bytes>) {
        let sender_id = self.sender_id.clone();
        match &self.body {
            MessageBody::Sync {
                board_id,
                delta,
                sequence,
            } => (
                Header::Sync {
                    sender_id,
                    board_id: board_id.clone(),
                    sequence: *sequence,
                },
                Some(delta.clone()),
            ),
            MessageBody::SyncRequest { board_id } => (
                Header::SyncRequest {
                    sender_id,
                    board_id: board_id.clone(),
                },
                None,
            ),
            MessageBody::FullSync {
                board_id,
                document,
                target_peer_id,
            } => (
                Header::FullSync {
                    sender_id,
                    board_id: board_id.clone(),
                    target_peer_id: target_peer_id.clone(),
                },
                Some(document.clone()),
            ),
            MessageBody::Chat {
                board_id,
                content,
                timestamp,
            } => (
                Header::Chat {
                    sender_id,
                    board_id: board_id.clone(),
                    content: content.clone(),
                    timestamp: *timestamp,
                },
                None,
            ),
            MessageBody::PeerJoin {
                peer_id,
                peer_name,
                capabilities,
            } => (
                Header::PeerJoin {
                    sender_id,
                    peer_id: peer_id.clone(),
                    peer_name: peer_name.clone(),
                    capabilities: capabilities.clone(),
                },
                None,
            ),
            MessageBody::PeerLeave { peer_id } => (
                Header::PeerLeave {
                    sender_id,
                    peer_id: peer_id.clone(),
                },
                None,
            ),
            MessageBody::IceCandidate { candidate } => (
                Header::IceCandidate {
                    sender_id,
                    candidate: candidate.clone(),
                },
                None,
            ),
            MessageBody::ImageChunk {
                transfer_id,
                chunk_index,
                total_chunks,
                data,
            } => (
                Header::ImageChunk {
                    sender_id,
                    transfer_id: transfer_id.clone(),
                    chunk_index: *chunk_index,
                    total_chunks: *total_chunks,
                },
                Some(data.clone()),
            ),
            MessageBody::ImageRequest { transfer_id } => (
                Header::ImageRequest {
                    sender_id,
                    transfer_id: transfer_id.clone(),
                },
                None,
            ),
            MessageBody::ImageComplete { transfer_id } => (
                Header::ImageComplete {
                    sender_id,
                    transfer_id: transfer_id.clone(),
                },
                None,
            ),
            MessageBody::CrdtEnvelope {
                target_peer_id,
                payload,
            } => (
                Header::CrdtEnvelope {
                    sender_id,
                    target_peer_id: target_peer_id.clone(),
                },
                Some(payload.clone()),
            ),
        }
    }

    /// Serialize to one or two frames
    pub fn encode(&self) -> Result<Vec<Frame>, ProtocolError> {
        let (header, payload) = self.to_parts();
        let json =
            serde_json::to_string(&header).map_err(|e| ProtocolError::Serialization(e.to_string()))?;

        let mut frames = Vec::with_capacity(2);
        frames.push(Frame::Text(json));
        if let Some(payload) = payload {
            frames.push(Frame::Binary(payload));
        }
        Ok(frames)
    }
}

/// Size and count bounds applied to inbound frames
#[derive(Clone, Debug)]
pub struct CodecLimits {
    pub max_payload: usize,
    pub max_chunk: usize,
    pub max_total_chunks: u32,
    pub max_chat_len: usize,
    pub max_id_len: usize,
}

impl Default for CodecLimits {
    fn default() -> Self {
        Self {
            max_payload: MAX_PAYLOAD_SIZE,
            max_chunk: CHUNK_SIZE,
            max_total_chunks: MAX_TOTAL_CHUNKS,
            max_chat_len: MAX_CHAT_LEN,
            max_id_len: MAX_ID_LEN,
        }
    }
}

/// Pairs metadata frames with their binary frames and validates the result
#[derive(Debug, Default)]
pub struct FrameDecoder {
    limits: CodecLimits,
    pending: Option<Header>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: CodecLimits) -> Self {
        Self {
            limits,
            pending: None,
        }
    }

    /// Feed one frame
    ///
    /// Returns `Ok(None)` while a metadata frame waits for its binary frame.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>, ProtocolError> {
        match frame {
            Frame::Text(text) => {
                if let Some(stale) = self.pending.take() {
                    warn!(
                        "Dropping `{}` from {}: binary frame never arrived",
                        stale.kind(),
                        stale.sender_id()
                    );
                }

                let header: Header = serde_json::from_str(&text)?;
                validate_header(&header, &self.limits)?;

                if header.expects_binary() {
                    self.pending = Some(header);
                    Ok(None)
                } else {
                    Ok(Some(assemble(header, None, &self.limits)?))
                }
            }
            Frame::Binary(data) => {
                let header = self.pending.take().ok_or(ProtocolError::UnexpectedBinary)?;
                Ok(Some(assemble(header, Some(data), &self.limits)?))
            }
        }
    }

    /// Whether a metadata frame is waiting for its binary frame
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Forget any half-received message
    pub fn reset(&mut self) {
        self.pending = None;
    }
}

fn check_id(field: &'static str, value: &str, limits: &CodecLimits) -> Result<(), ProtocolError> {
    if value.is_empty() {
        return Err(ProtocolError::invalid(field, "must not be empty"));
    }
    if value.len() > limits.max_id_len {
        return Err(ProtocolError::invalid(
            field,
            format!("longer than {} bytes", limits.max_id_len),
        ));
    }
    Ok(())
}

fn validate_header(header: &Header, limits: &CodecLimits) -> Result<(), ProtocolError> {
    check_id("senderId", header.sender_id(), limits)?;

    match header {
        Header::Sync {
            board_id, sequence, ..
        } => {
            check_id("boardId", board_id, limits)?;
            if *sequence == 0 {
                return Err(ProtocolError::invalid("sequence", "starts at 1"));
            }
        }
        Header::SyncRequest { board_id, .. } | Header::FullSync { board_id, .. } => {
            check_id("boardId", board_id, limits)?;
        }
        Header::Chat {
            board_id, content, ..
        } => {
            check_id("boardId", board_id, limits)?;
            if content.trim().is_empty() {
                return Err(ProtocolError::invalid("content", "must not be empty"));
            }
            if content.len() > limits.max_chat_len {
                return Err(ProtocolError::invalid(
                    "content",
                    format!("longer than {} bytes", limits.max_chat_len),
                ));
            }
        }
        Header::PeerJoin {
            peer_id, peer_name, ..
        } => {
            check_id("peerId", peer_id, limits)?;
            if peer_name.len() > limits.max_chat_len {
                return Err(ProtocolError::invalid("peerName", "too long"));
            }
        }
        Header::PeerLeave { peer_id, .. } => check_id("peerId", peer_id, limits)?,
        Header::IceCandidate { candidate, .. } => {
            if candidate.candidate.is_empty() {
                return Err(ProtocolError::invalid("candidate", "must not be empty"));
            }
        }
        Header::ImageChunk {
            transfer_id,
            chunk_index,
            total_chunks,
            ..
        } => {
            check_id("transferId", transfer_id, limits)?;
            if *total_chunks == 0 || *total_chunks > limits.max_total_chunks {
                return Err(ProtocolError::invalid(
                    "totalChunks",
                    format!("must be within 1..={}", limits.max_total_chunks),
                ));
            }
            if chunk_index >= total_chunks {
                return Err(ProtocolError::invalid(
                    "chunkIndex",
                    format!("{} is not below totalChunks {}", chunk_index, total_chunks),
                ));
            }
        }
        Header::ImageRequest { transfer_id, .. } | Header::ImageComplete { transfer_id, .. } => {
            check_id("transferId", transfer_id, limits)?;
        }
        Header::CrdtEnvelope { target_peer_id, .. } => {
            check_id("targetPeerId", target_peer_id, limits)?;
        }
    }

    Ok(())
}

fn assemble(
    header: Header,
    payload: Option<Bytes>,
    limits: &CodecLimits,
) -> Result<Message, ProtocolError> {
    if let Some(data) = &payload {
        let max = if matches!(header, Header::ImageChunk { .. }) {
            limits.max_chunk
        } else {
            limits.max_payload
        };
        if data.len() > max {
            return Err(ProtocolError::PayloadTooLarge {
                size: data.len(),
                max,
            });
        }
    }

    let kind = header.kind();
    let take_payload = move || payload.ok_or(ProtocolError::MissingPayload(kind));

    let message = match header {
        Header::Sync {
            sender_id,
            board_id,
            sequence,
        } => Message::new(
            sender_id,
            MessageBody::Sync {
                board_id,
                delta: take_payload()?,
                sequence,
            },
        ),
        Header::SyncRequest {
            sender_id,
            board_id,
        } => Message::new(sender_id, MessageBody::SyncRequest { board_id }),
        Header::FullSync {
            sender_id,
            board_id,
            target_peer_id,
        } => Message::new(
            sender_id,
            MessageBody::FullSync {
                board_id,
                document: take_payload()?,
                target_peer_id,
            },
        ),
        Header::Chat {
            sender_id,
            board_id,
            content,
            timestamp,
        } => Message::new(
            sender_id,
            MessageBody::Chat {
                board_id,
                content,
                timestamp,
            },
        ),
        Header::PeerJoin {
            sender_id,
            peer_id,
            peer_name,
            capabilities,
        } => Message::new(
            sender_id,
            MessageBody::PeerJoin {
                peer_id,
                peer_name,
                capabilities,
            },
        ),
        Header::PeerLeave { sender_id, peer_id } => {
            Message::new(sender_id, MessageBody::PeerLeave { peer_id })
        }
        Header::IceCandidate {
            sender_id,
            candidate,
        } => Message::new(sender_id, MessageBody::IceCandidate { candidate }),
        Header::ImageChunk {
            sender_id,
            transfer_id,
            chunk_index,
            total_chunks,
        } => Message::new(
            sender_id,
            MessageBody::ImageChunk {
                transfer_id,
                chunk_index,
                total_chunks,
                data: take_payload()?,
            },
        ),
        Header::ImageRequest {
            sender_id,
            transfer_id,
        } => Message::new(sender_id, MessageBody::ImageRequest { transfer_id }),
        Header::ImageComplete {
            sender_id,
            transfer_id,
        } => Message::new(sender_id, MessageBody::ImageComplete { transfer_id }),
        Header::CrdtEnvelope {
            sender_id,
            target_peer_id,
        } => Message::new(
            sender_id,
            MessageBody::CrdtEnvelope {
                target_peer_id,
                payload: take_payload()?,
            },
        ),
    };

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(frames: Vec<Frame>) -> Vec<Message> {
        let mut decoder = FrameDecoder::new();
        frames
            .into_iter()
            .filter_map(|f| decoder.push(f).unwrap())
            .collect()
    }

    #[test]
    fn test_sync_uses_two_frames() {
        let msg = Message::new(
            "host01",
            MessageBody::Sync {
                board_id: "b1".into(),
                delta: Bytes::from_static(&[1, 2, 3]),
                sequence: 1,
            },
        );

        let frames = msg.encode().unwrap();
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            Frame::Text(json) => {
                assert!(json.contains(r#""type":"sync""#));
                assert!(json.contains(r#""boardId":"b1""#));
                assert!(json.contains(r#""senderId":"host01""#));
            }
            other => panic!("expected text frame, got {:?}", other),
        }
        assert_eq!(frames[1], Frame::Binary(Bytes::from_static(&[1, 2, 3])));

        assert_eq!(decode_all(frames), vec![msg]);
    }

    #[test]
    fn test_chat_is_self_contained() {
        let msg = Message::new(
            "peer",
            MessageBody::Chat {
                board_id: "b1".into(),
                content: "hello".into(),
                timestamp: 42,
            },
        );
        let frames = msg.encode().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(decode_all(frames), vec![msg]);
    }

    #[test]
    fn test_image_type_names() {
        let chunk = Message::new(
            "peer",
            MessageBody::ImageChunk {
                transfer_id: "t1".into(),
                chunk_index: 0,
                total_chunks: 1,
                data: Bytes::new(),
            },
        );
        let frames = chunk.encode().unwrap();
        assert!(matches!(&frames[0], Frame::Text(json) if json.contains(r#""type":"image:chunk""#)));
        assert!(matches!(&frames[0], Frame::Text(json) if json.contains(r#""totalChunks":1"#)));
    }

    #[test]
    fn test_binary_without_header_rejected() {
        let mut decoder = FrameDecoder::new();
        let err = decoder.push(Frame::Binary(Bytes::from_static(b"x"))).unwrap_err();
        assert_eq!(err, ProtocolError::UnexpectedBinary);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut decoder = FrameDecoder::new();
        let err = decoder
            .push(Frame::Text(r#"{"type":"warp","senderId":"a"}"#.into()))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));

        let err = decoder.push(Frame::Text("not json".into())).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_chunk_index_validation() {
        let mut decoder = FrameDecoder::new();
        let json = r#"{"type":"image:chunk","senderId":"a","transferId":"t","chunkIndex":3,"totalChunks":3}"#;
        let err = decoder.push(Frame::Text(json.into())).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidField { field: "chunkIndex", .. }));

        let json = r#"{"type":"image:chunk","senderId":"a","transferId":"t","chunkIndex":0,"totalChunks":0}"#;
        let err = decoder.push(Frame::Text(json.into())).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidField { field: "totalChunks", .. }));
    }

    #[test]
    fn test_oversized_chunk_rejected() {
        let mut decoder = FrameDecoder::new();
        let json = r#"{"type":"image:chunk","senderId":"a","transferId":"t","chunkIndex":0,"totalChunks":1}"#;
        assert!(decoder.push(Frame::Text(json.into())).unwrap().is_none());

        let err = decoder
            .push(Frame::Binary(Bytes::from(vec![0u8; CHUNK_SIZE + 1])))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadTooLarge { .. }));
        assert!(!decoder.has_pending());
    }

    #[test]
    fn test_new_header_replaces_orphaned_one() {
        let mut decoder = FrameDecoder::new();
        let sync = r#"{"type":"sync","senderId":"a","boardId":"b","sequence":1}"#;
        assert!(decoder.push(Frame::Text(sync.into())).unwrap().is_none());

        let request = r#"{"type":"sync-request","senderId":"a","boardId":"b"}"#;
        let msg = decoder.push(Frame::Text(request.into())).unwrap().unwrap();
        assert_eq!(
            msg.body,
            MessageBody::SyncRequest {
                board_id: "b".into()
            }
        );
        assert!(!decoder.has_pending());
    }

    #[test]
    fn test_empty_sender_rejected() {
        let mut decoder = FrameDecoder::new();
        let json = r#"{"type":"peer-leave","senderId":"","peerId":"b"}"#;
        let err = decoder.push(Frame::Text(json.into())).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidField { field: "senderId", .. }));
    }

    #[test]
    fn test_zero_sequence_rejected() {
        let mut decoder = FrameDecoder::new();
        let json = r#"{"type":"sync","senderId":"a","boardId":"b","sequence":0}"#;
        assert!(decoder.push(Frame::Text(json.into())).is_err());
    }
}
