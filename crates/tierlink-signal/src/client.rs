//! `SignalingStore` backed by a remote relay
//!
//! One WebSocket carries all requests; replies come back in request order, so
//! a request holds the socket until its reply arrives. A broken socket is
//! dropped and reopened on the next request.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use tierlink_core::types::{CandidateSide, IceCandidate, SessionDescription};

use crate::messages::{StoreRequest, StoreResponse};
use crate::room::Room;
use crate::storage::{SignalingStore, StoreError};

/// Timeout for WebSocket operations
const WS_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Relay client
pub struct RemoteStore {
    url: Url,
    socket: Mutex<Option<WsStream>>,
}

impl RemoteStore {
    /// Validate the relay URL; the socket opens on first use
    pub fn new(url: &str) -> Result<Self, StoreError> {
        let url = Url::parse(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(StoreError::Connection(format!(
                    "unsupported scheme `{}` (expected ws or wss)",
                    other
                )))
            }
        }

        Ok(Self {
            url,
            socket: Mutex::new(None),
        })
    }

    /// Create a client and open its socket immediately
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let store = Self::new(url)?;
        {
            let mut socket = store.socket.lock().await;
            *socket = Some(store.open().await?);
        }
        Ok(store)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn open(&self) -> Result<WsStream, StoreError> {
        debug!("Connecting to relay: {}", self.url);

        match timeout(WS_TIMEOUT, connect_async(self.url.as_str())).await {
            Ok(Ok((ws, _response))) => {
                info!("Connected to relay {}", self.url);
                Ok(ws)
            }
            Ok(Err(e)) => Err(StoreError::Connection(e.to_string())),
            Err(_) => Err(StoreError::Connection("timed out connecting to relay".into())),
        }
    }

    /// Send one request and wait for its reply
    async fn call(&self, request: StoreRequest) -> Result<StoreResponse, StoreError> {
        let json = request.to_json()?;
        let mut guard = self.socket.lock().await;

        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        let Some(ws) = guard.as_mut() else {
            return Err(StoreError::Connection("relay socket unavailable".into()));
        };

        let result = exchange(ws, json).await;
        if let Err(e) = &result {
            warn!("Relay request `{}` failed: {}; dropping socket", request.op(), e);
            *guard = None;
        }
        drop(guard);

        result?.into_result()
    }

    async fn call_count(&self, request: StoreRequest) -> Result<u64, StoreError> {
        match self.call(request).await? {
            StoreResponse::Count { value } => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    async fn call_done(&self, request: StoreRequest) -> Result<(), StoreError> {
        match self.call(request).await? {
            StoreResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

async fn exchange(ws: &mut WsStream, json: String) -> Result<StoreResponse, StoreError> {
    timeout(WS_TIMEOUT, ws.send(Message::Text(json)))
        .await
        .map_err(|_| StoreError::Connection("timed out sending request".into()))?
        .map_err(|e| StoreError::Connection(e.to_string()))?;

    loop {
        match timeout(WS_TIMEOUT, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return Ok(StoreResponse::from_json(&text)?),
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                return Err(StoreError::Connection("connection closed".into()));
            }
            Ok(Some(Err(e))) => return Err(StoreError::Connection(e.to_string())),
            // Ignore non-text messages (ping/pong/binary)
            Ok(Some(Ok(_))) => continue,
            Err(_) => return Err(StoreError::Connection("timed out waiting for reply".into())),
        }
    }
}

fn unexpected(response: StoreResponse) -> StoreError {
    StoreError::Remote(format!("unexpected reply: {:?}", response))
}

fn narrow(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[async_trait]
impl SignalingStore for RemoteStore {
    async fn create_room(&self, room: Room) -> Result<(), StoreError> {
        self.call_done(StoreRequest::CreateRoom { room }).await
    }

    async fn get_room(&self, code: &str) -> Result<Option<Room>, StoreError> {
        match self
            .call(StoreRequest::GetRoom {
                code: code.to_string(),
            })
            .await?
        {
            StoreResponse::Room { room } => Ok(room),
            other => Err(unexpected(other)),
        }
    }

    async fn delete_room(&self, code: &str) -> Result<bool, StoreError> {
        match self
            .call(StoreRequest::DeleteRoom {
                code: code.to_string(),
            })
            .await?
        {
            StoreResponse::Deleted { existed } => Ok(existed),
            other => Err(unexpected(other)),
        }
    }

    async fn set_offer(&self, code: &str, offer: SessionDescription) -> Result<(), StoreError> {
        self.call_done(StoreRequest::SetOffer {
            code: code.to_string(),
            offer,
        })
        .await
    }

    async fn set_answer(&self, code: &str, answer: SessionDescription) -> Result<(), StoreError> {
        self.call_done(StoreRequest::SetAnswer {
            code: code.to_string(),
            answer,
        })
        .await
    }

    async fn append_candidate(
        &self,
        code: &str,
        side: CandidateSide,
        candidate: IceCandidate,
    ) -> Result<(), StoreError> {
        self.call_done(StoreRequest::AppendCandidate {
            code: code.to_string(),
            side,
            candidate,
        })
        .await
    }

    async fn increment_peer_count(&self, code: &str, max: u32) -> Result<u32, StoreError> {
        self.call_count(StoreRequest::IncrementPeerCount {
            code: code.to_string(),
            max,
        })
        .await
        .map(narrow)
    }

    async fn decrement_peer_count(&self, code: &str) -> Result<u32, StoreError> {
        self.call_count(StoreRequest::DecrementPeerCount {
            code: code.to_string(),
        })
        .await
        .map(narrow)
    }

    async fn sweep_expired(&self) -> Result<usize, StoreError> {
        self.call_count(StoreRequest::SweepExpired)
            .await
            .map(|n| n as usize)
    }

    async fn room_count(&self) -> Result<usize, StoreError> {
        self.call_count(StoreRequest::RoomCount)
            .await
            .map(|n| n as usize)
    }
}
