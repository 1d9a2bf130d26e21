//! WebSocket relay exposing a `SignalingStore`
//!
//! Peers never hold a session with the relay; each request is a self-contained
//! store operation. Plain `GET /health` and `GET /stats` are answered on the
//! same port.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use tierlink_core::rate_limiter::{RateLimiter, RateLimiterConfig};
use tierlink_core::types::now_millis;
use tierlink_core::ROOM_TTL_SECS;

use crate::messages::{ErrorCode, StoreRequest, StoreResponse};
use crate::storage::{sweep_logged, SignalingStore, StoreError};

/// Relay server state
#[derive(Clone)]
pub struct RelayServer {
    store: Arc<dyn SignalingStore>,
    /// Join attempts per room code
    join_limiter: RateLimiter,
    /// Open WebSocket connections
    connections: Arc<AtomicUsize>,
    sweep_interval: Duration,
    /// Longest lifetime a room may ask for
    max_ttl: Duration,
}

impl RelayServer {
    pub fn new(store: Arc<dyn SignalingStore>) -> Self {
        Self {
            store,
            join_limiter: RateLimiter::with_config(RateLimiterConfig::joins()),
            connections: Arc::new(AtomicUsize::new(0)),
            sweep_interval: Duration::from_secs(crate::SWEEP_INTERVAL_SECS),
            max_ttl: Duration::from_secs(ROOM_TTL_SECS),
        }
    }

    pub fn with_join_limit(mut self, config: RateLimiterConfig) -> Self {
        self.join_limiter = RateLimiter::with_config(config);
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_max_ttl(mut self, ttl: Duration) -> Self {
        self.max_ttl = ttl;
        self
    }

    /// Start the relay server
    pub async fn serve(&self, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("Relay server listening on {}", addr);
        self.serve_listener(listener).await
    }

    /// Serve on an already-bound listener
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        // Start expiry sweep task
        let store = self.store.clone();
        let limiter = self.join_limiter.clone();
        let interval = self.sweep_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                sweep_logged(store.as_ref()).await;
                limiter.cleanup_expired();
            }
        });

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let server = self.clone();

            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                    debug!("Connection error from {}: {:?}", peer_addr, e);
                }
            });
        }
    }

    /// Get open connection count (for monitoring)
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Handle a single connection (HTTP or WebSocket)
    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // Peek at the first bytes to detect HTTP vs WebSocket
        let mut peek_buf = [0u8; 4];
        stream.peek(&mut peek_buf).await?;

        // A WebSocket upgrade is also a GET; only plain requests are served here
        if &peek_buf == b"GET " && !is_upgrade_request(&stream).await? {
            let mut stream = stream;
            return self.handle_http_request(&mut stream).await;
        }

        let ws_stream = accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        self.connections.fetch_add(1, Ordering::Relaxed);
        debug!("New relay connection from {}", peer_addr);

        while let Some(msg) = ws_receiver.next().await {
            let text = match msg {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(data)) => {
                    let _ = ws_sender.send(Message::Pong(data)).await;
                    continue;
                }
                Ok(_) => continue,
                Err(e) => {
                    debug!("WebSocket error: {:?}", e);
                    break;
                }
            };

            let response = match StoreRequest::from_json(&text) {
                Ok(request) => self.handle_request(request).await,
                Err(e) => StoreResponse::error(ErrorCode::BadRequest, format!("Invalid JSON: {}", e)),
            };

            let json = response.to_json()?;
            if ws_sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }

        self.connections.fetch_sub(1, Ordering::Relaxed);
        debug!("Relay connection closed: {}", peer_addr);
        Ok(())
    }

    /// Handle an HTTP request (for health checks)
    async fn handle_http_request(
        &self,
        stream: &mut TcpStream,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut buf = vec![0u8; 1024];
        let n = stream.read(&mut buf).await?;
        let request = String::from_utf8_lossy(&buf[..n]);

        let path = request
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or("/");

        let rooms = self.store.room_count().await.unwrap_or(0);
        let connections = self.connection_count();

        let (status, body) = match path {
            "/health" => (
                "200 OK",
                format!(
                    r#"{{"status":"healthy","rooms":{},"connections":{}}}"#,
                    rooms, connections
                ),
            ),
            "/stats" => {
                let limiter = self.join_limiter.stats();
                (
                    "200 OK",
                    format!(
                        r#"{{"rooms":{},"connections":{},"joinLimited":{},"joinTracked":{}}}"#,
                        rooms, connections, limiter.saturated, limiter.total_tracked
                    ),
                )
            }
            _ => ("404 Not Found", r#"{"error":"not found"}"#.to_string()),
        };

        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );

        stream.write_all(response.as_bytes()).await?;
        Ok(())
    }

    /// Apply one store request
    pub async fn handle_request(&self, request: StoreRequest) -> StoreResponse {
        let op = request.op();
        let result = self.apply(request).await;

        match result {
            Ok(response) => response,
            Err(e) => {
                match &e {
                    StoreError::NotFound(_) | StoreError::RoomFull(_) | StoreError::AlreadyExists(_) => {
                        debug!("{} rejected: {}", op, e)
                    }
                    StoreError::RateLimited(_) => warn!("{} rejected: {}", op, e),
                    _ => warn!("{} failed: {}", op, e),
                }
                StoreResponse::from(&e)
            }
        }
    }

    async fn apply(&self, request: StoreRequest) -> Result<StoreResponse, StoreError> {
        let store = self.store.as_ref();

        Ok(match request {
            StoreRequest::CreateRoom { mut room } => {
                let limit = now_millis().saturating_add(self.max_ttl.as_millis() as u64);
                room.expires_at = room.expires_at.min(limit);
                let code = room.code.clone();
                store.create_room(room).await?;
                info!("Room created: {}", code);
                StoreResponse::Done
            }
            StoreRequest::GetRoom { code } => StoreResponse::Room {
                room: store.get_room(&code).await?,
            },
            StoreRequest::DeleteRoom { code } => {
                let existed = store.delete_room(&code).await?;
                self.join_limiter.remove(&code);
                if existed {
                    info!("Room deleted: {}", code);
                }
                StoreResponse::Deleted { existed }
            }
            StoreRequest::SetOffer { code, offer } => {
                store.set_offer(&code, offer).await?;
                StoreResponse::Done
            }
            StoreRequest::SetAnswer { code, answer } => {
                store.set_answer(&code, answer).await?;
                StoreResponse::Done
            }
            StoreRequest::AppendCandidate {
                code,
                side,
                candidate,
            } => {
                store.append_candidate(&code, side, candidate).await?;
                StoreResponse::Done
            }
            StoreRequest::IncrementPeerCount { code, max } => {
                if !self.join_limiter.admit(&code) {
                    return Err(StoreError::RateLimited(code));
                }
                let value = store.increment_peer_count(&code, max).await?;
                info!("Peer joined room {} ({} peers)", code, value);
                StoreResponse::Count {
                    value: u64::from(value),
                }
            }
            StoreRequest::DecrementPeerCount { code } => {
                let value = store.decrement_peer_count(&code).await?;
                if value == 0 {
                    self.join_limiter.remove(&code);
                }
                StoreResponse::Count {
                    value: u64::from(value),
                }
            }
            StoreRequest::SweepExpired => StoreResponse::Count {
                value: store.sweep_expired().await? as u64,
            },
            StoreRequest::RoomCount => StoreResponse::Count {
                value: store.room_count().await? as u64,
            },
        })
    }
}

/// Whether the buffered request head asks for a WebSocket upgrade
async fn is_upgrade_request(stream: &TcpStream) -> Result<bool, std::io::Error> {
    let mut head = vec![0u8; 2048];
    let n = stream.peek(&mut head).await?;
    let head = String::from_utf8_lossy(&head[..n]).to_ascii_lowercase();
    Ok(head.contains("upgrade: websocket"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::Room;
    use crate::storage::MemoryStore;

    fn server() -> RelayServer {
        RelayServer::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_create_and_get_room() {
        let server = server();
        let room = Room::new("TIER-ABC234", "host01", Duration::from_secs(60));

        let response = server
            .handle_request(StoreRequest::CreateRoom { room: room.clone() })
            .await;
        assert_eq!(response, StoreResponse::Done);

        let response = server
            .handle_request(StoreRequest::GetRoom {
                code: "TIER-ABC234".into(),
            })
            .await;
        assert_eq!(response, StoreResponse::Room { room: Some(room) });
    }

    #[tokio::test]
    async fn test_room_lifetime_capped() {
        let server = server().with_max_ttl(Duration::from_secs(10));
        let room = Room::new("TIER-LONG23", "host01", Duration::from_secs(86_400));
        server.handle_request(StoreRequest::CreateRoom { room }).await;

        let response = server
            .handle_request(StoreRequest::GetRoom {
                code: "TIER-LONG23".into(),
            })
            .await;
        match response {
            StoreResponse::Room { room: Some(room) } => {
                assert!(room.expires_at <= now_millis() + 10_000);
            }
            other => panic!("expected room, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_room_error() {
        let server = server();
        let response = server
            .handle_request(StoreRequest::DecrementPeerCount {
                code: "TIER-NONE23".into(),
            })
            .await;
        assert!(matches!(
            response,
            StoreResponse::Error {
                code: ErrorCode::RoomNotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_join_rate_limit() {
        let server = server();
        let room = Room::new("TIER-ABC234", "host01", Duration::from_secs(60));
        server.handle_request(StoreRequest::CreateRoom { room }).await;

        let join = || StoreRequest::IncrementPeerCount {
            code: "TIER-ABC234".into(),
            max: 100,
        };

        for _ in 0..5 {
            let response = server.handle_request(join()).await;
            assert!(matches!(response, StoreResponse::Count { .. }));
        }

        let response = server.handle_request(join()).await;
        assert!(matches!(
            response,
            StoreResponse::Error {
                code: ErrorCode::RateLimited,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let server = server();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { server.serve_listener(listener).await });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains(r#""status":"healthy""#));
    }
}
