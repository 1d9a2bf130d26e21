//! Signaling store backends
//!
//! Rooms expire lazily: any read or write that finds a room past its
//! `expires_at` deletes it and reports not-found. The in-memory backend also
//! runs a periodic sweep.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use tierlink_core::types::{now_millis, CandidateSide, IceCandidate, SessionDescription};
use tierlink_core::SessionError;

use crate::room::Room;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("room {0} not found")]
    NotFound(String),

    #[error("room {0} already exists")]
    AlreadyExists(String),

    #[error("room {0} is full")]
    RoomFull(String),

    #[error("too many join attempts for room {0}")]
    RateLimited(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Mutex lock was poisoned (indicates a panic occurred while holding the lock)
    #[error("lock poisoned: a thread panicked while holding the lock")]
    LockPoisoned,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("relay connection error: {0}")]
    Connection(String),

    #[error("relay error: {0}")]
    Remote(String),
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(code) => SessionError::NotFound(code),
            StoreError::RoomFull(code) => SessionError::RoomFull(code),
            StoreError::RateLimited(code) => SessionError::RateLimited(code),
            other => SessionError::Store(other.to_string()),
        }
    }
}

/// Room records with TTL-based expiry
///
/// The store does not deduplicate: offer and answer are last-writer-wins,
/// candidate lists are append-only.
#[async_trait]
pub trait SignalingStore: Send + Sync {
    /// Insert a new room; fails if a live room already uses the code
    async fn create_room(&self, room: Room) -> Result<(), StoreError>;

    /// Fetch a live room
    async fn get_room(&self, code: &str) -> Result<Option<Room>, StoreError>;

    /// Remove a room; returns whether it existed
    async fn delete_room(&self, code: &str) -> Result<bool, StoreError>;

    async fn set_offer(&self, code: &str, offer: SessionDescription) -> Result<(), StoreError>;

    async fn set_answer(&self, code: &str, answer: SessionDescription) -> Result<(), StoreError>;

    async fn append_candidate(
        &self,
        code: &str,
        side: CandidateSide,
        candidate: IceCandidate,
    ) -> Result<(), StoreError>;

    /// Add a peer; fails with `RoomFull` when `max` peers already hold the room
    async fn increment_peer_count(&self, code: &str, max: u32) -> Result<u32, StoreError>;

    /// Remove a peer, clamped at zero; the room is deleted when the count reaches zero
    async fn decrement_peer_count(&self, code: &str) -> Result<u32, StoreError>;

    /// Delete every expired room; returns how many were removed
    async fn sweep_expired(&self) -> Result<usize, StoreError>;

    async fn room_count(&self) -> Result<usize, StoreError>;

    async fn get_offer(&self, code: &str) -> Result<Option<SessionDescription>, StoreError> {
        self.require_room(code).await.map(|room| room.offer)
    }

    async fn get_answer(&self, code: &str) -> Result<Option<SessionDescription>, StoreError> {
        self.require_room(code).await.map(|room| room.answer)
    }

    async fn get_candidates(
        &self,
        code: &str,
        side: CandidateSide,
    ) -> Result<Vec<IceCandidate>, StoreError> {
        self.require_room(code)
            .await
            .map(|room| room.candidates(side).to_vec())
    }

    async fn require_room(&self, code: &str) -> Result<Room, StoreError> {
        self.get_room(code)
            .await?
            .ok_or_else(|| StoreError::NotFound(code.to_string()))
    }
}

/// In-memory store for single-process deployments and tests
#[derive(Default)]
pub struct MemoryStore {
    rooms: DashMap<String, Room>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` on a live room, purging it first if it has expired
    fn with_live_room<T>(
        &self,
        code: &str,
        f: impl FnOnce(&mut Room) -> T,
    ) -> Result<T, StoreError> {
        let now = now_millis();
        let expired = match self.rooms.get_mut(code) {
            Some(mut room) if !room.is_expired_at(now) => return Ok(f(&mut room)),
            Some(_) => true,
            None => false,
        };

        if expired && self.rooms.remove_if(code, |_, r| r.is_expired_at(now)).is_some() {
            debug!("Room {} removed (expired on access)", code);
        }
        Err(StoreError::NotFound(code.to_string()))
    }

    /// Start the periodic expiry sweep
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                store.sweep();
            }
        })
    }

    fn sweep(&self) -> usize {
        let now = now_millis();
        let before = self.rooms.len();
        self.rooms.retain(|code, room| {
            let keep = !room.is_expired_at(now);
            if !keep {
                info!("Room {} removed (TTL elapsed)", code);
            }
            keep
        });
        before.saturating_sub(self.rooms.len())
    }
}

#[async_trait]
impl SignalingStore for MemoryStore {
    async fn create_room(&self, room: Room) -> Result<(), StoreError> {
        let now = now_millis();
        let code = room.code.clone();

        match self.rooms.entry(code.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                if !existing.get().is_expired_at(now) {
                    return Err(StoreError::AlreadyExists(code));
                }
                existing.insert(room);
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(room);
            }
        }

        debug!("Room created: {}", code);
        Ok(())
    }

    async fn get_room(&self, code: &str) -> Result<Option<Room>, StoreError> {
        match self.with_live_room(code, |room| room.clone()) {
            Ok(room) => Ok(Some(room)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete_room(&self, code: &str) -> Result<bool, StoreError> {
        let existed = self.rooms.remove(code).is_some();
        if existed {
            debug!("Room deleted: {}", code);
        }
        Ok(existed)
    }

    async fn set_offer(&self, code: &str, offer: SessionDescription) -> Result<(), StoreError> {
        self.with_live_room(code, |room| room.offer = Some(offer))
    }

    async fn set_answer(&self, code: &str, answer: SessionDescription) -> Result<(), StoreError> {
        self.with_live_room(code, |room| room.answer = Some(answer))
    }

    async fn append_candidate(
        &self,
        code: &str,
        side: CandidateSide,
        candidate: IceCandidate,
    ) -> Result<(), StoreError> {
        self.with_live_room(code, |room| room.candidates_mut(side).push(candidate))
    }

    async fn increment_peer_count(&self, code: &str, max: u32) -> Result<u32, StoreError> {
        self.with_live_room(code, |room| {
            if room.peer_count >= max {
                return Err(StoreError::RoomFull(code.to_string()));
            }
            room.peer_count += 1;
            Ok(room.peer_count)
        })?
    }

    async fn decrement_peer_count(&self, code: &str) -> Result<u32, StoreError> {
        let count = self.with_live_room(code, |room| {
            room.peer_count = room.peer_count.saturating_sub(1);
            room.peer_count
        })?;

        if count == 0 {
            self.rooms.remove_if(code, |_, room| room.peer_count == 0);
            debug!("Room {} removed (empty)", code);
        }
        Ok(count)
    }

    async fn sweep_expired(&self) -> Result<usize, StoreError> {
        Ok(self.sweep())
    }

    async fn room_count(&self) -> Result<usize, StoreError> {
        Ok(self.rooms.len())
    }
}

/// SQLite storage backend
///
/// Survives relay restarts; rooms past their TTL are purged on access and by
/// `sweep_expired`.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a new SQLite database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS rooms (
                code TEXT PRIMARY KEY,
                host_id TEXT NOT NULL,
                offer TEXT,
                answer TEXT,
                peer_count INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                document_url TEXT,
                password_hash TEXT
            );

            CREATE TABLE IF NOT EXISTS candidates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                code TEXT NOT NULL,
                side TEXT NOT NULL,
                candidate TEXT NOT NULL,
                FOREIGN KEY (code) REFERENCES rooms(code) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_candidates_code ON candidates(code, side);
            "#,
        )?;

        info!("Signaling store schema initialized");
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Whether a live room exists, purging it if expired
    fn ensure_live(conn: &Connection, code: &str) -> Result<(), StoreError> {
        let expires_at: Option<i64> = conn
            .query_row(
                "SELECT expires_at FROM rooms WHERE code = ?1",
                params![code],
                |row| row.get(0),
            )
            .optional()?;

        match expires_at {
            Some(expires_at) if (expires_at as u64) > now_millis() => Ok(()),
            Some(_) => {
                Self::purge(conn, code)?;
                debug!("Room {} removed (expired on access)", code);
                Err(StoreError::NotFound(code.to_string()))
            }
            None => Err(StoreError::NotFound(code.to_string())),
        }
    }

    fn purge(conn: &Connection, code: &str) -> Result<usize, StoreError> {
        // Delete candidates first (due to foreign key)
        conn.execute("DELETE FROM candidates WHERE code = ?1", params![code])?;
        Ok(conn.execute("DELETE FROM rooms WHERE code = ?1", params![code])?)
    }

    fn load_candidates(
        conn: &Connection,
        code: &str,
        side: CandidateSide,
    ) -> Result<Vec<IceCandidate>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT candidate FROM candidates WHERE code = ?1 AND side = ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![code, side.as_str()], |row| row.get::<_, String>(0))?;

        let mut candidates = Vec::new();
        for json in rows {
            candidates.push(serde_json::from_str(&json?)?);
        }
        Ok(candidates)
    }
}

fn encode_description(desc: &Option<SessionDescription>) -> Result<Option<String>, StoreError> {
    desc.as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(StoreError::from)
}

fn decode_description(json: Option<String>) -> Result<Option<SessionDescription>, StoreError> {
    json.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(StoreError::from)
}

#[async_trait]
impl SignalingStore for SqliteStore {
    async fn create_room(&self, room: Room) -> Result<(), StoreError> {
        let conn = self.lock()?;

        match Self::ensure_live(&conn, &room.code) {
            Ok(()) => return Err(StoreError::AlreadyExists(room.code)),
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        conn.execute(
            "INSERT INTO rooms (code, host_id, offer, answer, peer_count, created_at, expires_at, document_url, password_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                room.code,
                room.host_id,
                encode_description(&room.offer)?,
                encode_description(&room.answer)?,
                room.peer_count,
                room.created_at as i64,
                room.expires_at as i64,
                room.document_url,
                room.password_hash,
            ],
        )?;

        for side in [CandidateSide::Host, CandidateSide::Client] {
            for candidate in room.candidates(side) {
                conn.execute(
                    "INSERT INTO candidates (code, side, candidate) VALUES (?1, ?2, ?3)",
                    params![room.code, side.as_str(), serde_json::to_string(candidate)?],
                )?;
            }
        }

        debug!("Room created in storage: {}", room.code);
        Ok(())
    }

    async fn get_room(&self, code: &str) -> Result<Option<Room>, StoreError> {
        let conn = self.lock()?;

        match Self::ensure_live(&conn, code) {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        }

        let row = conn.query_row(
            "SELECT host_id, offer, answer, peer_count, created_at, expires_at, document_url, password_hash
             FROM rooms WHERE code = ?1",
            params![code],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            },
        )?;

        let (host_id, offer, answer, peer_count, created_at, expires_at, document_url, password_hash) =
            row;

        Ok(Some(Room {
            code: code.to_string(),
            host_id,
            offer: decode_description(offer)?,
            answer: decode_description(answer)?,
            host_candidates: Self::load_candidates(&conn, code, CandidateSide::Host)?,
            client_candidates: Self::load_candidates(&conn, code, CandidateSide::Client)?,
            peer_count,
            created_at: created_at as u64,
            expires_at: expires_at as u64,
            document_url,
            password_hash,
        }))
    }

    async fn delete_room(&self, code: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let removed = Self::purge(&conn, code)? > 0;
        if removed {
            debug!("Room deleted from storage: {}", code);
        }
        Ok(removed)
    }

    async fn set_offer(&self, code: &str, offer: SessionDescription) -> Result<(), StoreError> {
        let conn = self.lock()?;
        Self::ensure_live(&conn, code)?;
        conn.execute(
            "UPDATE rooms SET offer = ?1 WHERE code = ?2",
            params![serde_json::to_string(&offer)?, code],
        )?;
        Ok(())
    }

    async fn set_answer(&self, code: &str, answer: SessionDescription) -> Result<(), StoreError> {
        let conn = self.lock()?;
        Self::ensure_live(&conn, code)?;
        conn.execute(
            "UPDATE rooms SET answer = ?1 WHERE code = ?2",
            params![serde_json::to_string(&answer)?, code],
        )?;
        Ok(())
    }

    async fn append_candidate(
        &self,
        code: &str,
        side: CandidateSide,
        candidate: IceCandidate,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        Self::ensure_live(&conn, code)?;
        conn.execute(
            "INSERT INTO candidates (code, side, candidate) VALUES (?1, ?2, ?3)",
            params![code, side.as_str(), serde_json::to_string(&candidate)?],
        )?;
        Ok(())
    }

    async fn increment_peer_count(&self, code: &str, max: u32) -> Result<u32, StoreError> {
        let conn = self.lock()?;
        Self::ensure_live(&conn, code)?;

        let updated = conn.execute(
            "UPDATE rooms SET peer_count = peer_count + 1 WHERE code = ?1 AND peer_count < ?2",
            params![code, max],
        )?;
        if updated == 0 {
            return Err(StoreError::RoomFull(code.to_string()));
        }

        Ok(conn.query_row(
            "SELECT peer_count FROM rooms WHERE code = ?1",
            params![code],
            |row| row.get(0),
        )?)
    }

    async fn decrement_peer_count(&self, code: &str) -> Result<u32, StoreError> {
        let conn = self.lock()?;
        Self::ensure_live(&conn, code)?;

        conn.execute(
            "UPDATE rooms SET peer_count = MAX(peer_count - 1, 0) WHERE code = ?1",
            params![code],
        )?;
        let count: u32 = conn.query_row(
            "SELECT peer_count FROM rooms WHERE code = ?1",
            params![code],
            |row| row.get(0),
        )?;

        if count == 0 {
            Self::purge(&conn, code)?;
            debug!("Room {} removed (empty)", code);
        }
        Ok(count)
    }

    async fn sweep_expired(&self) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let now = now_millis() as i64;

        conn.execute(
            "DELETE FROM candidates WHERE code IN (SELECT code FROM rooms WHERE expires_at <= ?1)",
            params![now],
        )?;
        let count = conn.execute("DELETE FROM rooms WHERE expires_at <= ?1", params![now])?;

        if count > 0 {
            info!("Cleaned up {} expired rooms", count);
        }
        Ok(count)
    }

    async fn room_count(&self) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM rooms", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Log and swallow a sweep failure
pub async fn sweep_logged(store: &dyn SignalingStore) {
    match store.sweep_expired().await {
        Ok(0) => {}
        Ok(n) => debug!("Swept {} expired rooms", n),
        Err(e) => error!("Expiry sweep failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer() -> SessionDescription {
        SessionDescription::offer("v=0 offer")
    }

    fn candidate(n: u8) -> IceCandidate {
        IceCandidate::new(format!("candidate:{} 1 udp 1 10.0.0.{} 9 typ host", n, n))
    }

    async fn exercise_store(store: &dyn SignalingStore) {
        let room = Room::new("TIER-ABC234", "host01", Duration::from_secs(3600));
        store.create_room(room.clone()).await.unwrap();
        assert!(matches!(
            store.create_room(room).await,
            Err(StoreError::AlreadyExists(_))
        ));

        assert_eq!(store.get_offer("TIER-ABC234").await.unwrap(), None);
        store.set_offer("TIER-ABC234", offer()).await.unwrap();
        assert_eq!(store.get_offer("TIER-ABC234").await.unwrap(), Some(offer()));

        store
            .append_candidate("TIER-ABC234", CandidateSide::Host, candidate(1))
            .await
            .unwrap();
        store
            .append_candidate("TIER-ABC234", CandidateSide::Host, candidate(1))
            .await
            .unwrap();
        store
            .append_candidate("TIER-ABC234", CandidateSide::Client, candidate(2))
            .await
            .unwrap();

        // Append-only, no dedup at this layer
        let host = store
            .get_candidates("TIER-ABC234", CandidateSide::Host)
            .await
            .unwrap();
        assert_eq!(host, vec![candidate(1), candidate(1)]);

        assert_eq!(store.increment_peer_count("TIER-ABC234", 2).await.unwrap(), 2);
        assert!(matches!(
            store.increment_peer_count("TIER-ABC234", 2).await,
            Err(StoreError::RoomFull(_))
        ));

        assert_eq!(store.decrement_peer_count("TIER-ABC234").await.unwrap(), 1);
        assert_eq!(store.decrement_peer_count("TIER-ABC234").await.unwrap(), 0);
        assert!(store.get_room("TIER-ABC234").await.unwrap().is_none());

        assert!(matches!(
            store.set_answer("TIER-ABC234", SessionDescription::answer("a")).await,
            Err(StoreError::NotFound(_))
        ));
    }

    async fn exercise_expiry(store: &dyn SignalingStore) {
        let mut room = Room::new("TIER-EXP234", "host01", Duration::from_secs(3600));
        room.expires_at = now_millis().saturating_sub(1);
        store.create_room(room).await.unwrap();
        assert_eq!(store.room_count().await.unwrap(), 1);

        assert!(store.get_room("TIER-EXP234").await.unwrap().is_none());
        assert_eq!(store.room_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_memory_store_operations() {
        exercise_store(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_store_operations() {
        exercise_store(&SqliteStore::in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_memory_store_expiry_on_read() {
        exercise_expiry(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_store_expiry_on_read() {
        exercise_expiry(&SqliteStore::in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let store = MemoryStore::new();
        let mut stale = Room::new("TIER-OLD234", "h", Duration::from_secs(1));
        stale.expires_at = 0;
        store.create_room(stale).await.unwrap();
        store
            .create_room(Room::new("TIER-NEW234", "h", Duration::from_secs(60)))
            .await
            .unwrap();

        assert_eq!(store.sweep_expired().await.unwrap(), 1);
        assert_eq!(store.room_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expired_code_can_be_reused() {
        let store = MemoryStore::new();
        let mut stale = Room::new("TIER-OLD234", "h1", Duration::from_secs(1));
        stale.expires_at = 0;
        store.create_room(stale).await.unwrap();

        store
            .create_room(Room::new("TIER-OLD234", "h2", Duration::from_secs(60)))
            .await
            .unwrap();
        let room = store.get_room("TIER-OLD234").await.unwrap().unwrap();
        assert_eq!(room.host_id, "h2");
    }

    #[tokio::test]
    async fn test_sqlite_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signal.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            let room = Room::new("TIER-KEEP23", "host01", Duration::from_secs(60))
                .with_document_url(Some("https://boards.example/b/1".into()));
            store.create_room(room).await.unwrap();
            store
                .append_candidate("TIER-KEEP23", CandidateSide::Client, candidate(3))
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let room = store.get_room("TIER-KEEP23").await.unwrap().unwrap();
        assert_eq!(room.document_url.as_deref(), Some("https://boards.example/b/1"));
        assert_eq!(room.client_candidates, vec![candidate(3)]);
    }

    #[tokio::test]
    async fn test_delete_room() {
        let store = MemoryStore::new();
        store
            .create_room(Room::new("TIER-DEL234", "h", Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(tokio_test::assert_ok!(store.delete_room("TIER-DEL234").await));
        assert!(!tokio_test::assert_ok!(store.delete_room("TIER-DEL234").await));
    }

    #[test]
    fn test_store_error_maps_to_session_error() {
        let err: SessionError = StoreError::NotFound("TIER-X".into()).into();
        assert_eq!(err, SessionError::NotFound("TIER-X".into()));

        let err: SessionError = StoreError::LockPoisoned.into();
        assert!(matches!(err, SessionError::Store(_)));
    }
}
