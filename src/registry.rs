//! Process-wide room registry.
//!
//! Maps `room_id → Room`, creating rooms lazily on first join. Two workers
//! run per process:
//!
//! - **liveness** — every interval, logs the active member count per room
//!   and re-enqueues still-empty rooms for compaction (which doubles as the
//!   retry path after a failed run).
//! - **compaction** — drains the empty-room queue: locks the room, verifies
//!   it is still empty, runs the compactor, tombstones and evicts on
//!   success.
//!
//! Concurrent connections racing to create the same room resolve through a
//! read-lock fast path and a double-checked write lock, so both get the same
//! `Room` instance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::compactor::Compactor;
use crate::room::{JoinResult, Room};
use crate::storage::{MetadataStore, OperationLog, StorageError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid room id: {0}")]
    InvalidRoomId(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Registry of live rooms plus the workers that retire them.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    oplog: Arc<OperationLog>,
    metadata: Arc<MetadataStore>,
    compactor: Arc<Compactor>,
    compact_tx: mpsc::UnboundedSender<String>,
    compact_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    liveness_interval: Duration,
}

impl RoomRegistry {
    pub fn new(
        oplog: Arc<OperationLog>,
        metadata: Arc<MetadataStore>,
        compactor: Arc<Compactor>,
        liveness_interval: Duration,
    ) -> Arc<Self> {
        let (compact_tx, compact_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            oplog,
            metadata,
            compactor,
            compact_tx,
            compact_rx: Mutex::new(Some(compact_rx)),
            liveness_interval,
        })
    }

    /// The room for `room_id`, created (and hydrated from the log) if absent.
    /// A tombstoned room left over from compaction is replaced.
    pub async fn get_or_create(&self, room_id: &str) -> Result<Arc<Room>, RegistryError> {
        // Fast path: read lock.
        if let Some(room) = self.rooms.read().await.get(room_id).cloned() {
            if !room.is_closed().await {
                return Ok(room);
            }
        }

        let document_id: i64 = room_id
            .parse()
            .map_err(|_| RegistryError::InvalidRoomId(room_id.to_string()))?;

        // Slow path: write lock, double-check after acquiring.
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            if !room.is_closed().await {
                return Ok(room.clone());
            }
        }

        let room = Arc::new(Room::open(room_id, document_id, self.oplog.clone()).await?);
        match self.metadata.baseline_key(document_id).await {
            Ok(key) => log::debug!("room {room_id}: baseline key {key:?}"),
            Err(e) => log::warn!("room {room_id}: baseline key lookup failed: {e}"),
        }
        rooms.insert(room_id.to_string(), room.clone());
        log::info!("room {room_id} created at version {}", room.version().await);
        Ok(room)
    }

    /// Resolve the room and register the member, retrying if the room is
    /// tombstoned between lookup and join.
    pub async fn join(
        &self,
        room_id: &str,
        username: &str,
    ) -> Result<(Arc<Room>, JoinResult), RegistryError> {
        loop {
            let room = self.get_or_create(room_id).await?;
            match room.join(username).await {
                Ok(result) => return Ok((room, result)),
                Err(_closed) => continue,
            }
        }
    }

    /// Deregister a connection; an emptied room is handed to the compaction
    /// worker.
    pub async fn leave(&self, room_id: &str, conn_id: Uuid) {
        let room = self.rooms.read().await.get(room_id).cloned();
        if let Some(room) = room {
            if room.leave(conn_id).await == 0 {
                log::info!("room {room_id} is empty, scheduling compaction");
                let _ = self.compact_tx.send(room_id.to_string());
            }
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Spawn the liveness and compaction workers. Call once.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let registry = self.clone();
        handles.push(tokio::spawn(async move {
            registry.liveness_loop().await;
        }));

        let registry = self.clone();
        handles.push(tokio::spawn(async move {
            registry.compaction_loop().await;
        }));

        handles
    }

    async fn liveness_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.liveness_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let rooms: Vec<(String, Arc<Room>)> = self
                .rooms
                .read()
                .await
                .iter()
                .map(|(id, room)| (id.clone(), room.clone()))
                .collect();

            for (room_id, room) in rooms {
                let snapshot = room.snapshot().await;
                log::info!("Room {room_id} has {} active members", snapshot.member_count);
                if snapshot.member_count == 0 && !room.is_closed().await {
                    let _ = self.compact_tx.send(room_id);
                }
            }
        }
    }

    async fn compaction_loop(self: Arc<Self>) {
        let rx = self.compact_rx.lock().await.take();
        let Some(mut rx) = rx else {
            log::error!("compaction worker already running");
            return;
        };
        while let Some(room_id) = rx.recv().await {
            self.compact_room(&room_id).await;
        }
    }

    /// Compact one room if it is still empty. Holds the room's write lock
    /// for the duration, so a client connecting mid-run waits and then either
    /// joins (on failure) or gets a fresh room (on success).
    async fn compact_room(&self, room_id: &str) {
        let Some(room) = self.get(room_id).await else {
            return;
        };
        let Some(guard) = room.lock_for_compaction().await else {
            return;
        };

        match self.compactor.compact(room_id, room.document_id()).await {
            Ok(outcome) => {
                log::info!("room {room_id} compacted: {outcome:?}");
                guard.commit();
                self.remove_if_same(room_id, &room).await;
            }
            Err(e) => {
                log::error!("room {room_id}: compaction failed, will retry: {e}");
                drop(guard);
            }
        }
    }

    // Remove only if the map still holds this exact room; a tombstoned
    // entry may already have been replaced by a fresh one.
    async fn remove_if_same(&self, room_id: &str, room: &Arc<Room>) {
        let mut rooms = self.rooms.write().await;
        if let Some(existing) = rooms.get(room_id) {
            if Arc::ptr_eq(existing, room) {
                rooms.remove(room_id);
                log::info!("room {room_id} removed (compacted)");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Operation;
    use crate::storage::BaselineStore;
    use tokio::time::{timeout, Duration as TokioDuration};

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: Arc<RoomRegistry>,
        baselines: Arc<BaselineStore>,
    }

    async fn fixture(liveness: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let oplog = Arc::new(OperationLog::file(dir.path().join("operations.log")));
        let baselines = Arc::new(
            BaselineStore::local(dir.path().join("objects"), dir.path().join("cache"))
                .await
                .unwrap(),
        );
        let metadata = Arc::new(MetadataStore::in_memory());
        let compactor = Arc::new(
            Compactor::new(
                oplog.clone(),
                baselines.clone(),
                metadata.clone(),
                dir.path().join("intents"),
            )
            .await
            .unwrap(),
        );
        let registry = RoomRegistry::new(oplog, metadata, compactor, liveness);
        Fixture {
            _dir: dir,
            registry,
            baselines,
        }
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_instance() {
        let f = fixture(Duration::from_secs(30)).await;

        let a = f.registry.get_or_create("1").await.unwrap();
        let b = f.registry.get_or_create("1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(f.registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_rooms_for_different_documents_are_distinct() {
        let f = fixture(Duration::from_secs(30)).await;

        let a = f.registry.get_or_create("1").await.unwrap();
        let b = f.registry.get_or_create("2").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(f.registry.room_count().await, 2);
    }

    #[tokio::test]
    async fn test_non_numeric_room_id_rejected() {
        let f = fixture(Duration::from_secs(30)).await;
        assert!(matches!(
            f.registry.get_or_create("not-a-doc").await,
            Err(RegistryError::InvalidRoomId(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_creates_converge() {
        let f = fixture(Duration::from_secs(30)).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = f.registry.clone();
            handles.push(tokio::spawn(
                async move { registry.get_or_create("5").await },
            ));
        }

        let mut rooms = Vec::new();
        for handle in handles {
            rooms.push(handle.await.unwrap().unwrap());
        }
        for room in &rooms[1..] {
            assert!(Arc::ptr_eq(&rooms[0], room));
        }
    }

    #[tokio::test]
    async fn test_join_replaces_tombstoned_room() {
        let f = fixture(Duration::from_secs(30)).await;

        let stale = f.registry.get_or_create("3").await.unwrap();
        stale
            .lock_for_compaction()
            .await
            .expect("empty room")
            .commit();

        let (fresh, _join) = f.registry.join("3", "alice").await.unwrap();
        assert!(!Arc::ptr_eq(&stale, &fresh));
        assert_eq!(fresh.member_count().await, 1);
    }

    #[tokio::test]
    async fn test_empty_room_is_compacted_and_evicted() {
        let f = fixture(Duration::from_millis(50)).await;
        let _workers = f.registry.spawn_workers();

        let (room, join) = f.registry.join("4", "alice").await.unwrap();
        room.submit(Operation::insert(0, "bye", 0)).await.unwrap();
        f.registry.leave("4", join.conn_id).await;

        // Within a liveness cycle the compactor folds and the room is gone.
        timeout(TokioDuration::from_secs(2), async {
            loop {
                if f.registry.get("4").await.is_none() {
                    break;
                }
                tokio::time::sleep(TokioDuration::from_millis(20)).await;
            }
        })
        .await
        .expect("room evicted after compaction");

        assert_eq!(f.baselines.fetch(4).await.unwrap(), b"bye");
    }

    #[tokio::test]
    async fn test_rejoin_after_compaction_starts_fresh() {
        let f = fixture(Duration::from_millis(50)).await;
        let _workers = f.registry.spawn_workers();

        let (room, join) = f.registry.join("6", "alice").await.unwrap();
        room.submit(Operation::insert(0, "first", 0)).await.unwrap();
        f.registry.leave("6", join.conn_id).await;

        timeout(TokioDuration::from_secs(2), async {
            loop {
                if f.registry.get("6").await.is_none() {
                    break;
                }
                tokio::time::sleep(TokioDuration::from_millis(20)).await;
            }
        })
        .await
        .expect("room evicted");

        let (fresh, rejoin) = f.registry.join("6", "alice").await.unwrap();
        assert_eq!(fresh.version().await, 0, "log drained into the baseline");
        assert!(rejoin.history.is_none() || matches!(
            &rejoin.history,
            Some(crate::protocol::ServerFrame::History { operations, .. }) if operations.is_empty()
        ));
    }
}
