//! Per-room OT engine and broadcast fan-out.
//!
//! ```text
//! submit ──► validate ──► transform against applied[v..version]
//!                              │
//!                              ▼
//!                    append to OperationLog (durable)
//!                              │
//!                              ▼
//!              applied.push + version += 1 + watermarks
//!                              │
//!                              ▼
//!            enqueue frame on every member's outbound queue
//! ```
//!
//! The whole submit path runs under the room's write lock, so exactly one
//! transform+append is in flight per room and every member observes the same
//! total order. Socket I/O never happens under the lock: members hold an
//! unbounded outbound queue and their connection task drains it.
//!
//! Transform rule: only historical *inserts* rewrite positions. A historical
//! insert strictly before the inbound position shifts it by the insert's
//! code-point count; a tie leaves the newcomer in place, after the earlier
//! op. Historical deletes never shift anything — clients rebase on their
//! echo, and concurrent overlapping deletes are a documented limitation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::{AppliedOperation, OpKind, Operation, ServerFrame, ValidationError};
use crate::storage::{OperationLog, StorageError};

/// RFC3339 with microseconds, matching the log's timestamp resolution.
pub fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

struct Member {
    username: String,
    tx: mpsc::UnboundedSender<String>,
}

struct RoomState {
    /// Server version; always equal to `applied.len()`.
    version: u64,
    /// Transformed operations exactly as broadcast, index i = the op that
    /// advanced the version from i to i+1.
    applied: Vec<AppliedOperation>,
    members: HashMap<Uuid, Member>,
    /// Last operation timestamp delivered to or received from each user.
    /// Survives disconnects for the life of the room.
    last_seen: HashMap<String, DateTime<Utc>>,
    /// High-water mark for the monotonic per-room clock.
    last_ts: DateTime<Utc>,
    /// Set at compaction commit; a closed room accepts no joins or submits.
    closed: bool,
}

impl RoomState {
    /// Wall clock truncated to the log's microsecond resolution, bumped by
    /// 1 µs whenever it fails to advance, so two ops never share a stored
    /// timestamp and the exclusive `since` watermark is exact.
    fn next_ts(&mut self) -> DateTime<Utc> {
        let mut now = Utc::now();
        now = now - Duration::nanoseconds((now.timestamp_subsec_nanos() % 1_000) as i64);
        if now <= self.last_ts {
            now = self.last_ts + Duration::microseconds(1);
        }
        self.last_ts = now;
        now
    }
}

/// What a joining connection gets back: its handle, its outbound queue, and
/// (for returning users) the operations missed since their watermark.
pub struct JoinResult {
    pub conn_id: Uuid,
    pub rx: mpsc::UnboundedReceiver<String>,
    pub history: Option<ServerFrame>,
}

/// Read-only view for liveness reporting and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub version: u64,
    pub member_count: usize,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("{0}")]
    Invalid(#[from] ValidationError),
    #[error("failed to write operation: {0}")]
    Storage(#[from] StorageError),
    #[error("room is closed")]
    RoomClosed,
}

#[derive(Debug, Error)]
#[error("room {0} is closed")]
pub struct RoomClosed(pub String);

/// One collaboration session, bound to a single document.
pub struct Room {
    room_id: String,
    document_id: i64,
    oplog: Arc<OperationLog>,
    state: RwLock<RoomState>,
}

impl Room {
    /// Open a room, replaying any surviving log entries into the applied
    /// history so the version counter lines up after a restart.
    pub async fn open(
        room_id: impl Into<String>,
        document_id: i64,
        oplog: Arc<OperationLog>,
    ) -> Result<Self, StorageError> {
        let room_id = room_id.into();
        let entries = oplog.entries(&room_id).await?;

        let last_ts = entries
            .last()
            .map(|e| e.applied_at)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let applied: Vec<AppliedOperation> =
            entries.into_iter().map(|e| e.operation).collect();

        Ok(Self {
            room_id,
            document_id,
            oplog,
            state: RwLock::new(RoomState {
                version: applied.len() as u64,
                applied,
                members: HashMap::new(),
                last_seen: HashMap::new(),
                last_ts,
                closed: false,
            }),
        })
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn document_id(&self) -> i64 {
        self.document_id
    }

    /// Register a live connection for `username`.
    ///
    /// Holds the room lock across the history fetch and the registration so
    /// no live broadcast can slip between the history frame and the first
    /// live frame.
    pub async fn join(&self, username: &str) -> Result<JoinResult, RoomClosed> {
        let mut st = self.state.write().await;
        if st.closed {
            return Err(RoomClosed(self.room_id.clone()));
        }

        let history = match st.last_seen.get(username).copied() {
            Some(watermark) => match self.oplog.since(&self.room_id, watermark).await {
                Ok(operations) => Some(ServerFrame::History {
                    since: rfc3339(watermark),
                    operations,
                }),
                Err(e) => {
                    log::warn!(
                        "room {}: history replay for {username} failed: {e}",
                        self.room_id
                    );
                    None
                }
            },
            None => None,
        };

        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        st.members.insert(
            conn_id,
            Member {
                username: username.to_string(),
                tx,
            },
        );
        let now = st.next_ts();
        st.last_seen.insert(username.to_string(), now);

        Ok(JoinResult {
            conn_id,
            rx,
            history,
        })
    }

    /// Validate, transform, persist, and broadcast one operation. Returns
    /// the operation as the server applied it; the submitter also receives
    /// it through its own outbound queue, as the ack.
    pub async fn submit(&self, op: Operation) -> Result<AppliedOperation, SubmitError> {
        op.validate()?;

        let mut st = self.state.write().await;
        if st.closed {
            return Err(SubmitError::RoomClosed);
        }

        let version = st.version;
        if op.client_version as u64 > version {
            return Err(SubmitError::Invalid(ValidationError::VersionAhead {
                client: op.client_version,
                server: version,
            }));
        }

        let mut transformed = op;
        for past in &st.applied[transformed.client_version as usize..] {
            if past.op.kind != OpKind::Insert {
                continue;
            }
            if past.op.position < transformed.position {
                transformed.position += past.op.text_len() as i64;
            }
        }

        let applied = AppliedOperation {
            op: transformed,
            server_version: version,
        };

        // Durable append first: a failed append leaves the room untouched
        // and the client gets an error frame instead of a broadcast.
        let ts = st.next_ts();
        self.oplog
            .append(&self.room_id, &applied, ts, version + 1)
            .await?;

        st.applied.push(applied.clone());
        st.version += 1;

        let frame = ServerFrame::Operation {
            ts: rfc3339(ts),
            operation: applied.clone(),
        };
        match serde_json::to_string(&frame) {
            Ok(payload) => Self::fan_out(&mut st, &self.room_id, payload, ts),
            Err(e) => log::error!("room {}: failed to encode broadcast: {e}", self.room_id),
        }

        Ok(applied)
    }

    /// Enqueue `payload` for every live member, including the sender, and
    /// advance each recipient's watermark. Members whose queue is gone are
    /// deregistered; the rest still get the frame.
    fn fan_out(st: &mut RoomState, room_id: &str, payload: String, ts: DateTime<Utc>) {
        let RoomState {
            members, last_seen, ..
        } = st;

        let mut dead = Vec::new();
        for (conn_id, member) in members.iter() {
            if member.tx.send(payload.clone()).is_ok() {
                last_seen.insert(member.username.clone(), ts);
            } else {
                dead.push(*conn_id);
            }
        }
        for conn_id in dead {
            if let Some(member) = members.remove(&conn_id) {
                log::warn!("room {room_id}: dropping unreachable member {}", member.username);
            }
        }
    }

    /// Deregister a connection. Returns the remaining member count so the
    /// registry can hand an empty room to the compactor.
    pub async fn leave(&self, conn_id: Uuid) -> usize {
        let mut st = self.state.write().await;
        st.members.remove(&conn_id);
        st.members.len()
    }

    pub async fn snapshot(&self) -> RoomSnapshot {
        let st = self.state.read().await;
        RoomSnapshot {
            version: st.version,
            member_count: st.members.len(),
        }
    }

    pub async fn member_count(&self) -> usize {
        self.state.read().await.members.len()
    }

    pub async fn version(&self) -> u64 {
        self.state.read().await.version
    }

    pub async fn is_closed(&self) -> bool {
        self.state.read().await.closed
    }

    /// The applied history, for the compactor's convergence tests.
    pub async fn applied_ops(&self) -> Vec<AppliedOperation> {
        self.state.read().await.applied.clone()
    }

    /// Take the room's write lock for compaction, but only if it is empty
    /// and still open. While the guard is held no join or submit can touch
    /// the room; `commit` tombstones it so late joiners retry through the
    /// registry and get a fresh room.
    pub async fn lock_for_compaction(&self) -> Option<CompactionGuard<'_>> {
        let st = self.state.write().await;
        if st.closed || !st.members.is_empty() {
            return None;
        }
        Some(CompactionGuard { st })
    }
}

/// Exclusive hold on an empty room for the duration of a compaction run.
pub struct CompactionGuard<'a> {
    st: tokio::sync::RwLockWriteGuard<'a, RoomState>,
}

impl CompactionGuard<'_> {
    /// Mark the room closed. Dropping the guard without calling this leaves
    /// the room usable, which is the failure path: compaction is retried on
    /// a later empty-room event.
    pub fn commit(mut self) {
        self.st.closed = true;
    }
}
