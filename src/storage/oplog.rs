//! Append-only, per-room operation log.
//!
//! The log is the source of truth for reconnect replay: once `append`
//! returns, the operation survives a process restart and `since` hands it to
//! any member whose watermark predates it. Two backends share the contract:
//!
//! - **Postgres** — one row per operation in the `operations` table, keyed
//!   `(room_id, applied_at)`; room timestamps are strictly monotonic, so the
//!   key is unique and orders replay.
//! - **File** — one JSON document per line (see [`LogRecord`]), for
//!   development and tests. Unlike a comma-separated layout, the framing
//!   survives commas and newlines inside operation text.
//!
//! Consumers always observe operations in append order for a room; both
//! backends sort replies by `(applied_at, applied_version)`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::Row;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::StorageError;
use crate::protocol::{AppliedOperation, OpKind, Operation};

/// One log row: the applied operation plus where it landed in the room's
/// history. `applied_version` is the room version *after* applying.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub operation: AppliedOperation,
    pub applied_at: DateTime<Utc>,
    pub applied_version: u64,
}

/// On-disk framing for the file backend, one per line.
///
/// Parser contract: each line is a complete JSON object with `room_id`
/// (string), `applied_at` (RFC3339), `applied_version` (integer) and
/// `operation` (the applied operation with its flattened `server_version`).
/// Blank lines are skipped; lines that fail to parse are skipped with a
/// warning, so a torn tail write cannot poison replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogRecord {
    room_id: String,
    applied_at: DateTime<Utc>,
    applied_version: u64,
    operation: AppliedOperation,
}

enum LogBackend {
    Postgres(PgPool),
    File {
        path: PathBuf,
        // Serializes readers against the rewrite done by truncation.
        guard: Mutex<()>,
    },
}

/// The per-room operation log.
pub struct OperationLog {
    backend: LogBackend,
}

impl OperationLog {
    /// Log backed by the relational `operations` table.
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            backend: LogBackend::Postgres(pool),
        }
    }

    /// Log backed by a single JSON-per-line file.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: LogBackend::File {
                path: path.into(),
                guard: Mutex::new(()),
            },
        }
    }

    /// Append one applied operation. Durable before returning `Ok`.
    pub async fn append(
        &self,
        room_id: &str,
        operation: &AppliedOperation,
        applied_at: DateTime<Utc>,
        applied_version: u64,
    ) -> Result<(), StorageError> {
        match &self.backend {
            LogBackend::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO operations \
                     (room_id, kind, position, text, length, client_version, \
                      sequence_number, cursor_position, server_version, applied_at, applied_version) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
                )
                .bind(room_id)
                .bind(operation.op.kind.as_str())
                .bind(operation.op.position)
                .bind(operation.op.text.as_str())
                .bind(operation.op.length)
                .bind(operation.op.client_version)
                .bind(operation.op.sequence_number)
                .bind(operation.op.cursor_position)
                .bind(operation.server_version as i64)
                .bind(applied_at)
                .bind(applied_version as i64)
                .execute(pool)
                .await?;
                Ok(())
            }
            LogBackend::File { path, guard } => {
                let _held = guard.lock().await;
                let record = LogRecord {
                    room_id: room_id.to_string(),
                    applied_at,
                    applied_version,
                    operation: operation.clone(),
                };
                let mut line = serde_json::to_string(&record)
                    .map_err(|e| StorageError::Corrupt(e.to_string()))?;
                line.push('\n');
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?;
                file.write_all(line.as_bytes()).await?;
                file.sync_data().await?;
                Ok(())
            }
        }
    }

    /// Operations for `room_id` strictly after `ts`, ascending.
    pub async fn since(
        &self,
        room_id: &str,
        ts: DateTime<Utc>,
    ) -> Result<Vec<AppliedOperation>, StorageError> {
        let entries = self.entries_filtered(room_id, Some(ts)).await?;
        Ok(entries.into_iter().map(|e| e.operation).collect())
    }

    /// Every entry for `room_id`, ascending. Used by the compactor.
    pub async fn entries(&self, room_id: &str) -> Result<Vec<LogEntry>, StorageError> {
        self.entries_filtered(room_id, None).await
    }

    /// Remove every entry for `room_id`. Returns the number removed.
    pub async fn truncate(&self, room_id: &str) -> Result<u64, StorageError> {
        self.truncate_filtered(room_id, None).await
    }

    /// Remove entries for `room_id` with `applied_at <= through`. Entries
    /// appended after a compaction fold survive for the next cycle.
    pub async fn truncate_through(
        &self,
        room_id: &str,
        through: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        self.truncate_filtered(room_id, Some(through)).await
    }

    async fn entries_filtered(
        &self,
        room_id: &str,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<LogEntry>, StorageError> {
        match &self.backend {
            LogBackend::Postgres(pool) => {
                let rows = match after {
                    Some(ts) => {
                        sqlx::query(
                            "SELECT kind, position, text, length, client_version, \
                             sequence_number, cursor_position, server_version, applied_at, applied_version \
                             FROM operations WHERE room_id = $1 AND applied_at > $2 \
                             ORDER BY applied_at ASC, applied_version ASC",
                        )
                        .bind(room_id)
                        .bind(ts)
                        .fetch_all(pool)
                        .await?
                    }
                    None => {
                        sqlx::query(
                            "SELECT kind, position, text, length, client_version, \
                             sequence_number, cursor_position, server_version, applied_at, applied_version \
                             FROM operations WHERE room_id = $1 \
                             ORDER BY applied_at ASC, applied_version ASC",
                        )
                        .bind(room_id)
                        .fetch_all(pool)
                        .await?
                    }
                };

                let mut entries = Vec::with_capacity(rows.len());
                for row in rows {
                    let kind: String = row.try_get("kind")?;
                    let kind = OpKind::parse(&kind).ok_or_else(|| {
                        StorageError::Corrupt(format!("unknown operation kind: {kind}"))
                    })?;
                    let operation = AppliedOperation {
                        op: Operation {
                            kind,
                            position: row.try_get("position")?,
                            text: row.try_get("text")?,
                            length: row.try_get("length")?,
                            client_version: row.try_get("client_version")?,
                            sequence_number: row.try_get("sequence_number")?,
                            cursor_position: row.try_get("cursor_position")?,
                        },
                        server_version: row.try_get::<i64, _>("server_version")? as u64,
                    };
                    entries.push(LogEntry {
                        operation,
                        applied_at: row.try_get("applied_at")?,
                        applied_version: row.try_get::<i64, _>("applied_version")? as u64,
                    });
                }
                Ok(entries)
            }
            LogBackend::File { path, guard } => {
                let _held = guard.lock().await;
                let mut entries = Self::read_records(path, room_id).await?;
                if let Some(ts) = after {
                    entries.retain(|e| e.applied_at > ts);
                }
                entries.sort_by_key(|e| (e.applied_at, e.applied_version));
                Ok(entries)
            }
        }
    }

    async fn truncate_filtered(
        &self,
        room_id: &str,
        through: Option<DateTime<Utc>>,
    ) -> Result<u64, StorageError> {
        match &self.backend {
            LogBackend::Postgres(pool) => {
                let result = match through {
                    Some(ts) => {
                        sqlx::query(
                            "DELETE FROM operations WHERE room_id = $1 AND applied_at <= $2",
                        )
                        .bind(room_id)
                        .bind(ts)
                        .execute(pool)
                        .await?
                    }
                    None => {
                        sqlx::query("DELETE FROM operations WHERE room_id = $1")
                            .bind(room_id)
                            .execute(pool)
                            .await?
                    }
                };
                Ok(result.rows_affected())
            }
            LogBackend::File { path, guard } => {
                let _held = guard.lock().await;
                let content = match tokio::fs::read_to_string(path).await {
                    Ok(c) => c,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
                    Err(e) => return Err(e.into()),
                };

                let mut kept = String::with_capacity(content.len());
                let mut removed = 0u64;
                for line in content.lines() {
                    if line.is_empty() {
                        continue;
                    }
                    let remove = match serde_json::from_str::<LogRecord>(line) {
                        Ok(r) if r.room_id == room_id => {
                            through.is_none_or(|ts| r.applied_at <= ts)
                        }
                        // Records of other rooms and unparsable lines stay.
                        _ => false,
                    };
                    if remove {
                        removed += 1;
                    } else {
                        kept.push_str(line);
                        kept.push('\n');
                    }
                }

                // Rewrite through a temp file so a crash mid-truncate leaves
                // either the old or the new log, never a torn one.
                let tmp = path.with_extension("tmp");
                tokio::fs::write(&tmp, kept.as_bytes()).await?;
                tokio::fs::rename(&tmp, path).await?;
                Ok(removed)
            }
        }
    }

    async fn read_records(path: &Path, room_id: &str) -> Result<Vec<LogEntry>, StorageError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for line in content.lines() {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<LogRecord>(line) {
                Ok(r) if r.room_id == room_id => entries.push(LogEntry {
                    operation: r.operation,
                    applied_at: r.applied_at,
                    applied_version: r.applied_version,
                }),
                Ok(_) => {}
                Err(e) => {
                    log::warn!("skipping malformed operation log line: {e}");
                }
            }
        }
        Ok(entries)
    }
}
