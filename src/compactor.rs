//! Folds a room's operation log onto the document baseline.
//!
//! ```text
//! read log ──► fetch baseline ──► fold (code-point apply)
//!                                      │
//!                                      ▼
//!                        write intent (room, boundary, content)
//!                                      │
//!                                      ▼
//!          upload baseline ──► update metadata ──► truncate log ≤ boundary
//!                                      │
//!                                      ▼
//!                                remove intent
//! ```
//!
//! The intent record is written before any external mutation and carries the
//! folded content itself, so every later step is idempotent: re-running
//! `commit` after a crash re-uploads the same bytes, re-points the metadata
//! at the same key, and re-truncates the same bounded range. A crash at any
//! point therefore leaves the document recoverable to exactly one of
//! (old baseline + full log) or (new baseline + log drained to the
//! boundary). Operations appended after the boundary survive for the next
//! cycle. Startup calls [`Compactor::recover`] to drain stale intents.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::{BaselineStore, MetadataStore, OperationLog, StorageError};

/// Durable record of a fold that has not yet been fully committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionIntent {
    pub room_id: String,
    pub document_id: i64,
    /// Timestamp of the last log entry folded into `content`; truncation is
    /// bounded here.
    pub folded_through: DateTime<Utc>,
    /// The folded document, ready to upload.
    pub content: String,
    /// FNV fold over the other fields, checked before replay.
    pub checksum: u32,
}

impl CompactionIntent {
    pub fn new(
        room_id: impl Into<String>,
        document_id: i64,
        folded_through: DateTime<Utc>,
        content: impl Into<String>,
    ) -> Self {
        let room_id = room_id.into();
        let content = content.into();
        let checksum = Self::compute_checksum(&room_id, document_id, folded_through, &content);
        Self {
            room_id,
            document_id,
            folded_through,
            content,
            checksum,
        }
    }

    pub fn verify(&self) -> bool {
        self.checksum
            == Self::compute_checksum(
                &self.room_id,
                self.document_id,
                self.folded_through,
                &self.content,
            )
    }

    fn compute_checksum(
        room_id: &str,
        document_id: i64,
        folded_through: DateTime<Utc>,
        content: &str,
    ) -> u32 {
        let mut hash: u32 = 0x811c_9dc5; // FNV offset basis
        let mut mix = |word: u32| {
            hash ^= word;
            hash = hash.wrapping_mul(0x0100_0193); // FNV prime
        };
        for byte in room_id.as_bytes() {
            mix(*byte as u32);
        }
        mix(document_id as u32);
        mix((document_id >> 32) as u32);
        let micros = folded_through.timestamp_micros();
        mix(micros as u32);
        mix((micros >> 32) as u32);
        for chunk in content.as_bytes().chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            mix(u32::from_le_bytes(word));
        }
        hash
    }
}

/// What a compaction run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactOutcome {
    /// The log was empty; nothing to fold, the room can still be evicted.
    NothingToFold,
    Compacted { operations: usize, bytes: usize },
}

#[derive(Debug, Error)]
pub enum CompactError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("baseline for document {0} is not valid UTF-8")]
    NotUtf8(i64),
}

/// The compaction pipeline.
pub struct Compactor {
    oplog: Arc<OperationLog>,
    baselines: Arc<BaselineStore>,
    metadata: Arc<MetadataStore>,
    intent_dir: PathBuf,
}

impl Compactor {
    pub async fn new(
        oplog: Arc<OperationLog>,
        baselines: Arc<BaselineStore>,
        metadata: Arc<MetadataStore>,
        intent_dir: impl Into<PathBuf>,
    ) -> Result<Self, CompactError> {
        let intent_dir = intent_dir.into();
        tokio::fs::create_dir_all(&intent_dir)
            .await
            .map_err(StorageError::from)?;
        Ok(Self {
            oplog,
            baselines,
            metadata,
            intent_dir,
        })
    }

    /// Compact one room: complete any pending intent first, then fold the
    /// remaining log entries onto the baseline and commit.
    ///
    /// On error the log and metadata are left as they were; the registry
    /// retries on a later empty-room event.
    pub async fn compact(
        &self,
        room_id: &str,
        document_id: i64,
    ) -> Result<CompactOutcome, CompactError> {
        // A pending intent means an earlier run crashed mid-commit. Folding
        // again before draining it would re-apply its operations.
        if let Some(intent) = self.load_intent(room_id).await? {
            log::info!("room {room_id}: completing pending compaction intent");
            self.commit(&intent).await?;
        }

        let entries = self.oplog.entries(room_id).await?;
        let Some(last) = entries.last() else {
            return Ok(CompactOutcome::NothingToFold);
        };
        let folded_through = last.applied_at;

        if let Some(key) = self.metadata.baseline_key(document_id).await? {
            log::debug!("room {room_id}: folding onto baseline {key}");
        }
        let baseline = self.baselines.fetch(document_id).await?;
        let mut content =
            String::from_utf8(baseline).map_err(|_| CompactError::NotUtf8(document_id))?;
        for entry in &entries {
            content = entry.operation.op.apply_to(&content);
        }

        let operations = entries.len();
        let bytes = content.len();
        let intent = CompactionIntent::new(room_id, document_id, folded_through, content);
        self.write_intent(&intent).await?;
        self.commit(&intent).await?;

        Ok(CompactOutcome::Compacted { operations, bytes })
    }

    /// Replay every step after the intent. Each step is idempotent, so this
    /// is safe to run any number of times for the same intent.
    async fn commit(&self, intent: &CompactionIntent) -> Result<(), CompactError> {
        let key = self
            .baselines
            .upload(intent.document_id, intent.content.as_bytes())
            .await?;
        self.metadata
            .set_baseline_key(intent.document_id, &key)
            .await?;
        self.oplog
            .truncate_through(&intent.room_id, intent.folded_through)
            .await?;
        self.remove_intent(&intent.room_id).await?;
        Ok(())
    }

    /// Scan for stale intents on startup and drain them. A failure to
    /// commit one intent is logged and skipped; the intent stays on disk and
    /// the next compaction of that room completes it first.
    pub async fn recover(&self) -> Result<usize, CompactError> {
        let mut dir = match tokio::fs::read_dir(&self.intent_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StorageError::from(e).into()),
        };

        let mut recovered = 0;
        while let Some(entry) = dir.next_entry().await.map_err(StorageError::from)? {
            let path = entry.path();
            let bytes = tokio::fs::read(&path).await.map_err(StorageError::from)?;
            match serde_json::from_slice::<CompactionIntent>(&bytes) {
                Ok(intent) if intent.verify() => {
                    log::info!(
                        "recovering compaction intent for room {} ({} bytes)",
                        intent.room_id,
                        intent.content.len()
                    );
                    match self.commit(&intent).await {
                        Ok(()) => recovered += 1,
                        Err(e) => {
                            log::error!(
                                "room {}: intent recovery failed, keeping intent: {e}",
                                intent.room_id
                            );
                        }
                    }
                }
                _ => {
                    log::warn!("removing corrupt compaction intent {}", path.display());
                    tokio::fs::remove_file(&path)
                        .await
                        .map_err(StorageError::from)?;
                }
            }
        }
        Ok(recovered)
    }

    fn intent_path(&self, room_id: &str) -> PathBuf {
        self.intent_dir.join(format!("{room_id}.json"))
    }

    // Written via temp file + rename so a crash never leaves a torn intent.
    async fn write_intent(&self, intent: &CompactionIntent) -> Result<(), CompactError> {
        let path = self.intent_path(&intent.room_id);
        let tmp = path.with_extension("part");
        let bytes = serde_json::to_vec(intent)
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(StorageError::from)?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(StorageError::from)?;
        Ok(())
    }

    async fn load_intent(&self, room_id: &str) -> Result<Option<CompactionIntent>, CompactError> {
        let path = self.intent_path(room_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::from(e).into()),
        };
        match serde_json::from_slice::<CompactionIntent>(&bytes) {
            Ok(intent) if intent.verify() => Ok(Some(intent)),
            _ => {
                log::warn!("removing corrupt compaction intent {}", path.display());
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(StorageError::from)?;
                Ok(None)
            }
        }
    }

    async fn remove_intent(&self, room_id: &str) -> Result<(), CompactError> {
        match tokio::fs::remove_file(self.intent_path(room_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::from(e).into()),
        }
    }
}
