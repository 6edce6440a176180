//! Thin typed accessor over the documents table.
//!
//! The core reads `baseline_key` when a room is created and rewrites it when
//! the compactor uploads a new baseline. Everything else in the documents
//! table belongs to the management service.

use std::collections::HashMap;

use sqlx::postgres::PgPool;
use sqlx::Row;
use tokio::sync::RwLock;

use super::StorageError;

enum MetaBackend {
    Postgres(PgPool),
    /// In-memory table for tests and single-process development. Unknown
    /// documents behave like rows with a NULL key.
    Memory(RwLock<HashMap<i64, Option<String>>>),
}

/// `baseline_key` lookup and update for documents.
pub struct MetadataStore {
    backend: MetaBackend,
}

impl MetadataStore {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            backend: MetaBackend::Postgres(pool),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            backend: MetaBackend::Memory(RwLock::new(HashMap::new())),
        }
    }

    /// The document's current baseline key; `None` when no baseline has been
    /// uploaded yet.
    pub async fn baseline_key(&self, document_id: i64) -> Result<Option<String>, StorageError> {
        match &self.backend {
            MetaBackend::Postgres(pool) => {
                let row = sqlx::query("SELECT baseline_key FROM documents WHERE id = $1")
                    .bind(document_id)
                    .fetch_optional(pool)
                    .await?
                    .ok_or_else(|| StorageError::NotFound(format!("document {document_id}")))?;
                Ok(row.try_get("baseline_key")?)
            }
            MetaBackend::Memory(table) => {
                Ok(table.read().await.get(&document_id).cloned().flatten())
            }
        }
    }

    /// Point the document at a freshly uploaded baseline.
    pub async fn set_baseline_key(
        &self,
        document_id: i64,
        key: &str,
    ) -> Result<(), StorageError> {
        match &self.backend {
            MetaBackend::Postgres(pool) => {
                let result = sqlx::query(
                    "UPDATE documents SET baseline_key = $1, updated_at = NOW() WHERE id = $2",
                )
                .bind(key)
                .bind(document_id)
                .execute(pool)
                .await?;
                if result.rows_affected() == 0 {
                    return Err(StorageError::NotFound(format!("document {document_id}")));
                }
                Ok(())
            }
            MetaBackend::Memory(table) => {
                table
                    .write()
                    .await
                    .insert(document_id, Some(key.to_string()));
                Ok(())
            }
        }
    }
}
