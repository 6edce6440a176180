//! Durable storage behind the collaboration core.
//!
//! ```text
//! ┌──────────┐  append/since/truncate  ┌───────────────┐
//! │   Room   │ ──────────────────────► │ OperationLog  │
//! └────┬─────┘                         │ (Postgres or  │
//!      │                               │  framed file) │
//!      │ on empty room                 └───────────────┘
//!      ▼
//! ┌───────────┐  fetch/upload   ┌───────────────┐   baseline_key   ┌───────────────┐
//! │ Compactor │ ──────────────► │ BaselineStore │ ◄──────────────► │ MetadataStore │
//! └───────────┘                 │ (S3 + scratch │                  │ (documents    │
//!                               │  read cache)  │                  │  table)       │
//!                               └───────────────┘                  └───────────────┘
//! ```
//!
//! Each store carries a second backend (file, local directory, in-memory
//! table) so the whole pipeline runs in a single process for development and
//! tests.

pub mod baseline;
pub mod metadata;
pub mod oplog;

pub use baseline::BaselineStore;
pub use metadata::MetadataStore;
pub use oplog::{LogEntry, OperationLog};

use thiserror::Error;

/// Storage-layer errors. `NotFound` is the only variant callers branch on;
/// everything else is transient and surfaced to the client as an error frame.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("object store error: {0}")]
    ObjectStore(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed record: {0}")]
    Corrupt(String),
}
