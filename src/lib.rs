//! # draftly-collab — real-time collaborative editing core
//!
//! Clients in a shared room (one room per document) stream small edit
//! operations over WebSocket. The server serializes them into one global
//! order per room, rewrites concurrent edits so every client converges, logs
//! the ordered stream durably, and replays missed edits on reconnect. When
//! the last client leaves, the room's log is folded onto the document's
//! baseline in object storage.
//!
//! ## Architecture
//!
//! ```text
//! Client A ──┐
//!             ├── /ws/{roomID} ── Room (OT engine) ── OperationLog
//! Client B ──┘                        │                (Postgres / file)
//!                                     │ broadcast fan-out
//!                          ┌──────────┼───────────┐
//!                          ▼          ▼           ▼
//!                       Client A   Client B    Client C
//!
//! on room empty:  Registry ── Compactor ── BaselineStore (S3) + log truncate
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire frames and the operation model
//! - [`room`] — per-room OT engine, membership, broadcast
//! - [`registry`] — room lifecycle, liveness, compaction handoff
//! - [`server`] — health endpoint and WebSocket sessions
//! - [`compactor`] — log-onto-baseline folding with crash-safe intents
//! - [`storage`] — operation log, baseline store, document metadata
//! - [`config`] / [`context`] — startup wiring, no global state

pub mod compactor;
pub mod config;
pub mod context;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;
pub mod storage;

pub use compactor::{CompactError, CompactOutcome, Compactor};
pub use config::{Config, ConfigError};
pub use context::{Context, StartupError};
pub use protocol::{AppliedOperation, ErrorFrame, OpKind, Operation, ServerFrame, ValidationError};
pub use registry::{RegistryError, RoomRegistry};
pub use room::{JoinResult, Room, RoomSnapshot, SubmitError};
pub use storage::{BaselineStore, LogEntry, MetadataStore, OperationLog, StorageError};
