//! JSON wire protocol for the collaboration socket.
//!
//! Client → server frames are bare [`Operation`] objects. Server → client
//! frames are either a [`ServerFrame`] (history replay or an applied-operation
//! broadcast) or an [`ErrorFrame`]:
//!
//! ```text
//! { "kind":"insert", "position":0, "text":"Hello", "length":0,
//!   "version":0, "sequence_number":1, "cursor_position":5 }
//!
//! { "type":"history",   "since":"<RFC3339>", "operations":[ ... ] }
//! { "type":"operation", "ts":"<RFC3339>",    "operation":{ ... } }
//! { "error":"<short>",  "details":"<detail>" }
//! ```
//!
//! All positions are zero-based indices into the document's Unicode
//! code-point sequence, never byte offsets.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Edit operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Insert,
    Delete,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Insert => "insert",
            OpKind::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(OpKind::Insert),
            "delete" => Some(OpKind::Delete),
            _ => None,
        }
    }
}

/// A single edit submitted by a client.
///
/// `version` on the wire is the server version the client believed it was
/// editing against (`client_version` internally). `sequence_number` and
/// `cursor_position` are client-side bookkeeping; the server echoes them
/// untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OpKind,
    pub position: i64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub length: i64,
    #[serde(rename = "version")]
    pub client_version: i64,
    #[serde(default)]
    pub sequence_number: i64,
    #[serde(default)]
    pub cursor_position: i64,
}

impl Operation {
    /// Shorthand constructor for an insert.
    pub fn insert(position: i64, text: impl Into<String>, client_version: i64) -> Self {
        Self {
            kind: OpKind::Insert,
            position,
            text: text.into(),
            length: 0,
            client_version,
            sequence_number: 0,
            cursor_position: 0,
        }
    }

    /// Shorthand constructor for a delete.
    pub fn delete(position: i64, length: i64, client_version: i64) -> Self {
        Self {
            kind: OpKind::Delete,
            position,
            text: String::new(),
            length,
            client_version,
            sequence_number: 0,
            cursor_position: 0,
        }
    }

    /// Validate the operation's shape. Stateless; the room additionally
    /// rejects `client_version` ahead of its own version.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.position < 0 {
            return Err(ValidationError::NegativePosition(self.position));
        }
        if self.client_version < 0 {
            return Err(ValidationError::NegativeVersion(self.client_version));
        }
        match self.kind {
            OpKind::Insert => {
                if self.text.is_empty() {
                    return Err(ValidationError::EmptyInsertText);
                }
            }
            OpKind::Delete => {
                if self.length <= 0 {
                    return Err(ValidationError::NonPositiveDeleteLength(self.length));
                }
                if !self.text.is_empty() {
                    return Err(ValidationError::DeleteCarriesText);
                }
            }
        }
        Ok(())
    }

    /// Apply this operation to `content`, splicing on the code-point
    /// sequence. Out-of-range operations leave the content unchanged.
    pub fn apply_to(&self, content: &str) -> String {
        let chars: Vec<char> = content.chars().collect();
        match self.kind {
            OpKind::Insert => {
                if self.position < 0 {
                    return content.to_string();
                }
                let pos = self.position as usize;
                if pos > chars.len() {
                    return content.to_string();
                }
                let mut out = String::with_capacity(content.len() + self.text.len());
                out.extend(chars[..pos].iter());
                out.push_str(&self.text);
                out.extend(chars[pos..].iter());
                out
            }
            OpKind::Delete => {
                if self.position < 0 || self.length < 0 {
                    return content.to_string();
                }
                let start = self.position as usize;
                let end = start + self.length as usize;
                if start > chars.len() || end > chars.len() {
                    return content.to_string();
                }
                chars[..start].iter().chain(chars[end..].iter()).collect()
            }
        }
    }

    /// Number of code points carried by an insert.
    pub fn text_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// An operation as the server applied it: the transformed position plus the
/// index it occupies in the room's history. Serialized flat, so collaborators
/// see the original operation fields with `server_version` alongside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedOperation {
    #[serde(flatten)]
    pub op: Operation,
    pub server_version: u64,
}

/// Server → client frames with a `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    /// Replay of operations missed since the member's watermark, sent once
    /// on join before any live broadcast.
    History {
        since: String,
        operations: Vec<AppliedOperation>,
    },
    /// Fan-out of one applied operation, sent to every member including the
    /// sender (the echo doubles as the ack).
    Operation {
        ts: String,
        operation: AppliedOperation,
    },
}

/// Error frame. The session stays open after one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: String,
    pub details: String,
}

impl ErrorFrame {
    pub fn new(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: details.into(),
        }
    }
}

/// Why an operation was rejected before reaching the history.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("position cannot be negative: {0}")]
    NegativePosition(i64),
    #[error("version cannot be negative: {0}")]
    NegativeVersion(i64),
    #[error("text cannot be empty for insert")]
    EmptyInsertText,
    #[error("length must be positive for delete: {0}")]
    NonPositiveDeleteLength(i64),
    #[error("text must be empty for delete")]
    DeleteCarriesText,
    #[error("client version {client} is ahead of room version {server}")]
    VersionAhead { client: i64, server: u64 },
}
