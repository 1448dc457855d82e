// src/provenance.rs
//! Append-only structural event log for a chat: who forked where, what got
//! merged back. Entries are decoded against a closed set of action tags;
//! anything unknown or malformed is a hard error, because a provenance log
//! rendered as complete must actually be complete.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub const ACTION_BRANCH_CREATED: &str = "branch-created";
pub const ACTION_BRANCH_MERGED: &str = "branch-merged";

/// Payload of a `branch-created` entry: which branch forked, and how long
/// the trunk was at that moment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchCreated {
    pub branch_id: Uuid,
    pub origin_message_idx: usize,
}

/// Payload of a `branch-merged` entry: which branch landed, where the trunk
/// ended before the merge, and how many messages came over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchMerged {
    pub branch_id: Uuid,
    pub merged_at_idx: usize,
    pub merged_count: usize,
}

/// A decoded provenance entry. The serde tag doubles as the persisted
/// action name, so the wire shape and the storage shape stay in sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action")]
pub enum LogEntry {
    #[serde(rename = "branch-created")]
    BranchCreated(BranchCreated),
    #[serde(rename = "branch-merged")]
    BranchMerged(BranchMerged),
}

#[derive(Debug, Error)]
pub enum LogDecodeError {
    #[error("unknown log action `{0}`")]
    UnknownAction(String),
    #[error("malformed `{action}` payload: {source}")]
    MalformedPayload {
        action: String,
        #[source]
        source: serde_json::Error,
    },
}

impl LogEntry {
    /// Persisted action tag for this entry.
    pub fn action(&self) -> &'static str {
        match self {
            LogEntry::BranchCreated(_) => ACTION_BRANCH_CREATED,
            LogEntry::BranchMerged(_) => ACTION_BRANCH_MERGED,
        }
    }

    /// Action-specific metadata, serialized for storage.
    pub fn payload(&self) -> Value {
        match self {
            LogEntry::BranchCreated(meta) => {
                serde_json::to_value(meta).expect("branch-created payload serializes")
            }
            LogEntry::BranchMerged(meta) => {
                serde_json::to_value(meta).expect("branch-merged payload serializes")
            }
        }
    }

    /// Decode one stored record by matching its action tag against the
    /// known set. Unknown tags are rejected, not skipped: silently dropping
    /// entries would present an incomplete log as complete.
    pub fn decode(action: &str, payload: &Value) -> Result<Self, LogDecodeError> {
        match action {
            ACTION_BRANCH_CREATED => serde_json::from_value(payload.clone())
                .map(LogEntry::BranchCreated)
                .map_err(|source| LogDecodeError::MalformedPayload {
                    action: action.to_string(),
                    source,
                }),
            ACTION_BRANCH_MERGED => serde_json::from_value(payload.clone())
                .map(LogEntry::BranchMerged)
                .map_err(|source| LogDecodeError::MalformedPayload {
                    action: action.to_string(),
                    source,
                }),
            other => Err(LogDecodeError::UnknownAction(other.to_string())),
        }
    }
}

/// Decode a whole stored log, preserving insertion order. Fails on the
/// first structural problem.
pub fn decode_log(rows: &[(String, Value)]) -> Result<Vec<LogEntry>, LogDecodeError> {
    rows.iter()
        .map(|(action, payload)| LogEntry::decode(action, payload))
        .collect()
}
