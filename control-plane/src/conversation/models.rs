//! Conversation data model: events, snapshots, diffs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of a conversation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RequestStarted,
    OriginalChunk,
    FinalChunk,
    RequestCompleted,
}

/// Structured record emitted by the hook dispatcher for one observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEvent {
    pub call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub event_type: EventType,
    /// Monotonic ordering basis, nanoseconds.
    pub sequence: i64,
    pub timestamp: DateTime<Utc>,
    pub hook: String,
    pub payload: Value,
}

/// A `{role, content}` message in flattened text form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Canonical status of a call snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Pending,
    Success,
    StreamSummary,
    Failure,
    Streaming,
}

/// Per-message difference between the original and final request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessageDiff {
    pub role: String,
    pub original: String,
    #[serde(rename = "final")]
    pub final_text: String,
}

/// Aggregated view of one call, folded from its events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationCallSnapshot {
    pub call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: CallStatus,
    pub new_messages: Vec<ConversationMessageDiff>,
    pub request_original_messages: Vec<Message>,
    pub request_final_messages: Vec<Message>,
    pub original_response: String,
    pub final_response: String,
    pub chunk_count: usize,
    pub original_chunks: Vec<String>,
    pub final_chunks: Vec<String>,
}

/// Read-path response: all events for a call plus its folded snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub events: Vec<ConversationEvent>,
    pub calls: Vec<ConversationCallSnapshot>,
}

/// Entry of the recent-calls listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallIdInfo {
    pub call_id: String,
    pub event_count: usize,
    pub last_seen: DateTime<Utc>,
}

/// One stored debug-log record, as replayed by the event reconstruction path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugLogEntry {
    pub time_created: DateTime<Utc>,
    pub debug_type_identifier: String,
    pub jsonblob: Value,
}
