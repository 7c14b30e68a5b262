//! Conversation tracing: event building, chunk counters, snapshot folds.

pub mod events;
pub mod models;
pub mod snapshots;
pub mod utils;

pub use events::{
    build_conversation_events, events_from_debug_entries, ChunkStream, StreamIndexStore,
};
pub use models::{
    CallIdInfo, CallStatus, ConversationCallSnapshot, ConversationEvent, ConversationMessageDiff,
    ConversationSnapshot, DebugLogEntry, EventType, Message,
};
pub use snapshots::build_call_snapshots;
