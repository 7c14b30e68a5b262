//! Storage seam: conversation events and append-only debug logs.
//!
//! Durable persistence is an external collaborator. The in-memory store is
//! the default implementation (bounded, newest kept) and the unit of exchange
//! matches the durable schema: `conversation_events(call_id, trace_id?,
//! event_type, sequence, payload, created_at)` and `debug_logs(time_created,
//! debug_type_identifier, jsonblob)`.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::conversation::{CallIdInfo, ConversationEvent, DebugLogEntry};

const MAX_RETAINED: usize = 10_000;

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn record_events(&self, events: Vec<ConversationEvent>) -> Result<(), String>;
    async fn load_events_for_call(&self, call_id: &str) -> Result<Vec<ConversationEvent>, String>;
    async fn recent_calls(&self, limit: usize) -> Result<Vec<CallIdInfo>, String>;
}

#[async_trait]
pub trait DebugLogStore: Send + Sync {
    async fn append(&self, debug_type: &str, record: Value) -> Result<(), String>;
    async fn entries_with_prefix(&self, prefix: &str) -> Result<Vec<DebugLogEntry>, String>;
}

/// Bounded in-memory store implementing both seams.
#[derive(Default)]
pub struct MemoryStore {
    events: Mutex<Vec<ConversationEvent>>,
    debug_logs: Mutex<Vec<DebugLogEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn push_bounded<T>(items: &mut Vec<T>, item: T) {
    if items.len() >= MAX_RETAINED {
        items.remove(0);
    }
    items.push(item);
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn record_events(&self, events: Vec<ConversationEvent>) -> Result<(), String> {
        let mut stored = self
            .events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for event in events {
            push_bounded(&mut stored, event);
        }
        Ok(())
    }

    async fn load_events_for_call(&self, call_id: &str) -> Result<Vec<ConversationEvent>, String> {
        let stored = self
            .events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut events: Vec<ConversationEvent> = stored
            .iter()
            .filter(|e| e.call_id == call_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| {
            (a.sequence, a.timestamp, a.event_type).cmp(&(b.sequence, b.timestamp, b.event_type))
        });
        Ok(events)
    }

    async fn recent_calls(&self, limit: usize) -> Result<Vec<CallIdInfo>, String> {
        let stored = self
            .events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut by_call: HashMap<&str, CallIdInfo> = HashMap::new();
        for event in stored.iter() {
            let info = by_call
                .entry(event.call_id.as_str())
                .or_insert_with(|| CallIdInfo {
                    call_id: event.call_id.clone(),
                    event_count: 0,
                    last_seen: event.timestamp,
                });
            info.event_count += 1;
            if event.timestamp > info.last_seen {
                info.last_seen = event.timestamp;
            }
        }
        let mut calls: Vec<CallIdInfo> = by_call.into_values().collect();
        calls.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        calls.truncate(limit);
        Ok(calls)
    }
}

#[async_trait]
impl DebugLogStore for MemoryStore {
    async fn append(&self, debug_type: &str, record: Value) -> Result<(), String> {
        let mut logs = self
            .debug_logs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        push_bounded(
            &mut logs,
            DebugLogEntry {
                time_created: Utc::now(),
                debug_type_identifier: debug_type.to_string(),
                jsonblob: record,
            },
        );
        Ok(())
    }

    async fn entries_with_prefix(&self, prefix: &str) -> Result<Vec<DebugLogEntry>, String> {
        let logs = self
            .debug_logs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(logs
            .iter()
            .filter(|e| e.debug_type_identifier.starts_with(prefix))
            .cloned()
            .collect())
    }
}
