//! Conversation event builder: hook invocation → 0+ events with stable order.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use super::models::{ConversationEvent, DebugLogEntry, EventType};
use super::utils::{
    delta_from_chunk, derive_sequence_ns2, extract_call_id, extract_choice_index,
    extract_response_text, extract_stream_chunk, extract_trace_id, messages_from_payload,
    unwrap_response,
};

/// Which per-call chunk counter to advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStream {
    Original,
    Final,
}

/// Per-call `original`/`final` chunk counters.
///
/// Initialised on `request_started`, cleared on `request_completed`. One hook
/// invocation may advance both counters, so the whole map sits behind one
/// lock.
#[derive(Debug, Default)]
pub struct StreamIndexStore {
    indices: Mutex<HashMap<String, (usize, usize)>>,
}

impl StreamIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self, call_id: &str) {
        self.lock().insert(call_id.to_string(), (0, 0));
    }

    /// Returns the current index for the stream and advances it.
    pub fn next_index(&self, call_id: &str, stream: ChunkStream) -> usize {
        let mut indices = self.lock();
        let entry = indices.entry(call_id.to_string()).or_insert((0, 0));
        let slot = match stream {
            ChunkStream::Original => &mut entry.0,
            ChunkStream::Final => &mut entry.1,
        };
        let current = *slot;
        *slot += 1;
        current
    }

    pub fn clear(&self, call_id: &str) {
        self.lock().remove(call_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (usize, usize)>> {
        self.indices
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Translates one hook invocation into conversation events.
///
/// Two events produced from one invocation get consecutive sequence numbers
/// (`seq`, `seq + 1`) so order survives timestamp collisions.
#[allow(clippy::too_many_arguments)]
pub fn build_conversation_events(
    hook: &str,
    call_id: Option<&str>,
    trace_id: Option<&str>,
    original: Option<&Value>,
    result: Option<&Value>,
    timestamp_ns_fallback: i64,
    timestamp: DateTime<Utc>,
    indices: &StreamIndexStore,
) -> Vec<ConversationEvent> {
    let Some(call_id) = call_id.filter(|id| !id.is_empty()) else {
        return Vec::new();
    };

    let effective_trace_id = trace_id
        .map(str::to_string)
        .or_else(|| original.and_then(extract_trace_id))
        .or_else(|| result.and_then(extract_trace_id));

    let sequence = derive_sequence_ns2(timestamp_ns_fallback, original, result);
    let event = |event_type: EventType, sequence: i64, payload: Value| ConversationEvent {
        call_id: call_id.to_string(),
        trace_id: effective_trace_id.clone(),
        event_type,
        sequence,
        timestamp,
        hook: hook.to_string(),
        payload,
    };

    match hook {
        "pre_call" => {
            let Some(original_payload) = original else {
                return Vec::new();
            };
            let originals = messages_from_payload(original_payload).unwrap_or_default();
            let finals = result
                .and_then(|r| messages_from_payload(r).ok())
                .unwrap_or_else(|| originals.clone());
            indices.reset(call_id);
            vec![event(
                EventType::RequestStarted,
                sequence,
                json!({
                    "original_messages": originals,
                    "final_messages": finals,
                    "raw_original": original_payload,
                    "raw_result": result.unwrap_or(original_payload),
                }),
            )]
        }
        "post_call_streaming_iterator" => {
            let original_chunk = extract_stream_chunk(original);
            let final_chunk = extract_stream_chunk(result);
            let source_for_index = final_chunk.or(original_chunk);
            let Some(source_for_index) = source_for_index else {
                return Vec::new();
            };
            let choice_index = extract_choice_index(source_for_index).unwrap_or(0);

            let mut events = Vec::new();
            if let Some(chunk) = original_chunk {
                let chunk_index = indices.next_index(call_id, ChunkStream::Original);
                events.push(event(
                    EventType::OriginalChunk,
                    sequence,
                    json!({
                        "chunk_index": chunk_index,
                        "delta": delta_from_chunk(Some(chunk)),
                        "choice_index": choice_index,
                        "raw_chunk": chunk,
                        "raw_payload": original,
                    }),
                ));
            }
            if let Some(chunk) = final_chunk {
                let chunk_index = indices.next_index(call_id, ChunkStream::Final);
                events.push(event(
                    EventType::FinalChunk,
                    sequence + 1,
                    json!({
                        "chunk_index": chunk_index,
                        "delta": delta_from_chunk(Some(chunk)),
                        "choice_index": choice_index,
                        "raw_chunk": chunk,
                        "raw_payload": result,
                    }),
                ));
            }
            events
        }
        "post_call_success" => {
            let original_response = unwrap_response(original);
            let final_response = unwrap_response(result);
            let original_text = original_response
                .and_then(|r| extract_response_text(r).ok())
                .unwrap_or_default();
            let final_text = final_response
                .and_then(|r| extract_response_text(r).ok())
                .unwrap_or_default();
            let events = vec![event(
                EventType::RequestCompleted,
                sequence,
                json!({
                    "status": "success",
                    "original_response": original_text,
                    "final_response": final_text,
                    "raw_original": original_response,
                    "raw_result": final_response,
                }),
            )];
            indices.clear(call_id);
            events
        }
        "post_call_streaming" => {
            let summary = unwrap_response(result.or(original));
            let final_text = summary
                .and_then(|r| extract_response_text(r).ok())
                .unwrap_or_default();
            let events = vec![event(
                EventType::RequestCompleted,
                sequence,
                json!({
                    "status": "stream_summary",
                    "final_response": final_text,
                    "raw_original": original,
                    "raw_result": result,
                }),
            )];
            indices.clear(call_id);
            events
        }
        "post_call_failure" => {
            let events = vec![event(
                EventType::RequestCompleted,
                sequence,
                json!({
                    "status": "failure",
                    "raw_original": original,
                    "raw_result": result,
                }),
            )];
            indices.clear(call_id);
            events
        }
        _ => Vec::new(),
    }
}

/// Reconstructs conversation events from one stored debug-log entry.
pub fn events_from_debug_entry(
    entry: &DebugLogEntry,
    indices: &StreamIndexStore,
) -> Vec<ConversationEvent> {
    let Some(hook) = entry.debug_type_identifier.strip_prefix("hook_result:") else {
        return Vec::new();
    };
    let payload = &entry.jsonblob;
    let original = payload.get("original");
    let result = payload.get("result").or(original);
    let call_id = extract_call_id(payload);
    let trace_id = extract_trace_id(payload);
    let timestamp_ns = payload
        .get("post_time_ns")
        .and_then(Value::as_i64)
        .unwrap_or_else(|| entry.time_created.timestamp_nanos_opt().unwrap_or(0));
    build_conversation_events(
        hook,
        call_id.as_deref(),
        trace_id.as_deref(),
        original,
        result,
        timestamp_ns,
        entry.time_created,
        indices,
    )
}

/// Flattens and orders events derived from stored debug-log entries.
pub fn events_from_debug_entries(entries: &[DebugLogEntry]) -> Vec<ConversationEvent> {
    let indices = StreamIndexStore::new();
    let mut events: Vec<ConversationEvent> = entries
        .iter()
        .flat_map(|entry| events_from_debug_entry(entry, &indices))
        .collect();
    events.sort_by(|a, b| {
        (a.sequence, a.timestamp, a.event_type).cmp(&(b.sequence, b.timestamp, b.event_type))
    });
    events
}
