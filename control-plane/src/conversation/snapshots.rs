//! Call snapshot assembly: fold ordered events into per-call views.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::models::{
    ConversationCallSnapshot, ConversationEvent, ConversationMessageDiff, EventType, Message,
};
use super::utils::{message_equals, normalize_status};

fn messages_from_value(value: Option<&Value>) -> Vec<Message> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let obj = item.as_object()?;
                    Some(Message::new(
                        obj.get("role").and_then(Value::as_str).unwrap_or("unknown"),
                        obj.get("content").and_then(Value::as_str).unwrap_or(""),
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn place_chunk(chunks: &mut Vec<String>, payload: &Value) {
    let delta = payload
        .get("delta")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    match payload.get("chunk_index").and_then(Value::as_u64) {
        Some(index) => {
            let index = index as usize;
            while chunks.len() <= index {
                chunks.push(String::new());
            }
            chunks[index] = delta;
        }
        None if !delta.is_empty() => chunks.push(delta),
        None => {}
    }
}

/// Aggregates per-call snapshots from a sequence of conversation events.
///
/// The baseline for `new_messages` is the previous call's final messages plus
/// its assistant reply; a message is "new" when it differs from the baseline
/// at the same position.
pub fn build_call_snapshots(events: &[ConversationEvent]) -> Vec<ConversationCallSnapshot> {
    let mut ordered: Vec<&ConversationEvent> = events.iter().collect();
    ordered.sort_by(|a, b| {
        (a.sequence, a.timestamp, a.event_type).cmp(&(b.sequence, b.timestamp, b.event_type))
    });

    let mut call_order: Vec<&str> = Vec::new();
    let mut events_by_call: std::collections::HashMap<&str, Vec<&ConversationEvent>> =
        std::collections::HashMap::new();
    for event in ordered {
        let bucket = events_by_call.entry(event.call_id.as_str()).or_default();
        if bucket.is_empty() {
            call_order.push(event.call_id.as_str());
        }
        bucket.push(event);
    }

    let mut snapshots = Vec::new();
    let mut conversation_context: Vec<Message> = Vec::new();

    for call_id in call_order {
        let call_events = &events_by_call[call_id];
        let trace_id = call_events.iter().find_map(|e| e.trace_id.clone());
        let mut request_original: Vec<Message> = Vec::new();
        let mut request_final: Vec<Message> = Vec::new();
        let mut original_chunks: Vec<String> = Vec::new();
        let mut final_chunks: Vec<String> = Vec::new();
        let mut started_at: Option<DateTime<Utc>> = None;
        let mut completed_at: Option<DateTime<Utc>> = None;
        let mut status = String::new();

        for event in call_events {
            if started_at.map_or(true, |s| event.timestamp < s) {
                started_at = Some(event.timestamp);
            }
            match event.event_type {
                EventType::RequestStarted => {
                    request_original = messages_from_value(event.payload.get("original_messages"));
                    let finals = messages_from_value(event.payload.get("final_messages"));
                    request_final = if finals.is_empty() {
                        request_original.clone()
                    } else {
                        finals
                    };
                    original_chunks.clear();
                    final_chunks.clear();
                }
                EventType::OriginalChunk => place_chunk(&mut original_chunks, &event.payload),
                EventType::FinalChunk => place_chunk(&mut final_chunks, &event.payload),
                EventType::RequestCompleted => {
                    status = event
                        .payload
                        .get("status")
                        .and_then(Value::as_str)
                        .unwrap_or("success")
                        .to_string();
                    // full texts are strictly later truth than folded chunks
                    let original_text = event
                        .payload
                        .get("original_response")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    let final_text = event
                        .payload
                        .get("final_response")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    if !original_text.is_empty() {
                        original_chunks = vec![original_text.to_string()];
                    }
                    if !final_text.is_empty() {
                        final_chunks = vec![final_text.to_string()];
                    }
                    completed_at = Some(event.timestamp);
                    if request_original.is_empty() && request_final.is_empty() {
                        let fallback =
                            messages_from_value(event.payload.get("request_messages"));
                        if !fallback.is_empty() {
                            request_original = fallback.clone();
                            request_final = fallback;
                        }
                    }
                }
            }
        }

        let original_response: String = original_chunks.concat();
        let mut final_response: String = final_chunks.concat();
        if final_response.is_empty() {
            final_response = original_response.clone();
        }
        if original_chunks.is_empty() && !original_response.is_empty() {
            original_chunks = vec![original_response.clone()];
        }
        if final_chunks.is_empty() && !final_response.is_empty() {
            final_chunks = vec![final_response.clone()];
        }
        let chunk_count = final_chunks.len();
        let status = normalize_status(&status, chunk_count, completed_at);

        let effective_final = if request_final.is_empty() {
            request_original.clone()
        } else {
            request_final.clone()
        };
        let baseline = &conversation_context;
        let max_len = request_original
            .len()
            .max(effective_final.len())
            .max(baseline.len());
        let mut new_messages = Vec::new();
        for idx in 0..max_len {
            let original_msg = request_original.get(idx);
            let final_msg = effective_final.get(idx);
            let baseline_msg = baseline.get(idx);

            let role = final_msg
                .or(original_msg)
                .or(baseline_msg)
                .map_or("unknown", |m| m.role.as_str());
            let original_text = original_msg.map_or("", |m| m.content.as_str());
            let final_text = final_msg.map_or(original_text, |m| m.content.as_str());

            if let (Some(baseline_msg), Some(final_msg)) = (baseline_msg, final_msg) {
                if message_equals(final_msg, baseline_msg)
                    && original_msg.map_or(true, |m| message_equals(m, baseline_msg))
                {
                    continue;
                }
            }
            if original_text.is_empty() && final_text.is_empty() {
                continue;
            }
            new_messages.push(ConversationMessageDiff {
                role: role.to_string(),
                original: original_text.to_string(),
                final_text: final_text.to_string(),
            });
        }

        snapshots.push(ConversationCallSnapshot {
            call_id: call_id.to_string(),
            trace_id,
            started_at,
            completed_at,
            status,
            new_messages,
            request_original_messages: request_original.clone(),
            request_final_messages: effective_final.clone(),
            original_response: original_response.clone(),
            final_response: final_response.clone(),
            chunk_count,
            original_chunks,
            final_chunks,
        });

        let mut next_context = effective_final;
        if !final_response.is_empty() {
            next_context.push(Message::new("assistant", final_response));
        } else if !original_response.is_empty() {
            next_context.push(Message::new("assistant", original_response));
        }
        conversation_context = next_context;
    }

    snapshots
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn event(
        call_id: &str,
        event_type: EventType,
        sequence: i64,
        payload: Value,
    ) -> ConversationEvent {
        ConversationEvent {
            call_id: call_id.into(),
            trace_id: None,
            event_type,
            sequence,
            timestamp: ts(sequence),
            hook: "test".into(),
            payload,
        }
    }

    #[test]
    fn folds_chunks_into_responses() {
        let events = vec![
            event(
                "call-1",
                EventType::RequestStarted,
                1,
                json!({
                    "original_messages": [{"role": "user", "content": "hi"}],
                    "final_messages": [{"role": "user", "content": "hi"}],
                }),
            ),
            event(
                "call-1",
                EventType::OriginalChunk,
                2,
                json!({"chunk_index": 0, "delta": "ab"}),
            ),
            event(
                "call-1",
                EventType::FinalChunk,
                3,
                json!({"chunk_index": 0, "delta": "AB"}),
            ),
            event(
                "call-1",
                EventType::OriginalChunk,
                4,
                json!({"chunk_index": 1, "delta": "cd"}),
            ),
            event(
                "call-1",
                EventType::FinalChunk,
                5,
                json!({"chunk_index": 1, "delta": "CD"}),
            ),
        ];
        let snapshots = build_call_snapshots(&events);
        assert_eq!(snapshots.len(), 1);
        let snap = &snapshots[0];
        assert_eq!(snap.original_response, "abcd");
        assert_eq!(snap.final_response, "ABCD");
        assert_eq!(snap.status, crate::conversation::models::CallStatus::Streaming);
        assert_eq!(snap.chunk_count, 2);
    }

    #[test]
    fn completed_full_text_overrides_folded_chunks() {
        let events = vec![
            event(
                "call-1",
                EventType::OriginalChunk,
                1,
                json!({"chunk_index": 0, "delta": "partial"}),
            ),
            event(
                "call-1",
                EventType::RequestCompleted,
                2,
                json!({
                    "status": "success",
                    "original_response": "the whole thing",
                    "final_response": "the whole thing",
                }),
            ),
        ];
        let snapshots = build_call_snapshots(&events);
        assert_eq!(snapshots[0].original_response, "the whole thing");
        assert_eq!(snapshots[0].status, crate::conversation::models::CallStatus::Success);
    }

    #[test]
    fn new_messages_diff_against_previous_call() {
        let events = vec![
            event(
                "call-1",
                EventType::RequestStarted,
                1,
                json!({
                    "original_messages": [{"role": "user", "content": "first"}],
                    "final_messages": [{"role": "user", "content": "first"}],
                }),
            ),
            event(
                "call-1",
                EventType::RequestCompleted,
                2,
                json!({"status": "success", "final_response": "reply one"}),
            ),
            event(
                "call-2",
                EventType::RequestStarted,
                3,
                json!({
                    "original_messages": [
                        {"role": "user", "content": "first"},
                        {"role": "assistant", "content": "reply one"},
                        {"role": "user", "content": "second"},
                    ],
                    "final_messages": [
                        {"role": "user", "content": "first"},
                        {"role": "assistant", "content": "reply one"},
                        {"role": "user", "content": "second"},
                    ],
                }),
            ),
        ];
        let snapshots = build_call_snapshots(&events);
        assert_eq!(snapshots.len(), 2);
        let second = &snapshots[1];
        assert_eq!(second.new_messages.len(), 1);
        assert_eq!(second.new_messages[0].final_text, "second");
    }

    #[test]
    fn whitespace_difference_counts_as_new_message() {
        let events = vec![
            event(
                "call-1",
                EventType::RequestStarted,
                1,
                json!({
                    "original_messages": [{"role": "user", "content": "hello"}],
                    "final_messages": [{"role": "user", "content": "hello"}],
                }),
            ),
            event(
                "call-1",
                EventType::RequestCompleted,
                2,
                json!({"status": "success", "final_response": "ok"}),
            ),
            event(
                "call-2",
                EventType::RequestStarted,
                3,
                json!({
                    "original_messages": [
                        {"role": "user", "content": "hello "},
                        {"role": "assistant", "content": "ok"},
                    ],
                    "final_messages": [
                        {"role": "user", "content": "hello "},
                        {"role": "assistant", "content": "ok"},
                    ],
                }),
            ),
        ];
        let snapshots = build_call_snapshots(&events);
        let second = &snapshots[1];
        assert!(second
            .new_messages
            .iter()
            .any(|d| d.final_text == "hello "));
    }

    #[test]
    fn pending_without_chunks_or_completion() {
        let events = vec![event(
            "call-1",
            EventType::RequestStarted,
            1,
            json!({"original_messages": [], "final_messages": []}),
        )];
        let snapshots = build_call_snapshots(&events);
        assert_eq!(snapshots[0].status, crate::conversation::models::CallStatus::Pending);
    }
}
