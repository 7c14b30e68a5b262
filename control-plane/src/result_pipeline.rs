//! Post-policy workflow shared by the HTTP hook endpoint and the stream
//! dispatcher: debug-log the result, persist conversation events, publish to
//! the per-call / per-trace / activity channels. Everything runs through the
//! sequential queues; the hot path only enqueues.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};

use crate::activity::build_activity_event;
use crate::app::AppState;
use crate::bus::{activity_channel, conversation_channel, conversation_trace_channel};
use crate::conversation::build_conversation_events;

fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

/// Logs, persists, and publishes one hook result.
///
/// `result` carries the policy's replacement; `None` means the payload was
/// returned unchanged (chunk hooks then record no `final_chunk`).
pub fn log_and_publish_hook_result(
    state: &Arc<AppState>,
    hook: &str,
    call_id: Option<&str>,
    trace_id: Option<&str>,
    original: Value,
    result: Option<Value>,
) {
    let timestamp_ns = now_ns();
    let timestamp = Utc::now();

    let mut result_record = json!({
        "hook": hook,
        "original": &original,
        "result": &result,
        "post_time_ns": timestamp_ns,
    });
    if let Some(obj) = result_record.as_object_mut() {
        if let Some(call_id) = call_id {
            obj.insert("litellm_call_id".into(), Value::from(call_id));
        }
        if let Some(trace_id) = trace_id {
            obj.insert("litellm_trace_id".into(), Value::from(trace_id));
        }
    }
    let debug_store = state.debug_logs.clone();
    let debug_type = format!("hook_result:{hook}");
    state
        .debug_queue
        .submit(async move { debug_store.append(&debug_type, result_record).await });

    let activity = build_activity_event(hook, call_id, trace_id, &original, result.as_ref(), timestamp);
    let bus = state.bus.clone();
    state.event_queue.submit(async move {
        bus.publish(&activity_channel(), activity.to_string()).await
    });

    let Some(call_id) = call_id.filter(|id| !id.is_empty()) else {
        return;
    };
    let events = build_conversation_events(
        hook,
        Some(call_id),
        trace_id,
        Some(&original),
        result.as_ref(),
        timestamp_ns,
        timestamp,
        &state.stream_indices,
    );
    if events.is_empty() {
        return;
    }

    let store = state.conversations.clone();
    let to_store = events.clone();
    state
        .event_queue
        .submit(async move { store.record_events(to_store).await });

    for event in events {
        let bus = state.bus.clone();
        state.event_queue.submit(async move {
            let payload = serde_json::to_string(&event)
                .map_err(|e| format!("serialize conversation event: {e}"))?;
            bus.publish(&conversation_channel(&event.call_id), payload.clone())
                .await?;
            if let Some(trace_id) = &event.trace_id {
                bus.publish(&conversation_trace_channel(trace_id), payload)
                    .await?;
            }
            Ok(())
        });
    }
}
