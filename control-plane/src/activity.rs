//! Global activity events: one lightweight record per hook result, published
//! on the shared activity channel so dashboards can watch all calls at once.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::conversation::utils::{delta_from_chunk, extract_stream_chunk};

/// Builds the activity record for one hook result.
pub fn build_activity_event(
    hook: &str,
    call_id: Option<&str>,
    trace_id: Option<&str>,
    original: &Value,
    result: Option<&Value>,
    timestamp: DateTime<Utc>,
) -> Value {
    let mut obj = serde_json::Map::new();
    obj.insert("type".into(), Value::from("hook_result"));
    obj.insert("hook".into(), Value::from(hook));
    obj.insert("timestamp".into(), Value::from(timestamp.to_rfc3339()));
    if let Some(call_id) = call_id {
        obj.insert("call_id".into(), Value::from(call_id));
    }
    if let Some(trace_id) = trace_id {
        obj.insert("trace_id".into(), Value::from(trace_id));
    }
    if hook == "post_call_streaming_iterator" {
        let source = result.or(Some(original));
        let delta = delta_from_chunk(extract_stream_chunk(source));
        if !delta.is_empty() {
            obj.insert("delta".into(), Value::from(delta));
        }
    }
    Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chunk_hooks_carry_the_delta() {
        let original = json!({"chunk": {"choices": [{"index": 0, "delta": {"content": "hi"}}]}});
        let event = build_activity_event(
            "post_call_streaming_iterator",
            Some("call-1"),
            None,
            &original,
            None,
            Utc::now(),
        );
        assert_eq!(event["delta"], "hi");
        assert_eq!(event["call_id"], "call-1");
    }

    #[test]
    fn non_chunk_hooks_are_bare() {
        let event = build_activity_event("pre_call", Some("call-1"), Some("t-1"), &json!({}), None, Utc::now());
        assert_eq!(event["hook"], "pre_call");
        assert_eq!(event["trace_id"], "t-1");
        assert!(event.get("delta").is_none());
    }
}
