//! Payload spelunking shared by the event builder and the snapshot fold.
//!
//! Hook payloads arrive as loosely-shaped JSON; these helpers pull call ids,
//! trace ids, message lists, deltas, and timestamps out of the places the
//! gateway is known to put them.

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use super::models::{CallStatus, Message};

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("{0}")]
    Malformed(String),
}

fn require_object<'a>(value: &'a Value, context: &str) -> Result<&'a serde_json::Map<String, Value>, PayloadError> {
    value
        .as_object()
        .ok_or_else(|| PayloadError::Malformed(format!("{context} must be an object")))
}

/// Finds a trace identifier at the top level, then under `request_data`, then
/// under `data`.
pub fn extract_trace_id(payload: &Value) -> Option<String> {
    let obj = payload.as_object()?;
    for scope in [Some(obj), nested(obj, "request_data"), nested(obj, "data")] {
        if let Some(scope) = scope {
            if let Some(trace) = scope.get("litellm_trace_id").and_then(Value::as_str) {
                if !trace.is_empty() {
                    return Some(trace.to_string());
                }
            }
        }
    }
    None
}

fn nested<'a>(
    obj: &'a serde_json::Map<String, Value>,
    key: &str,
) -> Option<&'a serde_json::Map<String, Value>> {
    obj.get(key).and_then(Value::as_object)
}

/// Finds the call identifier using the fixed lookup order: top level, then
/// `data`, `request_data`, `litellm_params.metadata`.
pub fn extract_call_id(payload: &Value) -> Option<String> {
    let obj = payload.as_object()?;
    let scopes = [
        Some(obj),
        nested(obj, "data"),
        nested(obj, "request_data"),
        nested(obj, "litellm_params").and_then(|p| nested(p, "metadata")),
    ];
    for scope in scopes.into_iter().flatten() {
        if let Some(id) = scope.get("litellm_call_id").and_then(Value::as_str) {
            if !id.is_empty() {
                return Some(id.to_string());
            }
        }
    }
    None
}

/// Flattens OpenAI-style message content (string or parts array) to text.
pub fn message_content_to_text(content: &Value) -> Result<String, PayloadError> {
    match content {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s.clone()),
        Value::Array(parts) => {
            let mut out = String::new();
            for (i, part) in parts.iter().enumerate() {
                let part = require_object(part, &format!("message content part #{i}"))?;
                match part.get("text").and_then(Value::as_str) {
                    Some(text) => out.push_str(text),
                    None => {
                        return Err(PayloadError::Malformed(format!(
                            "message content part #{i} missing text"
                        )))
                    }
                }
            }
            Ok(out)
        }
        Value::Object(obj) => {
            if let Some(text) = obj.get("text") {
                return message_content_to_text(text);
            }
            if let Some(inner) = obj.get("content") {
                return message_content_to_text(inner);
            }
            Err(PayloadError::Malformed("unexpected message content object".into()))
        }
        other => Err(PayloadError::Malformed(format!(
            "unexpected message content type: {other}"
        ))),
    }
}

/// Extracts `{role, content}` messages from a hook payload (under `data` or
/// `request_data`).
pub fn messages_from_payload(payload: &Value) -> Result<Vec<Message>, PayloadError> {
    let obj = require_object(payload, "messages payload")?;
    let container = obj
        .get("data")
        .or_else(|| obj.get("request_data"))
        .ok_or_else(|| {
            PayloadError::Malformed("messages payload missing 'data' or 'request_data'".into())
        })?;
    let request = require_object(container, "payload request data")?;
    let messages = request
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| PayloadError::Malformed("payload messages must be a list".into()))?;
    let mut out = Vec::with_capacity(messages.len());
    for (i, msg) in messages.iter().enumerate() {
        let msg = require_object(msg, &format!("message entry #{i}"))?;
        let role = msg
            .get("role")
            .and_then(Value::as_str)
            .ok_or_else(|| PayloadError::Malformed(format!("message #{i} missing role")))?;
        let content = message_content_to_text(msg.get("content").unwrap_or(&Value::Null))?;
        out.push(Message::new(role, content));
    }
    Ok(out)
}

fn format_call(label: &str, name: Option<&str>, arguments: Option<&Value>) -> String {
    let prefix = match name {
        Some(n) if !n.is_empty() => format!("[{label} {n}] "),
        _ => format!("[{label}] "),
    };
    let args = match arguments {
        Some(Value::String(s)) => s.clone(),
        Some(other) => serde_json::to_string(other).unwrap_or_default(),
        None => String::new(),
    };
    if args.is_empty() {
        prefix.trim_end().to_string()
    } else {
        format!("{prefix}{args}")
    }
}

/// Renders a list of tool calls as newline-separated text.
pub fn format_tool_calls_summary(tool_calls: &[Value]) -> String {
    let mut lines = Vec::new();
    for call in tool_calls {
        let Some(call) = call.as_object() else { continue };
        let summary = match call.get("function").and_then(Value::as_object) {
            Some(function) => format_call(
                "tool",
                function.get("name").and_then(Value::as_str),
                function.get("arguments"),
            ),
            None => format_call(
                "tool",
                call.get("name").and_then(Value::as_str),
                call.get("arguments"),
            ),
        };
        if summary.is_empty() {
            continue;
        }
        match call.get("id").and_then(Value::as_str).filter(|s| !s.is_empty()) {
            Some(id) => lines.push(format!("{summary} (id: {id})")),
            None => lines.push(summary),
        }
    }
    lines.join("\n")
}

/// Pulls the human-readable delta out of a chunk-shaped payload: content text
/// first, then a tool-call summary.
pub fn delta_from_chunk(chunk: Option<&Value>) -> String {
    let Some(chunk) = chunk else {
        return String::new();
    };
    if let Some(text) = chunk.as_str() {
        return text.to_string();
    }
    let Some(choice) = chunk
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
    else {
        return String::new();
    };
    let Some(delta) = choice.get("delta") else {
        return String::new();
    };
    if let Some(content) = delta.get("content").and_then(Value::as_str) {
        if !content.is_empty() {
            return content.to_string();
        }
    }
    if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
        return format_tool_calls_summary(tool_calls);
    }
    String::new()
}

/// First choice index of a chunk.
pub fn extract_choice_index(chunk: &Value) -> Result<u32, PayloadError> {
    chunk
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.get("index"))
        .and_then(Value::as_u64)
        .map(|i| i as u32)
        .ok_or_else(|| PayloadError::Malformed("stream chunk missing choice index".into()))
}

/// Peels envelope wrappers to reach the chunk payload.
pub fn extract_stream_chunk(payload: Option<&Value>) -> Option<&Value> {
    let payload = payload?;
    let obj = payload.as_object()?;
    for key in ["response", "chunk", "response_obj", "raw_response"] {
        if let Some(inner) = obj.get(key) {
            return Some(inner);
        }
    }
    Some(payload)
}

/// Returns the response object nested within a hook payload.
pub fn unwrap_response(payload: Option<&Value>) -> Option<&Value> {
    let payload = payload?;
    let obj = payload.as_object()?;
    for key in ["response", "response_obj", "raw_response"] {
        if let Some(inner) = obj.get(key) {
            return Some(inner);
        }
    }
    Some(payload)
}

/// Converts an LLM response payload (message or delta shaped) to plain text.
pub fn extract_response_text(response: &Value) -> Result<String, PayloadError> {
    let obj = require_object(response, "response payload")?;
    if let Some(choices) = obj.get("choices") {
        let Some(choice) = choices.as_array().and_then(|c| c.first()) else {
            return Ok(String::new());
        };
        for key in ["message", "delta"] {
            let Some(body) = choice.get(key).and_then(Value::as_object) else {
                continue;
            };
            if let Some(content) = body.get("content") {
                if !content.is_null() {
                    if let Ok(text) = message_content_to_text(content) {
                        if !text.is_empty() || key == "delta" {
                            return Ok(text);
                        }
                    }
                }
            }
            if let Some(tool_calls) = body.get("tool_calls").and_then(Value::as_array) {
                let summary = format_tool_calls_summary(tool_calls);
                if !summary.is_empty() {
                    return Ok(summary);
                }
            }
        }
        return Ok(String::new());
    }
    if let Some(content) = obj.get("content") {
        if let Some(text) = content.as_str() {
            return Ok(text.to_string());
        }
        // Anthropic Messages shape: content is an array of typed parts
        if let Ok(text) = message_content_to_text(content) {
            return Ok(text);
        }
    }
    Err(PayloadError::Malformed("unrecognized response payload structure".into()))
}

/// Searches arbitrarily nested data for a `post_time_ns` integer.
pub fn extract_post_time_ns_from_any(value: &Value) -> Option<i64> {
    match value {
        Value::Object(obj) => {
            if let Some(ns) = obj.get("post_time_ns").and_then(Value::as_i64) {
                return Some(ns);
            }
            for key in [
                "payload",
                "data",
                "request_data",
                "response",
                "response_obj",
                "raw_response",
                "chunk",
            ] {
                if let Some(nested) = obj.get(key).and_then(extract_post_time_ns_from_any) {
                    return Some(nested);
                }
            }
            obj.values()
                .filter(|v| v.is_object() || v.is_array())
                .find_map(extract_post_time_ns_from_any)
        }
        Value::Array(items) => items.iter().find_map(extract_post_time_ns_from_any),
        _ => None,
    }
}

/// Picks the first available `post_time_ns`, falling back to `fallback_ns`.
pub fn derive_sequence_ns(fallback_ns: i64, candidates: &[Option<&Value>]) -> i64 {
    candidates
        .iter()
        .flatten()
        .find_map(|v| extract_post_time_ns_from_any(v))
        .unwrap_or(fallback_ns)
}

/// Convenience over [`derive_sequence_ns`] for the common two-candidate case.
pub fn derive_sequence_ns2(
    fallback_ns: i64,
    original: Option<&Value>,
    result: Option<&Value>,
) -> i64 {
    derive_sequence_ns(fallback_ns, &[original, result])
}

/// Removes `post_time_ns` keys from nested structures.
pub fn strip_post_time_ns(value: &Value) -> Value {
    match value {
        Value::Object(obj) => Value::Object(
            obj.iter()
                .filter(|(k, _)| k.as_str() != "post_time_ns")
                .map(|(k, v)| (k.clone(), strip_post_time_ns(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(strip_post_time_ns).collect()),
        other => other.clone(),
    }
}

/// Role comparison is trimmed and case-insensitive; content is exact, so a
/// whitespace-only change makes a message "new".
pub fn message_equals(a: &Message, b: &Message) -> bool {
    a.role.trim().eq_ignore_ascii_case(b.role.trim()) && a.content == b.content
}

/// Maps a stored status string to the canonical status.
pub fn normalize_status(
    status: &str,
    chunk_count: usize,
    completed_at: Option<DateTime<Utc>>,
) -> CallStatus {
    match status {
        "success" => CallStatus::Success,
        "stream_summary" => CallStatus::StreamSummary,
        "failure" => CallStatus::Failure,
        "streaming" => CallStatus::Streaming,
        _ => {
            if completed_at.is_some() {
                CallStatus::Success
            } else if chunk_count > 0 {
                CallStatus::Streaming
            } else {
                CallStatus::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_id_lookup_order() {
        let payload = json!({
            "data": {"litellm_call_id": "from-data"},
            "litellm_call_id": "top-level",
        });
        assert_eq!(extract_call_id(&payload).as_deref(), Some("top-level"));

        let payload = json!({
            "litellm_params": {"metadata": {"litellm_call_id": "from-metadata"}},
        });
        assert_eq!(extract_call_id(&payload).as_deref(), Some("from-metadata"));
    }

    #[test]
    fn trace_id_found_in_request_data() {
        let payload = json!({"request_data": {"litellm_trace_id": "trace-9"}});
        assert_eq!(extract_trace_id(&payload).as_deref(), Some("trace-9"));
    }

    #[test]
    fn messages_flatten_content_parts() {
        let payload = json!({
            "data": {"messages": [
                {"role": "user", "content": [{"type": "text", "text": "Hel"}, {"type": "text", "text": "lo"}]},
            ]},
        });
        let messages = messages_from_payload(&payload).unwrap();
        assert_eq!(messages, vec![Message::new("user", "Hello")]);
    }

    #[test]
    fn delta_prefers_content_over_tool_calls() {
        let chunk = json!({"choices": [{"index": 0, "delta": {"content": "hi"}}]});
        assert_eq!(delta_from_chunk(Some(&chunk)), "hi");

        let chunk = json!({"choices": [{"index": 0, "delta": {"tool_calls": [
            {"id": "call_1", "function": {"name": "lookup", "arguments": "{\"q\":1}"}},
        ]}}]});
        assert_eq!(delta_from_chunk(Some(&chunk)), "[tool lookup] {\"q\":1} (id: call_1)");
    }

    #[test]
    fn response_text_from_message_and_delta() {
        let response = json!({"choices": [{"message": {"content": "hi"}}]});
        assert_eq!(extract_response_text(&response).unwrap(), "hi");

        let response = json!({"choices": [{"delta": {"content": "partial"}}]});
        assert_eq!(extract_response_text(&response).unwrap(), "partial");

        let response = json!({"content": [{"type": "text", "text": "anthropic"}]});
        assert_eq!(extract_response_text(&response).unwrap(), "anthropic");
    }

    #[test]
    fn post_time_ns_found_nested() {
        let value = json!({"payload": {"response": {"post_time_ns": 42}}});
        assert_eq!(extract_post_time_ns_from_any(&value), Some(42));
        assert_eq!(derive_sequence_ns(7, &[Some(&json!({})), Some(&value)]), 42);
        assert_eq!(derive_sequence_ns(7, &[None, Some(&json!({}))]), 7);
    }

    #[test]
    fn strip_post_time_ns_is_deep() {
        let value = json!({"post_time_ns": 1, "data": {"post_time_ns": 2, "keep": true}});
        let stripped = strip_post_time_ns(&value);
        assert_eq!(stripped, json!({"data": {"keep": true}}));
    }

    #[test]
    fn message_equality_is_whitespace_sensitive_in_content() {
        let a = Message::new("User", "hi");
        let b = Message::new(" user ", "hi");
        assert!(message_equals(&a, &b));
        let c = Message::new("user", "hi ");
        assert!(!message_equals(&a, &c));
    }

    #[test]
    fn status_normalization() {
        assert_eq!(normalize_status("failure", 0, None), CallStatus::Failure);
        assert_eq!(normalize_status("", 3, None), CallStatus::Streaming);
        assert_eq!(normalize_status("", 0, Some(Utc::now())), CallStatus::Success);
        assert_eq!(normalize_status("", 0, None), CallStatus::Pending);
    }
}
