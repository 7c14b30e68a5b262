//! WebSocket frames between the stream orchestrator and the control plane.
//!
//! One bidirectional channel exists per call. The orchestrator speaks
//! [`ClientFrame`]; the control plane answers with [`ServerFrame`]. The
//! protocol is lockstep: every `CHUNK` sent expects exactly one reply.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Orchestrator → control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// Opens the stream with the sanitized request payload.
    #[serde(rename = "START")]
    Start { data: Value },
    /// One upstream chunk, canonical shape.
    #[serde(rename = "CHUNK")]
    Chunk { data: Value },
    /// Upstream exhausted; the stream closed normally.
    #[serde(rename = "END")]
    End,
}

/// Control plane → orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// Replacement chunk to emit in place of the original.
    #[serde(rename = "CHUNK")]
    Chunk { data: Value },
    /// Stop reading upstream and close cleanly.
    #[serde(rename = "END")]
    End,
    /// Policy failure: pass the remainder of the stream through verbatim.
    #[serde(rename = "ERROR")]
    Error { error: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_round_trip_with_uppercase_tags() {
        let start = ClientFrame::Start {
            data: json!({"model": "gpt-4"}),
        };
        let encoded = serde_json::to_string(&start).unwrap();
        assert!(encoded.contains("\"type\":\"START\""));
        assert_eq!(serde_json::from_str::<ClientFrame>(&encoded).unwrap(), start);

        let err = ServerFrame::Error {
            error: "policy exploded".into(),
        };
        let encoded = serde_json::to_string(&err).unwrap();
        assert!(encoded.contains("\"type\":\"ERROR\""));
        assert_eq!(serde_json::from_str::<ServerFrame>(&encoded).unwrap(), err);
    }

    #[test]
    fn end_frame_is_bare() {
        assert_eq!(serde_json::to_string(&ClientFrame::End).unwrap(), r#"{"type":"END"}"#);
    }
}
