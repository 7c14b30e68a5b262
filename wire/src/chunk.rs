//! Canonical streaming chunk: OpenAI Chat Completions chunk shape.
//!
//! Field names match the [OpenAI streaming API](https://platform.openai.com/docs/api-reference/chat-streaming),
//! plus the provider extensions we carry end-to-end (`reasoning_content`,
//! `thinking_blocks`). Anthropic streams are converted into this shape at the
//! ingress seam; OpenAI chunks pass through with a single normalization pass
//! that guarantees `delta` is an object rather than a JSON-encoded string.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::WireError;

/// One canonical streaming chunk (`object: "chat.completion.chunk"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    #[serde(default = "default_object")]
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

fn default_object() -> String {
    "chat.completion.chunk".to_string()
}

/// One choice inside a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: Delta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Incremental delta payload of a choice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<DeltaToolCall>>,
    /// Thinking text as streamed by reasoning models.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    /// Signature / redacted-thinking carriers (Anthropic extension).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_blocks: Option<Vec<ThinkingBlockDelta>>,
}

impl Delta {
    /// True when the delta carries no payload at all (keep-alive shape).
    pub fn is_empty(&self) -> bool {
        self.content.as_deref().map_or(true, str::is_empty)
            && self.tool_calls.as_ref().map_or(true, Vec::is_empty)
            && self.reasoning_content.as_deref().map_or(true, str::is_empty)
            && self.thinking_blocks.as_ref().map_or(true, Vec::is_empty)
    }
}

/// Partial tool call inside a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaToolCall {
    #[serde(default)]
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<DeltaFunction>,
}

/// Function name/argument fragment of a tool call delta.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaFunction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// Thinking-block fragment carried inside a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ThinkingBlockDelta {
    #[serde(rename = "thinking")]
    Thinking {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thinking: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    #[serde(rename = "redacted_thinking")]
    RedactedThinking { data: String },
}

impl ChatCompletionChunk {
    /// Validates a JSON value against the canonical schema.
    ///
    /// Required keys: `choices`, `model`, `created`. A `delta` that arrives as
    /// a JSON-encoded string (some providers double-encode it) is decoded into
    /// an object before typed deserialization; any other malformed shape is an
    /// error.
    pub fn from_value(value: Value) -> Result<Self, WireError> {
        let mut value = value;
        let obj = value
            .as_object_mut()
            .ok_or_else(|| WireError::InvalidChunk("chunk must be a JSON object".into()))?;
        for key in ["choices", "model", "created"] {
            if !obj.contains_key(key) {
                return Err(WireError::InvalidChunk(format!("missing required field: {key}")));
            }
        }
        if let Some(choices) = obj.get_mut("choices").and_then(Value::as_array_mut) {
            for choice in choices.iter_mut() {
                let Some(choice) = choice.as_object_mut() else { continue };
                if let Some(delta) = choice.get_mut("delta") {
                    if let Some(encoded) = delta.as_str() {
                        let decoded: Value = serde_json::from_str(encoded).map_err(|e| {
                            WireError::InvalidChunk(format!("delta is not an object: {e}"))
                        })?;
                        *delta = decoded;
                    }
                }
            }
        }
        serde_json::from_value(value).map_err(|e| WireError::InvalidChunk(e.to_string()))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn first_choice(&self) -> Option<&ChunkChoice> {
        self.choices.first()
    }

    /// Textual content delta of the first choice, if any.
    pub fn delta_text(&self) -> Option<&str> {
        self.first_choice().and_then(|c| c.delta.content.as_deref())
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.first_choice().and_then(|c| c.finish_reason.as_deref())
    }

    pub fn has_tool_calls(&self) -> bool {
        self.first_choice()
            .and_then(|c| c.delta.tool_calls.as_ref())
            .is_some_and(|calls| !calls.is_empty())
    }

    /// Empty-delta chunk with the same identity, used as a keep-alive reply
    /// when a policy withholds output for a chunk.
    pub fn keep_alive_like(&self) -> Self {
        Self {
            id: self.id.clone(),
            object: self.object.clone(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: self.first_choice().map_or(0, |c| c.index),
                delta: Delta::default(),
                finish_reason: None,
            }],
        }
    }
}
