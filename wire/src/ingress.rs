//! Anthropic SSE → canonical chunk adapter.
//!
//! Feeds on the raw Anthropic event stream and yields OpenAI-style chunks so
//! the rest of the system never sees provider-specific shapes. Thinking text
//! surfaces as `reasoning_content`; signatures and redacted thinking ride in
//! `thinking_blocks`; tool-use blocks become incremental `tool_calls` deltas.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::anthropic::{finish_reason_for, AnthropicEvent, ContentBlock, ContentDelta};
use crate::chunk::{
    ChatCompletionChunk, ChunkChoice, Delta, DeltaFunction, DeltaToolCall, ThinkingBlockDelta,
};
use crate::sse::SseParser;
use crate::WireError;

/// Kind of the Anthropic block currently open at a given index.
#[derive(Debug, Clone, Copy, PartialEq)]
enum BlockKind {
    Text,
    /// Holds the OpenAI-side tool_calls delta index.
    ToolUse(u32),
    Thinking,
}

/// Stateful adapter for one Anthropic stream.
#[derive(Debug)]
pub struct AnthropicIngress {
    parser: SseParser,
    message_id: String,
    model: String,
    created: Option<u64>,
    /// Anthropic block index → kind.
    open_blocks: std::collections::HashMap<usize, BlockKind>,
    next_tool_index: u32,
    sent_role: bool,
    finished: bool,
}

impl Default for AnthropicIngress {
    fn default() -> Self {
        Self::new()
    }
}

impl AnthropicIngress {
    pub fn new() -> Self {
        Self {
            parser: SseParser::new(),
            message_id: String::new(),
            model: String::new(),
            created: None,
            open_blocks: std::collections::HashMap::new(),
            next_tool_index: 0,
            sent_role: false,
            finished: false,
        }
    }

    /// Pins the `created` timestamp (tests); otherwise current time is used.
    pub fn with_created(mut self, created: u64) -> Self {
        self.created = Some(created);
        self
    }

    fn created_secs(&mut self) -> u64 {
        match self.created {
            Some(c) => c,
            None => {
                let secs = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                self.created = Some(secs);
                secs
            }
        }
    }

    fn chunk(&mut self, delta: Delta, finish_reason: Option<String>) -> ChatCompletionChunk {
        let created = self.created_secs();
        let mut delta = delta;
        if !self.sent_role {
            delta.role = Some("assistant".to_string());
            self.sent_role = true;
        }
        ChatCompletionChunk {
            id: self.message_id.clone(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    /// Feeds raw SSE bytes; returns the canonical chunks completed by them.
    pub fn process(&mut self, bytes: &[u8]) -> Result<Vec<ChatCompletionChunk>, WireError> {
        let mut chunks = Vec::new();
        for record in self.parser.feed(bytes) {
            if record.data.is_empty() {
                continue;
            }
            let event: AnthropicEvent = match serde_json::from_str(&record.data) {
                Ok(ev) => ev,
                // unknown / future event types are skipped, not fatal
                Err(_) if !is_known_event(record.event.as_deref()) => continue,
                Err(e) => return Err(WireError::InvalidEvent(e)),
            };
            chunks.extend(self.handle_event(event));
        }
        Ok(chunks)
    }

    /// Translates one typed event into zero or more canonical chunks.
    pub fn handle_event(&mut self, event: AnthropicEvent) -> Vec<ChatCompletionChunk> {
        match event {
            AnthropicEvent::MessageStart { message } => {
                self.message_id = message.id;
                self.model = message.model;
                vec![self.chunk(Delta::default(), None)]
            }
            AnthropicEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ContentBlock::Text { .. } => {
                    self.open_blocks.insert(index, BlockKind::Text);
                    Vec::new()
                }
                ContentBlock::ToolUse { id, name, .. } => {
                    let tool_index = self.next_tool_index;
                    self.next_tool_index += 1;
                    self.open_blocks.insert(index, BlockKind::ToolUse(tool_index));
                    vec![self.chunk(
                        Delta {
                            tool_calls: Some(vec![DeltaToolCall {
                                index: tool_index,
                                id: Some(id),
                                call_type: Some("function".to_string()),
                                function: Some(DeltaFunction {
                                    name: Some(name),
                                    arguments: Some(String::new()),
                                }),
                            }]),
                            ..Delta::default()
                        },
                        None,
                    )]
                }
                ContentBlock::Thinking { .. } => {
                    self.open_blocks.insert(index, BlockKind::Thinking);
                    Vec::new()
                }
                ContentBlock::RedactedThinking { data } => {
                    // no delta phase: the block arrives complete
                    vec![self.chunk(
                        Delta {
                            thinking_blocks: Some(vec![ThinkingBlockDelta::RedactedThinking {
                                data,
                            }]),
                            ..Delta::default()
                        },
                        None,
                    )]
                }
            },
            AnthropicEvent::ContentBlockDelta { index, delta } => match delta {
                ContentDelta::TextDelta { text } => vec![self.chunk(
                    Delta {
                        content: Some(text),
                        ..Delta::default()
                    },
                    None,
                )],
                ContentDelta::InputJsonDelta { partial_json } => {
                    let tool_index = match self.open_blocks.get(&index) {
                        Some(BlockKind::ToolUse(i)) => *i,
                        _ => self.next_tool_index.saturating_sub(1),
                    };
                    vec![self.chunk(
                        Delta {
                            tool_calls: Some(vec![DeltaToolCall {
                                index: tool_index,
                                id: None,
                                call_type: None,
                                function: Some(DeltaFunction {
                                    name: None,
                                    arguments: Some(partial_json),
                                }),
                            }]),
                            ..Delta::default()
                        },
                        None,
                    )]
                }
                ContentDelta::ThinkingDelta { thinking } => vec![self.chunk(
                    Delta {
                        reasoning_content: Some(thinking),
                        ..Delta::default()
                    },
                    None,
                )],
                ContentDelta::SignatureDelta { signature } => vec![self.chunk(
                    Delta {
                        thinking_blocks: Some(vec![ThinkingBlockDelta::Thinking {
                            thinking: None,
                            signature: Some(signature),
                        }]),
                        ..Delta::default()
                    },
                    None,
                )],
            },
            AnthropicEvent::ContentBlockStop { index } => {
                self.open_blocks.remove(&index);
                Vec::new()
            }
            AnthropicEvent::MessageDelta { delta, .. } => {
                let finish = delta
                    .stop_reason
                    .as_deref()
                    .map(finish_reason_for)
                    .unwrap_or("stop");
                self.finished = true;
                vec![self.chunk(Delta::default(), Some(finish.to_string()))]
            }
            AnthropicEvent::MessageStop => Vec::new(),
            AnthropicEvent::Ping | AnthropicEvent::Error { .. } => Vec::new(),
        }
    }

    /// Flushes a terminal chunk if the stream ended without `message_delta`.
    pub fn finalize(&mut self) -> Vec<ChatCompletionChunk> {
        if let Some(record) = self.parser.finish() {
            if let Ok(event) = serde_json::from_str::<AnthropicEvent>(&record.data) {
                let mut chunks = self.handle_event(event);
                if !self.finished {
                    chunks.push(self.chunk(Delta::default(), Some("stop".to_string())));
                    self.finished = true;
                }
                return chunks;
            }
        }
        if self.finished || self.message_id.is_empty() {
            return Vec::new();
        }
        self.finished = true;
        vec![self.chunk(Delta::default(), Some("stop".to_string()))]
    }
}

fn is_known_event(name: Option<&str>) -> bool {
    matches!(
        name,
        Some(
            "message_start"
                | "content_block_start"
                | "content_block_delta"
                | "content_block_stop"
                | "message_delta"
                | "message_stop"
                | "error"
        )
    )
}
