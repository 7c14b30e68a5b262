//! Canonical chunks → Anthropic Messages SSE events.
//!
//! Stateful assembler that tracks open-block state across chunks. Two rules
//! here are load-bearing and easy to get wrong:
//!
//! 1. **Delayed thinking close.** Upstream delivers thinking signatures after
//!    text has already started. The thinking block therefore stays open when a
//!    text block begins; it closes when its `signature_delta` arrives, or as a
//!    fallback when the message finishes without one.
//! 2. **Single terminal `message_delta`.** A chunk carrying both `tool_calls`
//!    and `finish_reason == "tool_calls"` produces the tool_use lifecycle and
//!    exactly one `message_delta`, never a separate finish event.

use crate::anthropic::{AnthropicEvent, ContentBlock, ContentDelta, MessageDelta, MessageStart};
use crate::chunk::{ChatCompletionChunk, DeltaToolCall, ThinkingBlockDelta};

/// Maps a canonical `finish_reason` back to an Anthropic `stop_reason`.
fn stop_reason_for(finish_reason: &str) -> &'static str {
    match finish_reason {
        "tool_calls" => "tool_use",
        "length" => "max_tokens",
        _ => "end_turn",
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum OpenKind {
    Text,
    Thinking,
    ToolUse,
}

/// Assembles Anthropic SSE events from a canonical chunk stream.
#[derive(Debug, Default)]
pub struct AnthropicSseAssembler {
    sent_message_start: bool,
    next_index: usize,
    current: Option<(usize, OpenKind)>,
    /// Thinking block awaiting its signature before it can close.
    pending_thinking_close: Option<usize>,
    finished: bool,
}

impl AnthropicSseAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the thinking block still awaiting a close, if any.
    pub fn thinking_block_needs_close(&self) -> bool {
        self.pending_thinking_close.is_some()
    }

    /// Converts one chunk into its SSE events, updating block state.
    pub fn process_chunk(&mut self, chunk: &ChatCompletionChunk) -> Vec<AnthropicEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        if !self.sent_message_start {
            self.sent_message_start = true;
            events.push(AnthropicEvent::MessageStart {
                message: MessageStart {
                    id: chunk.id.clone(),
                    model: chunk.model.clone(),
                    role: Some("assistant".to_string()),
                    stop_reason: None,
                    usage: None,
                },
            });
        }
        let Some(choice) = chunk.first_choice() else {
            return events;
        };
        let delta = choice.delta.clone();

        if let Some(reasoning) = delta.reasoning_content.as_deref().filter(|s| !s.is_empty()) {
            self.ensure_block(OpenKind::Thinking, &mut events);
            events.push(AnthropicEvent::ContentBlockDelta {
                index: self.current_index(),
                delta: ContentDelta::ThinkingDelta {
                    thinking: reasoning.to_string(),
                },
            });
        }

        for tb in delta.thinking_blocks.iter().flatten() {
            match tb {
                ThinkingBlockDelta::Thinking { thinking, signature } => {
                    if let Some(text) = thinking.as_deref().filter(|s| !s.is_empty()) {
                        self.ensure_block(OpenKind::Thinking, &mut events);
                        events.push(AnthropicEvent::ContentBlockDelta {
                            index: self.current_index(),
                            delta: ContentDelta::ThinkingDelta {
                                thinking: text.to_string(),
                            },
                        });
                    }
                    if let Some(sig) = signature.as_deref().filter(|s| !s.is_empty()) {
                        self.apply_signature(sig, &mut events);
                    }
                }
                ThinkingBlockDelta::RedactedThinking { data } => {
                    self.close_current(&mut events);
                    let index = self.next_index;
                    self.next_index += 1;
                    events.push(AnthropicEvent::ContentBlockStart {
                        index,
                        content_block: ContentBlock::RedactedThinking { data: data.clone() },
                    });
                    events.push(AnthropicEvent::ContentBlockStop { index });
                }
            }
        }

        if let Some(text) = delta.content.as_deref().filter(|s| !s.is_empty()) {
            self.ensure_block(OpenKind::Text, &mut events);
            events.push(AnthropicEvent::ContentBlockDelta {
                index: self.current_index(),
                delta: ContentDelta::TextDelta {
                    text: text.to_string(),
                },
            });
        }

        for tc in delta.tool_calls.iter().flatten() {
            self.apply_tool_call(tc, &mut events);
        }

        if let Some(finish) = choice.finish_reason.as_deref() {
            self.finish_message(finish, &mut events);
        }
        events
    }

    fn current_index(&self) -> usize {
        self.current.map(|(i, _)| i).unwrap_or(0)
    }

    /// Opens a block of `kind` if it is not already current. A thinking block
    /// interrupted by text is left open awaiting its signature.
    fn ensure_block(&mut self, kind: OpenKind, events: &mut Vec<AnthropicEvent>) {
        if let Some((_, current_kind)) = self.current {
            if current_kind == kind {
                return;
            }
            if current_kind == OpenKind::Thinking && kind == OpenKind::Text {
                // rule 1: delay the close until signature_delta arrives
                self.pending_thinking_close = Some(self.current_index());
                self.current = None;
            } else {
                self.close_current(events);
            }
        }
        let index = self.next_index;
        self.next_index += 1;
        self.current = Some((index, kind));
        let content_block = match kind {
            OpenKind::Text => ContentBlock::Text { text: String::new() },
            OpenKind::Thinking => ContentBlock::Thinking {
                thinking: String::new(),
                signature: None,
            },
            OpenKind::ToolUse => unreachable!("tool_use blocks are opened by apply_tool_call"),
        };
        events.push(AnthropicEvent::ContentBlockStart {
            index,
            content_block,
        });
    }

    fn apply_signature(&mut self, signature: &str, events: &mut Vec<AnthropicEvent>) {
        if let Some(index) = self.pending_thinking_close.take() {
            events.push(AnthropicEvent::ContentBlockDelta {
                index,
                delta: ContentDelta::SignatureDelta {
                    signature: signature.to_string(),
                },
            });
            events.push(AnthropicEvent::ContentBlockStop { index });
            return;
        }
        if let Some((index, OpenKind::Thinking)) = self.current {
            // block still current: the signature stays in it, close waits
            events.push(AnthropicEvent::ContentBlockDelta {
                index,
                delta: ContentDelta::SignatureDelta {
                    signature: signature.to_string(),
                },
            });
        }
    }

    fn apply_tool_call(&mut self, tc: &DeltaToolCall, events: &mut Vec<AnthropicEvent>) {
        let name = tc
            .function
            .as_ref()
            .and_then(|f| f.name.as_deref())
            .unwrap_or_default();
        let arguments = tc
            .function
            .as_ref()
            .and_then(|f| f.arguments.as_deref())
            .unwrap_or_default();

        let starts_new = tc.id.as_deref().is_some_and(|id| !id.is_empty());
        if starts_new {
            self.close_current(events);
            let index = self.next_index;
            self.next_index += 1;
            self.current = Some((index, OpenKind::ToolUse));
            events.push(AnthropicEvent::ContentBlockStart {
                index,
                content_block: ContentBlock::ToolUse {
                    id: tc.id.clone().unwrap_or_default(),
                    name: name.to_string(),
                    input: serde_json::json!({}),
                },
            });
        }
        if !arguments.is_empty() {
            if self.current.map(|(_, k)| k) != Some(OpenKind::ToolUse) {
                return;
            }
            events.push(AnthropicEvent::ContentBlockDelta {
                index: self.current_index(),
                delta: ContentDelta::InputJsonDelta {
                    partial_json: arguments.to_string(),
                },
            });
        }
        // a call that arrived whole (id + parseable arguments) closes at once
        if starts_new
            && !arguments.is_empty()
            && serde_json::from_str::<serde_json::Value>(arguments).is_ok()
        {
            self.close_current(events);
        }
    }

    fn close_current(&mut self, events: &mut Vec<AnthropicEvent>) {
        if let Some((index, _)) = self.current.take() {
            events.push(AnthropicEvent::ContentBlockStop { index });
        }
    }

    fn finish_message(&mut self, finish_reason: &str, events: &mut Vec<AnthropicEvent>) {
        // fallback: signature never arrived
        if let Some(index) = self.pending_thinking_close.take() {
            events.push(AnthropicEvent::ContentBlockStop { index });
        }
        self.close_current(events);
        events.push(AnthropicEvent::MessageDelta {
            delta: MessageDelta {
                stop_reason: Some(stop_reason_for(finish_reason).to_string()),
                stop_sequence: None,
            },
            usage: None,
        });
        events.push(AnthropicEvent::MessageStop);
        self.finished = true;
    }
}

/// Renders one event as an SSE frame: `event: <type>\ndata: <json>\n\n`.
pub fn format_sse_event(event: &AnthropicEvent) -> String {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    format!("event: {}\ndata: {}\n\n", event.event_name(), data)
}
