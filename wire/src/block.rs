//! Stream blocks: semantically complete fragments of a streaming response.
//!
//! Policies operate on blocks (whole content runs, whole tool calls, whole
//! thinking blocks) instead of raw token deltas. [`BlockAssembler`] folds
//! canonical chunks into blocks and reports what changed per chunk as
//! [`BlockEvent`]s.

use serde::{Deserialize, Serialize};

use crate::chunk::{ChatCompletionChunk, ThinkingBlockDelta};

/// A semantically complete fragment accumulated from stream chunks.
///
/// `complete` latches: once a block is marked complete it never reopens. The
/// block `index` is monotonically increasing within one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamBlock {
    Content {
        id: String,
        index: usize,
        text: String,
        complete: bool,
    },
    ToolCall {
        id: String,
        index: usize,
        name: String,
        arguments_json: String,
        complete: bool,
    },
    Thinking {
        id: String,
        index: usize,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
        complete: bool,
    },
    RedactedThinking {
        id: String,
        index: usize,
        data: String,
    },
}

impl StreamBlock {
    pub fn index(&self) -> usize {
        match self {
            StreamBlock::Content { index, .. }
            | StreamBlock::ToolCall { index, .. }
            | StreamBlock::Thinking { index, .. }
            | StreamBlock::RedactedThinking { index, .. } => *index,
        }
    }

    pub fn is_complete(&self) -> bool {
        match self {
            StreamBlock::Content { complete, .. } | StreamBlock::Thinking { complete, .. } => {
                *complete
            }
            StreamBlock::ToolCall { complete, .. } => *complete,
            StreamBlock::RedactedThinking { .. } => true,
        }
    }

    /// Completeness rule for tool calls: non-empty id and name, and arguments
    /// that parse as JSON.
    pub fn tool_call_parses(id: &str, name: &str, arguments_json: &str) -> bool {
        !id.is_empty()
            && !name.is_empty()
            && serde_json::from_str::<serde_json::Value>(arguments_json).is_ok()
    }

    fn rank(&self) -> u8 {
        match self {
            StreamBlock::Thinking { .. } | StreamBlock::RedactedThinking { .. } => 0,
            StreamBlock::Content { .. } => 1,
            StreamBlock::ToolCall { .. } => 2,
        }
    }
}

/// Reorders assembled blocks for a final response: thinking blocks first, then
/// text, then tool calls, preserving relative order within each kind.
pub fn sort_blocks_for_response(blocks: &mut Vec<StreamBlock>) {
    blocks.sort_by_key(|b| (b.rank(), b.index()));
}

/// What changed in the block model after feeding one chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockEvent {
    ContentDelta { index: usize, delta: String },
    ThinkingDelta { index: usize, delta: String },
    ToolCallDelta { index: usize, delta: String },
    ContentComplete(StreamBlock),
    ThinkingComplete(StreamBlock),
    ToolCallComplete(StreamBlock),
    RedactedThinking(StreamBlock),
}

/// Folds canonical chunks into [`StreamBlock`]s.
#[derive(Debug, Default)]
pub struct BlockAssembler {
    blocks: Vec<StreamBlock>,
    open_content: Option<usize>,
    open_thinking: Option<usize>,
    /// delta tool-call index → block slot.
    tool_slots: std::collections::HashMap<u32, usize>,
    next_block_id: usize,
}

impl BlockAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocks(&self) -> &[StreamBlock] {
        &self.blocks
    }

    /// Tool-call blocks that never reached completeness (id + name + valid
    /// JSON arguments). Non-empty after the stream ends means fail-closed.
    pub fn incomplete_tool_calls(&self) -> Vec<&StreamBlock> {
        self.blocks
            .iter()
            .filter(|b| matches!(b, StreamBlock::ToolCall { complete: false, .. }))
            .collect()
    }

    fn synth_id(&mut self, prefix: &str) -> String {
        self.next_block_id += 1;
        format!("{prefix}_{}", self.next_block_id)
    }

    /// Feeds one chunk; returns the block events it produced, in order.
    pub fn feed(&mut self, chunk: &ChatCompletionChunk) -> Vec<BlockEvent> {
        let mut events = Vec::new();
        let Some(choice) = chunk.first_choice() else {
            return events;
        };
        let delta = choice.delta.clone();

        if let Some(reasoning) = delta.reasoning_content.as_deref().filter(|s| !s.is_empty()) {
            let idx = self.ensure_thinking(&mut events);
            if let StreamBlock::Thinking { text, .. } = &mut self.blocks[idx] {
                text.push_str(reasoning);
            }
            events.push(BlockEvent::ThinkingDelta {
                index: idx,
                delta: reasoning.to_string(),
            });
        }

        for tb in delta.thinking_blocks.iter().flatten() {
            match tb {
                ThinkingBlockDelta::Thinking { thinking, signature } => {
                    if let Some(text_delta) = thinking.as_deref().filter(|s| !s.is_empty()) {
                        let idx = self.ensure_thinking(&mut events);
                        if let StreamBlock::Thinking { text, .. } = &mut self.blocks[idx] {
                            text.push_str(text_delta);
                        }
                        events.push(BlockEvent::ThinkingDelta {
                            index: idx,
                            delta: text_delta.to_string(),
                        });
                    }
                    if let Some(sig) = signature.as_deref().filter(|s| !s.is_empty()) {
                        if let Some(idx) = self.open_thinking.take() {
                            if let StreamBlock::Thinking {
                                signature, complete, ..
                            } = &mut self.blocks[idx]
                            {
                                *signature = Some(sig.to_string());
                                *complete = true;
                            }
                            events.push(BlockEvent::ThinkingComplete(self.blocks[idx].clone()));
                        }
                    }
                }
                ThinkingBlockDelta::RedactedThinking { data } => {
                    self.close_thinking(&mut events);
                    let index = self.blocks.len();
                    let id = self.synth_id("redacted");
                    let block = StreamBlock::RedactedThinking {
                        id,
                        index,
                        data: data.clone(),
                    };
                    self.blocks.push(block.clone());
                    events.push(BlockEvent::RedactedThinking(block));
                }
            }
        }

        if let Some(text_delta) = delta.content.as_deref().filter(|s| !s.is_empty()) {
            let idx = match self.open_content {
                Some(idx) => idx,
                None => {
                    let index = self.blocks.len();
                    let id = self.synth_id("content");
                    self.blocks.push(StreamBlock::Content {
                        id,
                        index,
                        text: String::new(),
                        complete: false,
                    });
                    self.open_content = Some(index);
                    index
                }
            };
            if let StreamBlock::Content { text, .. } = &mut self.blocks[idx] {
                text.push_str(text_delta);
            }
            events.push(BlockEvent::ContentDelta {
                index: idx,
                delta: text_delta.to_string(),
            });
        }

        for tc in delta.tool_calls.iter().flatten() {
            let slot = match self.tool_slots.get(&tc.index) {
                Some(&slot) => slot,
                None => {
                    let index = self.blocks.len();
                    self.blocks.push(StreamBlock::ToolCall {
                        id: String::new(),
                        index,
                        name: String::new(),
                        arguments_json: String::new(),
                        complete: false,
                    });
                    self.tool_slots.insert(tc.index, index);
                    index
                }
            };
            let mut arg_delta = String::new();
            if let StreamBlock::ToolCall {
                id,
                name,
                arguments_json,
                ..
            } = &mut self.blocks[slot]
            {
                if let Some(tc_id) = tc.id.as_deref().filter(|s| !s.is_empty()) {
                    *id = tc_id.to_string();
                }
                if let Some(func) = &tc.function {
                    if let Some(fname) = func.name.as_deref().filter(|s| !s.is_empty()) {
                        *name = fname.to_string();
                    }
                    if let Some(args) = func.arguments.as_deref() {
                        arguments_json.push_str(args);
                        arg_delta = args.to_string();
                    }
                }
            }
            events.push(BlockEvent::ToolCallDelta {
                index: slot,
                delta: arg_delta,
            });
        }

        if choice.finish_reason.is_some() {
            self.close_all(&mut events);
        }
        events
    }

    /// Closes any still-open blocks at end of stream (no finish_reason seen).
    pub fn finish(&mut self) -> Vec<BlockEvent> {
        let mut events = Vec::new();
        self.close_all(&mut events);
        events
    }

    fn ensure_thinking(&mut self, _events: &mut [BlockEvent]) -> usize {
        match self.open_thinking {
            Some(idx) => idx,
            None => {
                let index = self.blocks.len();
                let id = self.synth_id("thinking");
                self.blocks.push(StreamBlock::Thinking {
                    id,
                    index,
                    text: String::new(),
                    signature: None,
                    complete: false,
                });
                self.open_thinking = Some(index);
                index
            }
        }
    }

    fn close_thinking(&mut self, events: &mut Vec<BlockEvent>) {
        if let Some(idx) = self.open_thinking.take() {
            if let StreamBlock::Thinking { complete, .. } = &mut self.blocks[idx] {
                *complete = true;
            }
            events.push(BlockEvent::ThinkingComplete(self.blocks[idx].clone()));
        }
    }

    fn close_content(&mut self, events: &mut Vec<BlockEvent>) {
        if let Some(idx) = self.open_content.take() {
            if let StreamBlock::Content { complete, .. } = &mut self.blocks[idx] {
                *complete = true;
            }
            events.push(BlockEvent::ContentComplete(self.blocks[idx].clone()));
        }
    }

    fn close_all(&mut self, events: &mut Vec<BlockEvent>) {
        self.close_thinking(events);
        self.close_content(events);
        let slots: Vec<usize> = {
            let mut s: Vec<usize> = self.tool_slots.values().copied().collect();
            s.sort_unstable();
            s
        };
        self.tool_slots.clear();
        for slot in slots {
            if let StreamBlock::ToolCall {
                id,
                name,
                arguments_json,
                complete,
                ..
            } = &mut self.blocks[slot]
            {
                if *complete {
                    continue;
                }
                if StreamBlock::tool_call_parses(id, name, arguments_json) {
                    *complete = true;
                    events.push(BlockEvent::ToolCallComplete(self.blocks[slot].clone()));
                }
                // incomplete tool calls stay open; callers consult
                // incomplete_tool_calls() for the fail-closed path
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkChoice, Delta, DeltaFunction, DeltaToolCall};

    fn chunk_with_delta(delta: Delta, finish_reason: Option<&str>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: "chatcmpl-1".into(),
            object: "chat.completion.chunk".into(),
            created: 1,
            model: "gpt-4".into(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.map(str::to_string),
            }],
        }
    }

    fn content_chunk(text: &str) -> ChatCompletionChunk {
        chunk_with_delta(
            Delta {
                content: Some(text.into()),
                ..Delta::default()
            },
            None,
        )
    }

    fn tool_chunk(id: Option<&str>, name: Option<&str>, args: &str) -> ChatCompletionChunk {
        chunk_with_delta(
            Delta {
                tool_calls: Some(vec![DeltaToolCall {
                    index: 0,
                    id: id.map(str::to_string),
                    call_type: Some("function".into()),
                    function: Some(DeltaFunction {
                        name: name.map(str::to_string),
                        arguments: Some(args.into()),
                    }),
                }]),
                ..Delta::default()
            },
            None,
        )
    }

    #[test]
    fn content_accumulates_into_one_block() {
        let mut asm = BlockAssembler::new();
        asm.feed(&content_chunk("Hel"));
        asm.feed(&content_chunk("lo"));
        let events = asm.feed(&chunk_with_delta(Delta::default(), Some("stop")));
        assert!(matches!(
            &events[..],
            [BlockEvent::ContentComplete(StreamBlock::Content { text, complete: true, .. })]
                if text == "Hello"
        ));
    }

    #[test]
    fn tool_call_completes_only_with_valid_json() {
        let mut asm = BlockAssembler::new();
        asm.feed(&tool_chunk(Some("call_1"), Some("lookup"), "{\"q\":"));
        asm.feed(&tool_chunk(None, None, "1}"));
        let events = asm.feed(&chunk_with_delta(Delta::default(), Some("tool_calls")));
        let complete = events
            .iter()
            .find_map(|e| match e {
                BlockEvent::ToolCallComplete(b) => Some(b.clone()),
                _ => None,
            })
            .unwrap();
        match complete {
            StreamBlock::ToolCall {
                name,
                arguments_json,
                complete,
                ..
            } => {
                assert_eq!(name, "lookup");
                assert_eq!(arguments_json, "{\"q\":1}");
                assert!(complete);
            }
            other => panic!("unexpected block: {other:?}"),
        }
        assert!(asm.incomplete_tool_calls().is_empty());
    }

    #[test]
    fn truncated_tool_call_stays_incomplete() {
        let mut asm = BlockAssembler::new();
        asm.feed(&tool_chunk(Some("call_1"), Some("run"), "{\"cmd\": \"rm"));
        let events = asm.finish();
        assert!(events.iter().all(|e| !matches!(e, BlockEvent::ToolCallComplete(_))));
        assert_eq!(asm.incomplete_tool_calls().len(), 1);
    }

    #[test]
    fn thinking_completes_on_signature() {
        let mut asm = BlockAssembler::new();
        asm.feed(&chunk_with_delta(
            Delta {
                reasoning_content: Some("Think...".into()),
                ..Delta::default()
            },
            None,
        ));
        asm.feed(&content_chunk("Hello"));
        let events = asm.feed(&chunk_with_delta(
            Delta {
                thinking_blocks: Some(vec![ThinkingBlockDelta::Thinking {
                    thinking: None,
                    signature: Some("sig_x".into()),
                }]),
                ..Delta::default()
            },
            None,
        ));
        assert!(matches!(
            &events[..],
            [BlockEvent::ThinkingComplete(StreamBlock::Thinking { signature: Some(s), complete: true, .. })]
                if s == "sig_x"
        ));
    }

    #[test]
    fn block_indices_are_monotonic() {
        let mut asm = BlockAssembler::new();
        asm.feed(&chunk_with_delta(
            Delta {
                reasoning_content: Some("hm".into()),
                ..Delta::default()
            },
            None,
        ));
        asm.feed(&content_chunk("a"));
        asm.feed(&tool_chunk(Some("call_1"), Some("f"), "{}"));
        let indices: Vec<usize> = asm.blocks().iter().map(StreamBlock::index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn response_order_puts_thinking_first() {
        let mut blocks = vec![
            StreamBlock::Content {
                id: "c".into(),
                index: 0,
                text: "hi".into(),
                complete: true,
            },
            StreamBlock::Thinking {
                id: "t".into(),
                index: 1,
                text: "hm".into(),
                signature: None,
                complete: true,
            },
            StreamBlock::ToolCall {
                id: "call_1".into(),
                index: 2,
                name: "f".into(),
                arguments_json: "{}".into(),
                complete: true,
            },
        ];
        sort_blocks_for_response(&mut blocks);
        assert!(matches!(blocks[0], StreamBlock::Thinking { .. }));
        assert!(matches!(blocks[1], StreamBlock::Content { .. }));
        assert!(matches!(blocks[2], StreamBlock::ToolCall { .. }));
    }
}
