//! Buffers streaming tool calls, logs them, then forwards a merged chunk.
//!
//! While a tool call is accumulating, the client sees keep-alives instead of
//! argument fragments. When the call completes, one merged chunk carrying the
//! whole call (and `finish_reason: "tool_calls"`) is released.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use wire::{ChatCompletionChunk, ChunkChoice, Delta, DeltaFunction, DeltaToolCall, StreamBlock};

use crate::policy::{ChunkSink, Policy, PolicyError, StreamPolicyContext};
use crate::store::DebugLogStore;

pub const TOOL_CALL_DEBUG_TYPE: &str = "conversation:tool-call";
pub const TOOL_CALL_SCHEMA: &str = "sluice.conversation.tool_call.v1";

pub struct ToolCallBufferPolicy {
    debug: Arc<dyn DebugLogStore>,
}

impl ToolCallBufferPolicy {
    pub fn new(debug: Arc<dyn DebugLogStore>) -> Self {
        Self { debug }
    }
}

impl Policy for ToolCallBufferPolicy {
    fn name(&self) -> &'static str {
        "tool_call_buffer"
    }

    fn stream_context(&self, call_id: &str, request: Value) -> Box<dyn StreamPolicyContext> {
        Box::new(ToolCallBufferContext::new(
            call_id,
            &request,
            self.debug.clone(),
        ))
    }
}

/// Shared buffering state, also embedded by the judge policy.
pub(crate) struct ToolCallBufferContext {
    pub(crate) call_id: String,
    pub(crate) trace_id: Option<String>,
    pub(crate) last_chunk: Option<ChatCompletionChunk>,
    pub(crate) chunks_buffered: usize,
    pub(crate) logged_tool_ids: HashSet<String>,
    pub(crate) debug: Arc<dyn DebugLogStore>,
}

impl ToolCallBufferContext {
    pub(crate) fn new(call_id: &str, request: &Value, debug: Arc<dyn DebugLogStore>) -> Self {
        Self {
            call_id: call_id.to_string(),
            trace_id: request
                .get("litellm_trace_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            last_chunk: None,
            chunks_buffered: 0,
            logged_tool_ids: HashSet::new(),
            debug,
        }
    }

    /// True when `chunk` belongs to an in-flight tool call and must be
    /// withheld from the client.
    pub(crate) fn buffers(&mut self, chunk: &ChatCompletionChunk) -> bool {
        self.last_chunk = Some(chunk.clone());
        if chunk.has_tool_calls() || chunk.finish_reason() == Some("tool_calls") {
            self.chunks_buffered += 1;
            return true;
        }
        false
    }

    /// Chunk identity (id/model/created) for synthesized output.
    fn identity(&self) -> (String, String, u64) {
        match &self.last_chunk {
            Some(chunk) => (chunk.id.clone(), chunk.model.clone(), chunk.created),
            None => (
                self.call_id.clone(),
                "unknown".to_string(),
                Utc::now().timestamp().max(0) as u64,
            ),
        }
    }

    /// One merged chunk carrying the complete tool call.
    pub(crate) fn merged_tool_chunk(&self, block: &StreamBlock) -> ChatCompletionChunk {
        let (id, model, created) = self.identity();
        let (call_id, name, arguments) = tool_call_parts(block);
        ChatCompletionChunk {
            id,
            object: "chat.completion.chunk".to_string(),
            created,
            model,
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta {
                    role: Some("assistant".to_string()),
                    content: None,
                    tool_calls: Some(vec![DeltaToolCall {
                        index: 0,
                        id: Some(call_id),
                        call_type: Some("function".to_string()),
                        function: Some(DeltaFunction {
                            name: Some(name),
                            arguments: Some(arguments),
                        }),
                    }]),
                    reasoning_content: None,
                    thinking_blocks: None,
                },
                finish_reason: Some("tool_calls".to_string()),
            }],
        }
    }

    pub(crate) async fn log_tool_call(&mut self, block: &StreamBlock) {
        let (call_id, name, arguments) = tool_call_parts(block);
        if !self.logged_tool_ids.insert(call_id.clone()) {
            return;
        }
        let record = json!({
            "schema": TOOL_CALL_SCHEMA,
            "call_id": self.call_id,
            "trace_id": self.trace_id,
            "timestamp": Utc::now().to_rfc3339(),
            "chunks_buffered": self.chunks_buffered,
            "tool_calls": [{
                "id": call_id,
                "type": "function",
                "name": name,
                "arguments": arguments,
            }],
        });
        if let Err(e) = self.debug.append(TOOL_CALL_DEBUG_TYPE, record).await {
            tracing::warn!(call_id = %self.call_id, "tool-call log append failed: {e}");
        }
    }
}

pub(crate) fn tool_call_parts(block: &StreamBlock) -> (String, String, String) {
    match block {
        StreamBlock::ToolCall {
            id,
            name,
            arguments_json,
            ..
        } => (id.clone(), name.clone(), arguments_json.clone()),
        _ => (String::new(), String::new(), String::new()),
    }
}

#[async_trait]
impl StreamPolicyContext for ToolCallBufferContext {
    fn suppresses_passthrough(&self) -> bool {
        true
    }

    async fn on_chunk_received(
        &mut self,
        chunk: &ChatCompletionChunk,
        sink: &ChunkSink,
    ) -> Result<(), PolicyError> {
        if !self.buffers(chunk) {
            sink.push(chunk.clone());
        }
        Ok(())
    }

    async fn on_tool_call_complete(
        &mut self,
        block: &StreamBlock,
        sink: &ChunkSink,
    ) -> Result<(), PolicyError> {
        self.log_tool_call(block).await;
        sink.push(self.merged_tool_chunk(block));
        self.chunks_buffered = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn tool_chunk(args: &str, finish: Option<&str>) -> ChatCompletionChunk {
        ChatCompletionChunk::from_value(json!({
            "id": "chatcmpl-1", "model": "gpt-4", "created": 5u64,
            "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "type": "function",
                 "function": {"name": "lookup", "arguments": args}},
            ]}, "finish_reason": finish}],
        }))
        .unwrap()
    }

    fn text_chunk(text: &str) -> ChatCompletionChunk {
        ChatCompletionChunk::from_value(json!({
            "id": "chatcmpl-1", "model": "gpt-4", "created": 5u64,
            "choices": [{"index": 0, "delta": {"content": text}}],
        }))
        .unwrap()
    }

    fn block() -> StreamBlock {
        StreamBlock::ToolCall {
            id: "call_1".into(),
            index: 0,
            name: "lookup".into(),
            arguments_json: "{\"q\":1}".into(),
            complete: true,
        }
    }

    #[tokio::test]
    async fn buffers_tool_chunks_and_passes_text() {
        let store = Arc::new(MemoryStore::new());
        let mut ctx = ToolCallBufferContext::new("call-1", &json!({}), store);
        let (sink, mut rx) = ChunkSink::new();

        ctx.on_chunk_received(&text_chunk("hi"), &sink).await.unwrap();
        assert_eq!(rx.try_recv().unwrap().delta_text(), Some("hi"));

        ctx.on_chunk_received(&tool_chunk("{\"q\":", None), &sink)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(ctx.chunks_buffered, 1);
    }

    #[tokio::test]
    async fn complete_tool_call_releases_one_merged_chunk() {
        let store = Arc::new(MemoryStore::new());
        let mut ctx = ToolCallBufferContext::new("call-1", &json!({}), store.clone());
        let (sink, mut rx) = ChunkSink::new();

        ctx.on_chunk_received(&tool_chunk("{\"q\":", None), &sink)
            .await
            .unwrap();
        ctx.on_chunk_received(&tool_chunk("1}", Some("tool_calls")), &sink)
            .await
            .unwrap();
        ctx.on_tool_call_complete(&block(), &sink).await.unwrap();

        let merged = rx.try_recv().unwrap();
        assert_eq!(merged.finish_reason(), Some("tool_calls"));
        let calls = merged.first_choice().unwrap().delta.tool_calls.clone().unwrap();
        assert_eq!(calls[0].id.as_deref(), Some("call_1"));
        assert_eq!(
            calls[0].function.as_ref().unwrap().arguments.as_deref(),
            Some("{\"q\":1}")
        );
        assert!(rx.try_recv().is_err());

        use crate::store::DebugLogStore;
        let logs = store.entries_with_prefix(TOOL_CALL_DEBUG_TYPE).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].jsonblob["chunks_buffered"], 2);
    }

    #[tokio::test]
    async fn duplicate_completion_logs_once() {
        let store = Arc::new(MemoryStore::new());
        let mut ctx = ToolCallBufferContext::new("call-1", &json!({}), store.clone());
        ctx.log_tool_call(&block()).await;
        ctx.log_tool_call(&block()).await;
        use crate::store::DebugLogStore;
        let logs = store.entries_with_prefix(TOOL_CALL_DEBUG_TYPE).await.unwrap();
        assert_eq!(logs.len(), 1);
    }
}
