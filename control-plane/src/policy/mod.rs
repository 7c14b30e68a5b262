//! Policy capability interface.
//!
//! A policy is any value exposing the hook operations plus a streaming-context
//! factory. Hook methods return `Ok(None)` for "no change"; a returned value
//! replaces the payload the gateway sees. Streaming contexts are driven by
//! the dispatcher: raw chunks first, then block-level callbacks as the
//! assembler completes semantic units. Replacement chunks go into the
//! [`ChunkSink`]; a context that queues nothing for a chunk either passes the
//! original through or (when it [`suppresses_passthrough`]) holds the client
//! stream with a keep-alive.
//!
//! [`suppresses_passthrough`]: StreamPolicyContext::suppresses_passthrough

pub mod all_caps;
pub mod loader;
pub mod noop;
pub mod tool_call_buffer;
pub mod tool_call_judge;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use wire::{ChatCompletionChunk, StreamBlock};

pub use loader::{load_policy, PolicyServices};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy failure: {0}")]
    Failure(String),
}

/// Egress queue handle given to streaming-context callbacks.
pub struct ChunkSink {
    tx: mpsc::UnboundedSender<ChatCompletionChunk>,
}

impl ChunkSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChatCompletionChunk>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queues a chunk for the client. Order of pushes is preserved.
    pub fn push(&self, chunk: ChatCompletionChunk) {
        // receiver lives as long as the stream; a closed stream just drops output
        let _ = self.tx.send(chunk);
    }
}

/// Hook operations. Every method defaults to "no change".
#[async_trait]
pub trait Policy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn pre_call(&self, _payload: &Value) -> Result<Option<Value>, PolicyError> {
        Ok(None)
    }

    async fn post_call_success(&self, _payload: &Value) -> Result<Option<Value>, PolicyError> {
        Ok(None)
    }

    async fn post_call_failure(&self, _payload: &Value) -> Result<Option<Value>, PolicyError> {
        Ok(None)
    }

    async fn moderation(&self, _payload: &Value) -> Result<Option<Value>, PolicyError> {
        Ok(None)
    }

    /// Per-stream state, created when a stream's `START` frame arrives.
    fn stream_context(&self, call_id: &str, request: Value) -> Box<dyn StreamPolicyContext> {
        let _ = (call_id, request);
        Box::new(PassthroughContext)
    }
}

/// Request-scoped streaming interface driven by the dispatcher.
#[async_trait]
pub trait StreamPolicyContext: Send {
    /// When true, withheld chunks are answered with keep-alives instead of
    /// the original chunk. Buffering policies need this so withheld content
    /// cannot leak through the orchestrator's fail-open timeout.
    fn suppresses_passthrough(&self) -> bool {
        false
    }

    /// Raw chunk observation, before block assembly.
    async fn on_chunk_received(
        &mut self,
        _chunk: &ChatCompletionChunk,
        _sink: &ChunkSink,
    ) -> Result<(), PolicyError> {
        Ok(())
    }

    /// A content block grew by `delta`.
    async fn on_content_delta(
        &mut self,
        _block: &StreamBlock,
        _delta: &str,
        _sink: &ChunkSink,
    ) -> Result<(), PolicyError> {
        Ok(())
    }

    /// A tool-call block accumulated more argument bytes.
    async fn on_tool_call_delta(
        &mut self,
        _block: &StreamBlock,
        _delta: &str,
        _sink: &ChunkSink,
    ) -> Result<(), PolicyError> {
        Ok(())
    }

    /// A content block closed.
    async fn on_content_complete(
        &mut self,
        _block: &StreamBlock,
        _sink: &ChunkSink,
    ) -> Result<(), PolicyError> {
        Ok(())
    }

    /// A tool-call block closed with a complete id, name, and JSON arguments.
    async fn on_tool_call_complete(
        &mut self,
        _block: &StreamBlock,
        _sink: &ChunkSink,
    ) -> Result<(), PolicyError> {
        Ok(())
    }

    /// The upstream stream ended (END frame or socket loss).
    async fn on_stream_end(&mut self, _sink: &ChunkSink) -> Result<(), PolicyError> {
        Ok(())
    }
}

/// Identity context: queues nothing, so every chunk passes through.
pub struct PassthroughContext;

#[async_trait]
impl StreamPolicyContext for PassthroughContext {}
