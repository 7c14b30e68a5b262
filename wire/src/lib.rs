//! Wire model shared by the callback shim and the control plane.
//!
//! Everything that crosses a process boundary lives here:
//!
//! - **[`chunk`]**: the canonical OpenAI-style streaming chunk. All chunks,
//!   regardless of upstream provider, are carried through the system in this
//!   shape.
//! - **[`block`]**: semantically complete stream fragments ([`StreamBlock`])
//!   assembled from chunk deltas, so policies can operate on whole content
//!   blocks, tool calls, and thinking blocks instead of raw token deltas.
//! - **[`anthropic`]**: typed Anthropic Messages SSE events.
//! - **[`ingress`]**: Anthropic SSE → canonical chunk adapter.
//! - **[`egress`]**: canonical chunks → client-facing SSE (Anthropic events
//!   or OpenAI `data:` lines).
//! - **[`protocol`]**: the START/CHUNK/END/ERROR frames exchanged between the
//!   stream orchestrator and the control plane over WebSocket.

pub mod anthropic;
pub mod block;
pub mod chunk;
pub mod egress;
pub mod ingress;
pub mod protocol;
pub mod sse;

pub use anthropic::AnthropicEvent;
pub use block::{BlockAssembler, BlockEvent, StreamBlock};
pub use chunk::{ChatCompletionChunk, ChunkChoice, Delta, DeltaFunction, DeltaToolCall, ThinkingBlockDelta};
pub use ingress::AnthropicIngress;
pub use protocol::{ClientFrame, ServerFrame};

use thiserror::Error;

/// Errors raised while validating or translating wire payloads.
#[derive(Debug, Error)]
pub enum WireError {
    /// A chunk failed canonical-schema validation (§ chunk docs).
    #[error("invalid stream chunk: {0}")]
    InvalidChunk(String),
    /// An Anthropic SSE payload could not be parsed into a typed event.
    #[error("invalid anthropic event: {0}")]
    InvalidEvent(#[from] serde_json::Error),
}
