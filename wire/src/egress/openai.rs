//! Canonical chunks → OpenAI-style SSE lines.

use crate::chunk::ChatCompletionChunk;

/// Stream terminator per the OpenAI streaming format.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Renders one chunk as `data: {json}\n\n`.
pub fn format_chunk(chunk: &ChatCompletionChunk) -> String {
    let json = serde_json::to_string(chunk).unwrap_or_else(|_| "{}".to_string());
    format!("data: {json}\n\n")
}
