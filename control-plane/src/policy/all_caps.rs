//! Demonstration policy: uppercases assistant output.

use async_trait::async_trait;
use serde_json::Value;

use wire::ChatCompletionChunk;

use crate::policy::{ChunkSink, Policy, PolicyError, StreamPolicyContext};

pub struct AllCapsPolicy;

fn uppercase_chunk(chunk: &ChatCompletionChunk) -> ChatCompletionChunk {
    let mut out = chunk.clone();
    for choice in &mut out.choices {
        if let Some(content) = choice.delta.content.as_mut() {
            *content = content.to_uppercase();
        }
    }
    out
}

#[async_trait]
impl Policy for AllCapsPolicy {
    fn name(&self) -> &'static str {
        "all_caps"
    }

    async fn post_call_success(&self, payload: &Value) -> Result<Option<Value>, PolicyError> {
        let Some(response) = payload.get("response") else {
            return Ok(None);
        };
        let mut response = response.clone();
        if let Some(slot) = response.pointer_mut("/choices/0/message/content") {
            if let Some(text) = slot.as_str() {
                let upper = text.to_uppercase();
                *slot = Value::String(upper);
                return Ok(Some(response));
            }
        }
        Ok(None)
    }

    fn stream_context(&self, _call_id: &str, _request: Value) -> Box<dyn StreamPolicyContext> {
        Box::new(AllCapsStreamContext)
    }
}

struct AllCapsStreamContext;

#[async_trait]
impl StreamPolicyContext for AllCapsStreamContext {
    async fn on_chunk_received(
        &mut self,
        chunk: &ChatCompletionChunk,
        sink: &ChunkSink,
    ) -> Result<(), PolicyError> {
        sink.push(uppercase_chunk(chunk));
        Ok(())
    }
}
