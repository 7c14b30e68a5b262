//! Hook facade attached to the upstream LLM client.
//!
//! Mirrors the gateway's hook surface: non-streaming hooks POST to the control
//! plane over HTTP; streaming calls run through the per-call WebSocket and the
//! orchestrator. Anthropic upstreams are normalized to canonical chunks before
//! anything else sees them, so the control plane never needs provider-specific
//! logic.

use std::sync::Arc;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;

use config::CallbackSettings;
use wire::{AnthropicIngress, ChatCompletionChunk};

use crate::connection::StreamConnectionManager;
use crate::hooks::HookClient;
use crate::orchestrator::StreamOrchestrator;

/// True when the model name points at an Anthropic backend.
pub fn is_anthropic_model(model: Option<&str>) -> bool {
    model.is_some_and(|name| {
        let lowered = name.to_ascii_lowercase();
        lowered.contains("anthropic") || lowered.contains("claude")
    })
}

/// Upstream source for a streaming call.
pub enum Upstream {
    /// Already-canonical chunks (OpenAI-style upstream).
    Chunks(BoxStream<'static, ChatCompletionChunk>),
    /// Raw Anthropic SSE bytes, normalized at this seam.
    AnthropicSse(BoxStream<'static, Vec<u8>>),
}

/// Gateway-side hook shim bound to one control plane.
pub struct ControlPlaneCallback {
    settings: CallbackSettings,
    hooks: HookClient,
    connections: Arc<StreamConnectionManager>,
}

impl ControlPlaneCallback {
    pub fn new(settings: CallbackSettings) -> Self {
        let hooks = HookClient::new(settings.control_plane_url.clone(), settings.hook_timeout);
        Self {
            settings,
            hooks,
            connections: Arc::new(StreamConnectionManager::new()),
        }
    }

    pub fn connections(&self) -> Arc<StreamConnectionManager> {
        self.connections.clone()
    }

    /// Forwards the pre-call payload; the control plane may rewrite `data`.
    pub async fn pre_call(&self, user_api_key_dict: &Value, data: &Value, call_type: &str) -> Option<Value> {
        self.hooks
            .post(
                "pre_call",
                &json!({
                    "user_api_key_dict": user_api_key_dict,
                    "data": data,
                    "call_type": call_type,
                }),
            )
            .await
    }

    /// Lets the control plane inspect and optionally replace a non-streaming
    /// response. The replacement is applied in place.
    pub async fn post_call_success(
        &self,
        data: &Value,
        user_api_key_dict: &Value,
        response: &mut Value,
    ) -> Option<Value> {
        let result = self
            .hooks
            .post(
                "post_call_success",
                &json!({
                    "data": data,
                    "user_api_key_dict": user_api_key_dict,
                    "response": &*response,
                }),
            )
            .await?;
        if result.is_null() {
            return None;
        }
        if result.is_object() {
            *response = result.clone();
        } else {
            tracing::error!("ignoring non-object policy replacement for post_call_success");
        }
        Some(result)
    }

    /// Notifies the control plane that the upstream call failed.
    pub async fn post_call_failure(
        &self,
        request_data: &Value,
        error: &str,
        user_api_key_dict: &Value,
    ) {
        let _ = self
            .hooks
            .post(
                "post_call_failure",
                &json!({
                    "request_data": request_data,
                    "original_exception": error,
                    "user_api_key_dict": user_api_key_dict,
                }),
            )
            .await;
    }

    pub async fn moderation(&self, data: &Value, user_api_key_dict: &Value, call_type: &str) {
        let _ = self
            .hooks
            .post(
                "moderation",
                &json!({
                    "data": data,
                    "user_api_key_dict": user_api_key_dict,
                    "call_type": call_type,
                }),
            )
            .await;
    }

    /// Runs a streaming call through the control plane.
    ///
    /// Returns `None` when the request carries no call id (the stream is
    /// dropped) or when the control-plane channel cannot be established; in
    /// the latter case the caller should fall back to the raw upstream, which
    /// [`passthrough_stream`] provides.
    pub async fn stream(
        &self,
        request_data: Value,
        upstream: Upstream,
    ) -> Option<ReceiverStream<ChatCompletionChunk>> {
        let call_id = request_data
            .get("litellm_call_id")
            .and_then(Value::as_str)
            .map(str::to_string)?;

        let connection = match self
            .connections
            .get_or_create(
                &self.settings.stream_url(&call_id),
                &call_id,
                request_data.clone(),
            )
            .await
        {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(call_id = %call_id, "unable to establish control plane connection: {e}");
                return None;
            }
        };

        let chunks = match upstream {
            Upstream::Chunks(chunks) => chunks,
            Upstream::AnthropicSse(bytes) => normalize_anthropic_stream(bytes),
        };

        let orchestrator = StreamOrchestrator::new(
            call_id,
            connection,
            Some(self.connections.clone()),
            self.settings.chunk_timeout,
            self.settings.stream_timeout,
        );
        Some(orchestrator.run(chunks))
    }
}

/// Fallback for unreachable control planes: the upstream as canonical chunks,
/// with no interception.
pub fn passthrough_stream(upstream: Upstream) -> BoxStream<'static, ChatCompletionChunk> {
    match upstream {
        Upstream::Chunks(chunks) => chunks,
        Upstream::AnthropicSse(bytes) => normalize_anthropic_stream(bytes),
    }
}

/// Converts a raw Anthropic SSE byte stream into canonical chunks.
pub fn normalize_anthropic_stream(
    bytes: BoxStream<'static, Vec<u8>>,
) -> BoxStream<'static, ChatCompletionChunk> {
    let (tx, rx) = tokio::sync::mpsc::channel(64);
    tokio::spawn(async move {
        let mut ingress = AnthropicIngress::new();
        let mut bytes = bytes;
        while let Some(payload) = bytes.next().await {
            match ingress.process(&payload) {
                Ok(chunks) => {
                    for chunk in chunks {
                        if tx.send(chunk).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("dropping malformed anthropic event: {e}");
                }
            }
        }
        for chunk in ingress.finalize() {
            if tx.send(chunk).await.is_err() {
                return;
            }
        }
    });
    ReceiverStream::new(rx).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_model_detection() {
        assert!(is_anthropic_model(Some("anthropic/claude-sonnet-4-5")));
        assert!(is_anthropic_model(Some("Claude-Haiku")));
        assert!(!is_anthropic_model(Some("gpt-4o")));
        assert!(!is_anthropic_model(None));
    }

    #[tokio::test]
    async fn passthrough_forwards_chunks_untouched() {
        let chunk = ChatCompletionChunk::from_value(serde_json::json!({
            "id": "chatcmpl-1", "model": "gpt-4", "created": 1u64,
            "choices": [{"index": 0, "delta": {"content": "hi"}}],
        }))
        .unwrap();
        let stream =
            passthrough_stream(Upstream::Chunks(futures_util::stream::iter(vec![chunk.clone()]).boxed()));
        let out: Vec<_> = stream.collect().await;
        assert_eq!(out, vec![chunk]);
    }

    #[tokio::test]
    async fn normalize_anthropic_stream_yields_canonical_chunks() {
        let frames: Vec<Vec<u8>> = vec![
            b"event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude-sonnet-4-5\"}}\n\n".to_vec(),
            b"event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n\n".to_vec(),
        ];
        let stream = normalize_anthropic_stream(futures_util::stream::iter(frames).boxed());
        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks.len(), 3); // role chunk, text chunk, synthesized terminal
        assert_eq!(chunks[1].delta_text(), Some("hi"));
        assert_eq!(chunks[2].finish_reason(), Some("stop"));
    }
}
