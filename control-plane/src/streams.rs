//! Per-call streaming WebSocket: receive chunks, drive the policy, reply.
//!
//! Protocol (lockstep, one reply per CHUNK):
//!
//! ```text
//! callback → {"type":"START","data":…}   (no reply)
//! callback → {"type":"CHUNK","data":…}   → {"type":"CHUNK","data":…}
//! callback → {"type":"END"}              → 0+ CHUNK frames, then {"type":"END"}
//! ```
//!
//! Loss of the socket is treated as `END`. A policy failure surfaces as an
//! `ERROR` frame, after which the callback passes the rest of the stream
//! through on its own.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use wire::block::BlockEvent;
use wire::{BlockAssembler, ChatCompletionChunk, ChunkChoice, ClientFrame, Delta, ServerFrame, StreamBlock};

use crate::app::AppState;
use crate::conversation::utils::extract_trace_id;
use crate::policy::{ChunkSink, PolicyError, StreamPolicyContext};
use crate::result_pipeline::log_and_publish_hook_result;

/// How long the dispatcher waits for policy egress before synthesizing a
/// reply for a chunk.
const T_YIELD: Duration = Duration::from_millis(100);

const STREAM_CHUNK_HOOK: &str = "post_call_streaming_iterator";

pub async fn ws_handler(
    Path(call_id): Path<String>,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_stream_socket(socket, call_id, state))
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), axum::Error> {
    let json = serde_json::to_string(frame).unwrap_or_else(|_| {
        r#"{"type":"ERROR","error":"serialization error"}"#.to_string()
    });
    socket.send(Message::Text(json)).await
}

/// Next client frame, or `None` when the socket is gone or unreadable.
async fn recv_frame(socket: &mut WebSocket, call_id: &str) -> Option<ClientFrame> {
    loop {
        let message = match socket.recv().await? {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(call_id = %call_id, "stream socket read error (client closed?): {e}");
                return None;
            }
        };
        let text = match &message {
            Message::Text(t) => t.clone(),
            Message::Binary(b) => String::from_utf8_lossy(b).into_owned(),
            Message::Close(_) => return None,
            _ => continue,
        };
        match serde_json::from_str(&text) {
            Ok(frame) => return Some(frame),
            Err(e) => {
                tracing::warn!(call_id = %call_id, "unparseable stream frame: {e}");
                return None;
            }
        }
    }
}

async fn handle_stream_socket(mut socket: WebSocket, call_id: String, state: Arc<AppState>) {
    if !state.claim_stream(&call_id) {
        tracing::warn!(call_id = %call_id, "rejecting second stream socket for live call");
        let _ = send_frame(
            &mut socket,
            &ServerFrame::Error {
                error: format!("stream {call_id} already active"),
            },
        )
        .await;
        let _ = socket.close().await;
        return;
    }
    drive_stream(&mut socket, &call_id, &state).await;
    state.release_stream(&call_id);
    let _ = socket.close().await;
}

/// Per-stream dispatcher state.
struct StreamSession {
    call_id: String,
    trace_id: Option<String>,
    context: Box<dyn StreamPolicyContext>,
    assembler: BlockAssembler,
    sink: ChunkSink,
    egress: mpsc::UnboundedReceiver<ChatCompletionChunk>,
    /// Egress beyond one-per-chunk, served as replies to later chunks.
    pending: VecDeque<ChatCompletionChunk>,
    last_chunk: Option<ChatCompletionChunk>,
    final_text: String,
    failed: bool,
}

impl StreamSession {
    fn new(call_id: &str, state: &AppState, request: Value) -> Self {
        let trace_id = extract_trace_id(&request);
        let context = state.policy.stream_context(call_id, request);
        let (sink, egress) = ChunkSink::new();
        Self {
            call_id: call_id.to_string(),
            trace_id,
            context,
            assembler: BlockAssembler::new(),
            sink,
            egress,
            pending: VecDeque::new(),
            last_chunk: None,
            final_text: String::new(),
            failed: false,
        }
    }

    async fn apply_policy(&mut self, chunk: &ChatCompletionChunk) -> Result<(), PolicyError> {
        self.last_chunk = Some(chunk.clone());
        self.context.on_chunk_received(chunk, &self.sink).await?;
        let events = self.assembler.feed(chunk);
        self.dispatch_block_events(events).await
    }

    async fn dispatch_block_events(&mut self, events: Vec<BlockEvent>) -> Result<(), PolicyError> {
        for event in events {
            match event {
                BlockEvent::ContentDelta { index, delta } => {
                    let block = self.assembler.blocks()[index].clone();
                    self.context
                        .on_content_delta(&block, &delta, &self.sink)
                        .await?;
                }
                BlockEvent::ToolCallDelta { index, delta } => {
                    let block = self.assembler.blocks()[index].clone();
                    self.context
                        .on_tool_call_delta(&block, &delta, &self.sink)
                        .await?;
                }
                BlockEvent::ContentComplete(block) => {
                    self.context.on_content_complete(&block, &self.sink).await?;
                }
                BlockEvent::ToolCallComplete(block) => {
                    self.context
                        .on_tool_call_complete(&block, &self.sink)
                        .await?;
                }
                // thinking blocks are observable through the raw chunks
                BlockEvent::ThinkingDelta { .. }
                | BlockEvent::ThinkingComplete(_)
                | BlockEvent::RedactedThinking(_) => {}
            }
        }
        Ok(())
    }

    /// Picks the reply for one chunk: queued egress first, then a bounded
    /// wait, then a synthetic passthrough or keep-alive.
    async fn next_reply(&mut self, original: &ChatCompletionChunk) -> ChatCompletionChunk {
        let reply = match self.pending.pop_front() {
            Some(chunk) => chunk,
            None => match tokio::time::timeout(T_YIELD, self.egress.recv()).await {
                Ok(Some(chunk)) => chunk,
                _ => {
                    if self.context.suppresses_passthrough() {
                        original.keep_alive_like()
                    } else {
                        original.clone()
                    }
                }
            },
        };
        self.absorb_egress();
        reply
    }

    fn absorb_egress(&mut self) {
        while let Ok(extra) = self.egress.try_recv() {
            self.pending.push_back(extra);
        }
    }

    /// Closes the block model at end of stream; returns the chunks still owed
    /// to the client. An incomplete tool call fails closed here.
    async fn finish(&mut self, state: &Arc<AppState>) -> Vec<ChatCompletionChunk> {
        let events = self.assembler.finish();
        if let Err(e) = self.dispatch_block_events(events).await {
            tracing::error!(call_id = %self.call_id, "policy failed at stream end: {e}");
            self.failed = true;
        }

        let incomplete: Vec<StreamBlock> = self
            .assembler
            .incomplete_tool_calls()
            .into_iter()
            .cloned()
            .collect();
        if !incomplete.is_empty() {
            self.failed = true;
            let debug_store = state.debug_logs.clone();
            let record = json!({
                "call_id": self.call_id,
                "trace_id": self.trace_id,
                "tool_calls": incomplete,
            });
            state
                .debug_queue
                .submit(async move { debug_store.append("stream:incomplete_tool_call", record).await });
            self.pending.push_back(self.incomplete_tool_call_chunk());
        }

        if let Err(e) = self.context.on_stream_end(&self.sink).await {
            tracing::error!(call_id = %self.call_id, "policy on_stream_end failed: {e}");
            self.failed = true;
        }
        self.absorb_egress();
        self.pending.drain(..).collect()
    }

    /// Synthetic blocked response for a stream that ended mid tool-call.
    fn incomplete_tool_call_chunk(&self) -> ChatCompletionChunk {
        let (id, model, created) = match &self.last_chunk {
            Some(chunk) => (chunk.id.clone(), chunk.model.clone(), chunk.created),
            None => (self.call_id.clone(), "unknown".to_string(), 0),
        };
        ChatCompletionChunk {
            id,
            object: "chat.completion.chunk".to_string(),
            created,
            model,
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta {
                    role: Some("assistant".to_string()),
                    content: Some(
                        "\u{26d4} BLOCKED: stream ended with an incomplete tool call.".to_string(),
                    ),
                    tool_calls: None,
                    reasoning_content: None,
                    thinking_blocks: None,
                },
                finish_reason: Some("stop".to_string()),
            }],
        }
    }
}

async fn drive_stream(socket: &mut WebSocket, call_id: &str, state: &Arc<AppState>) {
    let Some(first) = recv_frame(socket, call_id).await else {
        return;
    };
    let ClientFrame::Start { data } = first else {
        tracing::warn!(call_id = %call_id, "stream opened without START frame");
        let _ = send_frame(
            socket,
            &ServerFrame::Error {
                error: "expected START".to_string(),
            },
        )
        .await;
        return;
    };

    let debug_store = state.debug_logs.clone();
    let start_record = json!({"call_id": call_id, "request_data": &data});
    state
        .debug_queue
        .submit(async move { debug_store.append("stream:start", start_record).await });
    state.count_hook(STREAM_CHUNK_HOOK);

    let mut session = StreamSession::new(call_id, state, data);
    let mut socket_lost = false;

    loop {
        let frame = recv_frame(socket, call_id).await;
        match frame {
            Some(ClientFrame::Chunk { data }) => {
                let original = match ChatCompletionChunk::from_value(data.clone()) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        // echo malformed input to keep the lockstep intact
                        tracing::warn!(call_id = %call_id, "malformed upstream chunk: {e}");
                        if send_frame(socket, &ServerFrame::Chunk { data }).await.is_err() {
                            socket_lost = true;
                            break;
                        }
                        continue;
                    }
                };

                if let Err(e) = session.apply_policy(&original).await {
                    tracing::error!(call_id = %call_id, "policy failure on chunk: {e}");
                    let debug_store = state.debug_logs.clone();
                    let record = json!({"call_id": call_id, "error": e.to_string()});
                    state.debug_queue.submit(async move {
                        debug_store.append("stream:policy_error", record).await
                    });
                    session.failed = true;
                    let _ = send_frame(
                        socket,
                        &ServerFrame::Error {
                            error: e.to_string(),
                        },
                    )
                    .await;
                    break;
                }

                let reply = session.next_reply(&original).await;
                if let Some(text) = reply.delta_text() {
                    session.final_text.push_str(text);
                }
                let rewritten = reply != original;
                if send_frame(
                    socket,
                    &ServerFrame::Chunk {
                        data: reply.to_value(),
                    },
                )
                .await
                .is_err()
                {
                    socket_lost = true;
                    break;
                }
                log_and_publish_hook_result(
                    state,
                    STREAM_CHUNK_HOOK,
                    Some(call_id),
                    session.trace_id.as_deref(),
                    json!({"chunk": original.to_value()}),
                    rewritten.then(|| json!({"chunk": reply.to_value()})),
                );
            }
            Some(ClientFrame::End) => break,
            Some(ClientFrame::Start { .. }) => {
                tracing::warn!(call_id = %call_id, "duplicate START frame ignored");
            }
            // socket loss is equivalent to END
            None => {
                socket_lost = true;
                break;
            }
        }
    }

    let owed = session.finish(state).await;
    if !socket_lost {
        for chunk in owed {
            if let Some(text) = chunk.delta_text() {
                session.final_text.push_str(text);
            }
            if send_frame(
                socket,
                &ServerFrame::Chunk {
                    data: chunk.to_value(),
                },
            )
            .await
            .is_err()
            {
                break;
            }
        }
        let _ = send_frame(socket, &ServerFrame::End).await;
    }

    let (hook, payload) = if session.failed {
        (
            "post_call_failure",
            json!({
                "request_data": {"litellm_call_id": call_id},
                "original_exception": "stream failed closed",
            }),
        )
    } else {
        (
            "post_call_streaming",
            json!({
                "response": {
                    "choices": [{"message": {"role": "assistant", "content": session.final_text}}],
                },
            }),
        )
    };
    log_and_publish_hook_result(
        state,
        hook,
        Some(call_id),
        session.trace_id.as_deref(),
        payload,
        None,
    );
}
