//! Lockstep ferry between the upstream LLM iterator and the control plane.
//!
//! For each upstream chunk the orchestrator sends one `CHUNK` frame and waits
//! for exactly one reply before touching the next chunk, so client output
//! order always equals upstream order. Every degradation fails open: the
//! client keeps receiving the stream (verbatim) even when the control plane
//! is slow, broken, or gone.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use wire::{ChatCompletionChunk, ClientFrame, ServerFrame};

use crate::connection::{ConnectionError, StreamConnection, StreamConnectionManager};

/// Buffered chunks between the ferry task and the consumer.
const EGRESS_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Per-stream budget exhausted; the stream continues in passthrough.
    #[error("stream {0} exceeded its control-plane time budget")]
    StreamTimeout(String),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Channel seam between the orchestrator and the control plane, so the ferry
/// loop can be exercised without a live WebSocket.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    async fn send(&self, frame: &ClientFrame) -> Result<(), ConnectionError>;
    async fn receive(&self, timeout: Duration) -> Result<Option<ServerFrame>, ConnectionError>;
    async fn close(&self);
}

#[async_trait]
impl ControlChannel for StreamConnection {
    async fn send(&self, frame: &ClientFrame) -> Result<(), ConnectionError> {
        StreamConnection::send(self, frame).await
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<ServerFrame>, ConnectionError> {
        StreamConnection::receive(self, timeout).await
    }

    async fn close(&self) {
        StreamConnection::close(self).await;
    }
}

/// Stream lifecycle, visible for logging and tests. `Passthrough` is sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Opening,
    Active,
    Passthrough,
    Draining,
    Closed,
}

/// Ferries one call's chunks between upstream and the control plane.
pub struct StreamOrchestrator<C: ControlChannel + 'static> {
    call_id: String,
    channel: Arc<C>,
    manager: Option<Arc<StreamConnectionManager>>,
    chunk_timeout: Duration,
    stream_timeout: Duration,
}

impl<C: ControlChannel + 'static> StreamOrchestrator<C> {
    pub fn new(
        call_id: impl Into<String>,
        channel: Arc<C>,
        manager: Option<Arc<StreamConnectionManager>>,
        chunk_timeout: Duration,
        stream_timeout: Duration,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            channel,
            manager,
            chunk_timeout,
            stream_timeout,
        }
    }

    /// Spawns the ferry task and returns the stream of chunks for the client.
    ///
    /// Dropping the returned stream cancels the call: upstream iteration
    /// stops, no `END` is sent, and the connection slot is freed.
    pub fn run<U>(self, upstream: U) -> ReceiverStream<ChatCompletionChunk>
    where
        U: Stream<Item = ChatCompletionChunk> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(EGRESS_QUEUE_CAPACITY);
        tokio::spawn(self.ferry(upstream, tx));
        ReceiverStream::new(rx)
    }

    async fn ferry<U>(self, upstream: U, tx: mpsc::Sender<ChatCompletionChunk>)
    where
        U: Stream<Item = ChatCompletionChunk> + Send + 'static,
    {
        let deadline = tokio::time::Instant::now() + self.stream_timeout;
        let mut state = StreamState::Active;
        let mut send_end = true;
        let mut truncated = false;
        let mut upstream = std::pin::pin!(upstream);

        'ferry: while let Some(chunk) = upstream.next().await {
            if state == StreamState::Passthrough {
                if tx.send(chunk).await.is_err() {
                    send_end = false;
                    break 'ferry;
                }
                continue;
            }

            if tokio::time::Instant::now() >= deadline {
                let err = OrchestratorError::StreamTimeout(self.call_id.clone());
                tracing::error!(call_id = %self.call_id, "{err}; passing stream through");
                state = StreamState::Passthrough;
                send_end = false;
                if tx.send(chunk).await.is_err() {
                    break 'ferry;
                }
                continue;
            }

            if let Err(e) = self
                .channel
                .send(&ClientFrame::Chunk {
                    data: chunk.to_value(),
                })
                .await
            {
                tracing::warn!(call_id = %self.call_id, "chunk send failed ({e}); passing stream through");
                state = StreamState::Passthrough;
                send_end = false;
                if tx.send(chunk).await.is_err() {
                    break 'ferry;
                }
                continue;
            }

            let reply = self.channel.receive(self.chunk_timeout).await;
            let emit = match reply {
                Ok(Some(ServerFrame::Chunk { data })) => match ChatCompletionChunk::from_value(data)
                {
                    Ok(replacement) => replacement,
                    Err(e) => {
                        tracing::warn!(
                            call_id = %self.call_id,
                            "control plane returned malformed chunk ({e}); emitting original"
                        );
                        chunk
                    }
                },
                Ok(Some(ServerFrame::End)) => {
                    truncated = true;
                    break 'ferry;
                }
                Ok(Some(ServerFrame::Error { error })) => {
                    tracing::warn!(call_id = %self.call_id, "control plane error: {error}; passing stream through");
                    state = StreamState::Passthrough;
                    send_end = false;
                    chunk
                }
                Ok(None) => {
                    tracing::warn!(call_id = %self.call_id, "control plane connection lost; passing stream through");
                    state = StreamState::Passthrough;
                    send_end = false;
                    chunk
                }
                Err(ConnectionError::ReceiveTimeout) => {
                    tracing::warn!(call_id = %self.call_id, "control plane reply timed out; emitting original chunk");
                    chunk
                }
                Err(e) => {
                    tracing::warn!(call_id = %self.call_id, "control plane receive failed ({e}); passing stream through");
                    state = StreamState::Passthrough;
                    send_end = false;
                    chunk
                }
            };
            if tx.send(emit).await.is_err() {
                send_end = false;
                break 'ferry;
            }
        }

        if state != StreamState::Passthrough && !truncated && send_end {
            state = StreamState::Draining;
            self.drain(&tx).await;
        }
        state = StreamState::Closed;
        tracing::debug!(call_id = %self.call_id, state = ?state, "stream finished");
        self.cleanup().await;
    }

    /// Sends `END` and forwards any final synthetic chunks (the fail-closed
    /// path) until the control plane confirms the close.
    async fn drain(&self, tx: &mpsc::Sender<ChatCompletionChunk>) {
        if let Err(e) = self.channel.send(&ClientFrame::End).await {
            tracing::debug!(call_id = %self.call_id, "END send failed during drain: {e}");
            return;
        }
        loop {
            match self.channel.receive(self.chunk_timeout).await {
                Ok(Some(ServerFrame::Chunk { data })) => {
                    match ChatCompletionChunk::from_value(data) {
                        Ok(chunk) => {
                            if tx.send(chunk).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(call_id = %self.call_id, "malformed drain chunk dropped: {e}");
                        }
                    }
                }
                Ok(Some(ServerFrame::End)) | Ok(Some(ServerFrame::Error { .. })) | Ok(None) => {
                    return
                }
                Err(_) => return,
            }
        }
    }

    async fn cleanup(&self) {
        match &self.manager {
            Some(manager) => manager.close(&self.call_id).await,
            None => self.channel.close().await,
        }
    }
}
