//! Per-call WebSocket connection to the control plane.
//!
//! One [`StreamConnection`] exists per streaming call, keyed by `call_id` in
//! the [`StreamConnectionManager`]. The manager owns the map; the orchestrator
//! owns the connection for the duration of its stream and releases it through
//! [`StreamConnectionManager::close`] on every termination path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use wire::{ClientFrame, ServerFrame};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("websocket connect to {url} failed: {source}")]
    Connect {
        url: String,
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[error("websocket send failed: {0}")]
    Send(tokio_tungstenite::tungstenite::Error),
    #[error("frame serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("timed out waiting for control plane reply")]
    ReceiveTimeout,
}

/// One live channel between the orchestrator and the control plane.
pub struct StreamConnection {
    call_id: String,
    writer: tokio::sync::Mutex<WsSink>,
    reader: tokio::sync::Mutex<WsSource>,
    closed: AtomicBool,
}

impl StreamConnection {
    /// Opens the WebSocket for `call_id` and sends the initial `START` frame.
    pub async fn open(
        url: &str,
        call_id: &str,
        start_payload: Value,
    ) -> Result<Self, ConnectionError> {
        let (socket, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|source| ConnectionError::Connect {
                url: url.to_string(),
                source,
            })?;
        let (writer, reader) = socket.split();
        let connection = Self {
            call_id: call_id.to_string(),
            writer: tokio::sync::Mutex::new(writer),
            reader: tokio::sync::Mutex::new(reader),
            closed: AtomicBool::new(false),
        };
        connection
            .send(&ClientFrame::Start {
                data: start_payload,
            })
            .await?;
        Ok(connection)
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub async fn send(&self, frame: &ClientFrame) -> Result<(), ConnectionError> {
        let json = serde_json::to_string(frame)?;
        let mut writer = self.writer.lock().await;
        writer
            .send(Message::Text(json))
            .await
            .map_err(ConnectionError::Send)
    }

    /// Waits up to `timeout` for the next server frame.
    ///
    /// `Ok(None)` means the socket closed (abnormal disconnect included); the
    /// caller treats that as loss of the control plane. Elapsing the timeout
    /// is its own error so callers can fail open on just that chunk.
    pub async fn receive(&self, timeout: Duration) -> Result<Option<ServerFrame>, ConnectionError> {
        let mut reader = self.reader.lock().await;
        loop {
            let next = match tokio::time::timeout(timeout, reader.next()).await {
                Ok(n) => n,
                Err(_) => return Err(ConnectionError::ReceiveTimeout),
            };
            match next {
                Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                    Ok(frame) => return Ok(Some(frame)),
                    Err(e) => {
                        tracing::warn!(
                            call_id = %self.call_id,
                            "unparseable control plane frame ({e}); treating as closed"
                        );
                        return Ok(None);
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    self.closed.store(true, Ordering::SeqCst);
                    return Ok(None);
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::warn!(call_id = %self.call_id, "websocket read error: {e}");
                    self.closed.store(true, Ordering::SeqCst);
                    return Ok(None);
                }
            }
        }
    }

    /// Idempotent close.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.send(Message::Close(None)).await {
            tracing::debug!(call_id = %self.call_id, "websocket close failed: {e}");
        }
    }
}

/// Multiplexes at most one control-plane connection per call.
#[derive(Default)]
pub struct StreamConnectionManager {
    slots: Mutex<HashMap<String, Arc<StreamConnection>>>,
}

impl StreamConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing connection for `call_id`, or opens a new one and
    /// sends `START` with `start_payload`. Ownership of the slot is exclusive
    /// to the stream that created it.
    pub async fn get_or_create(
        &self,
        url: &str,
        call_id: &str,
        start_payload: Value,
    ) -> Result<Arc<StreamConnection>, ConnectionError> {
        if let Some(existing) = self.lookup(call_id) {
            return Ok(existing);
        }
        let connection = Arc::new(StreamConnection::open(url, call_id, start_payload).await?);
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(call_id.to_string(), connection.clone());
        Ok(connection)
    }

    pub fn lookup(&self, call_id: &str) -> Option<Arc<StreamConnection>> {
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(call_id)
            .cloned()
    }

    /// Idempotent teardown: closes the socket (if still open) and frees the
    /// slot so a later `lookup` returns `None`.
    pub async fn close(&self, call_id: &str) {
        let connection = self
            .slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(call_id);
        if let Some(connection) = connection {
            connection.close().await;
        }
    }
}
