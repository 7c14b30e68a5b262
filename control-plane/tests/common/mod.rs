//! Shared helpers for control-plane integration tests: spawn a real listener,
//! speak the stream protocol with a real WebSocket client.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use config::{ControlPlaneSettings, PolicyRef};
use control_plane::AppState;
use wire::{ClientFrame, ServerFrame};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn settings(policy: PolicyRef) -> ControlPlaneSettings {
    ControlPlaneSettings {
        bind_addr: "127.0.0.1:0".to_string(),
        policy,
        sse_rate_limit_events: 100,
        sse_rate_limit_window: Duration::from_secs(60),
    }
}

/// Binds a random port and serves the app. Returns (addr, state).
pub async fn spawn_server(settings: ControlPlaneSettings) -> (String, Arc<AppState>) {
    let state = AppState::new(settings).expect("policy loads");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(control_plane::serve_on_listener(listener, state.clone()));
    (format!("127.0.0.1:{}", addr.port()), state)
}

pub async fn spawn_with_policy(policy: &str) -> (String, Arc<AppState>) {
    spawn_server(settings(PolicyRef::parse(policy).unwrap())).await
}

pub async fn ws_connect(addr: &str, call_id: &str) -> WsClient {
    let url = format!("ws://{addr}/api/streams/{call_id}");
    let (socket, _) = tokio_tungstenite::connect_async(&url).await.expect("ws connect");
    socket
}

pub async fn send_frame(socket: &mut WsClient, frame: &ClientFrame) {
    let json = serde_json::to_string(frame).unwrap();
    socket.send(Message::Text(json)).await.expect("ws send");
}

pub async fn recv_frame(socket: &mut WsClient) -> ServerFrame {
    let timeout = Duration::from_secs(10);
    loop {
        let message = tokio::time::timeout(timeout, socket.next())
            .await
            .expect("reply before timeout")
            .expect("socket open")
            .expect("read ok");
        match message {
            Message::Text(text) => return serde_json::from_str(&text).expect("valid frame"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected ws message: {other:?}"),
        }
    }
}

pub fn chunk_value(text: Option<&str>, finish: Option<&str>) -> Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion.chunk",
        "model": "gpt-4",
        "created": 1710000000u64,
        "choices": [{
            "index": 0,
            "delta": {"content": text},
            "finish_reason": finish,
        }],
    })
}

pub fn tool_chunk_value(id: &str, name: &str, arguments: &str, finish: Option<&str>) -> Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion.chunk",
        "model": "gpt-4",
        "created": 1710000000u64,
        "choices": [{
            "index": 0,
            "delta": {"tool_calls": [{
                "index": 0,
                "id": id,
                "type": "function",
                "function": {"name": name, "arguments": arguments},
            }]},
            "finish_reason": finish,
        }],
    })
}

/// Runs START + the given chunks + END, collecting every CHUNK reply until
/// the server's END.
pub async fn run_stream(
    socket: &mut WsClient,
    request_data: Value,
    chunks: Vec<Value>,
) -> Vec<Value> {
    send_frame(socket, &ClientFrame::Start { data: request_data }).await;
    let mut replies = Vec::new();
    for chunk in chunks {
        send_frame(socket, &ClientFrame::Chunk { data: chunk }).await;
        match recv_frame(socket).await {
            ServerFrame::Chunk { data } => replies.push(data),
            ServerFrame::End => return replies,
            ServerFrame::Error { error } => panic!("unexpected ERROR: {error}"),
        }
    }
    send_frame(socket, &ClientFrame::End).await;
    loop {
        match recv_frame(socket).await {
            ServerFrame::Chunk { data } => replies.push(data),
            ServerFrame::End => break,
            ServerFrame::Error { error } => panic!("unexpected ERROR: {error}"),
        }
    }
    replies
}

/// Lets the queues drain before reading stores or snapshots.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}
