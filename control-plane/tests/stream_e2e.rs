//! End-to-end streaming tests over a real listener and WebSocket client.

mod common;

use common::*;
use serde_json::json;
use wire::{ClientFrame, ServerFrame};

fn request_data(call_id: &str) -> serde_json::Value {
    json!({
        "model": "gpt-4",
        "litellm_call_id": call_id,
        "messages": [{"role": "user", "content": "hi"}],
        "stream": true,
    })
}

#[tokio::test]
async fn noop_policy_yields_identical_stream() {
    let (addr, _state) = spawn_with_policy("noop").await;
    let mut socket = ws_connect(&addr, "call-noop-1").await;

    let chunks = vec![
        chunk_value(Some("ab"), None),
        chunk_value(Some("cd"), None),
        chunk_value(None, Some("stop")),
    ];
    let replies = run_stream(&mut socket, request_data("call-noop-1"), chunks.clone()).await;

    assert_eq!(replies.len(), 3);
    for (reply, original) in replies.iter().zip(&chunks) {
        assert_eq!(
            reply["choices"][0]["delta"]["content"],
            original["choices"][0]["delta"]["content"]
        );
        assert_eq!(
            reply["choices"][0]["finish_reason"],
            original["choices"][0]["finish_reason"]
        );
    }
}

#[tokio::test]
async fn all_caps_policy_rewrites_content_chunks() {
    let (addr, _state) = spawn_with_policy("all_caps").await;
    let mut socket = ws_connect(&addr, "call-caps-1").await;

    let replies = run_stream(
        &mut socket,
        request_data("call-caps-1"),
        vec![
            chunk_value(Some("ab"), None),
            chunk_value(Some("cd"), None),
            chunk_value(None, Some("stop")),
        ],
    )
    .await;

    assert_eq!(replies[0]["choices"][0]["delta"]["content"], "AB");
    assert_eq!(replies[1]["choices"][0]["delta"]["content"], "CD");
    assert_eq!(replies[2]["choices"][0]["finish_reason"], "stop");

    // snapshot: original and final responses diverge
    settle().await;
    let snapshot: serde_json::Value = reqwest::get(format!(
        "http://{addr}/api/hooks/conversation?call_id=call-caps-1"
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
    let call = &snapshot["calls"][0];
    assert_eq!(call["original_response"], "abcd");
    assert_eq!(call["final_response"], "ABCD");
    assert_eq!(call["status"], "stream_summary");
}

async fn spawn_fake_judge(block_marker: &'static str) -> String {
    use axum::routing::post;
    use axum::{Json, Router};

    async fn handler(
        axum::extract::State(marker): axum::extract::State<&'static str>,
        Json(body): Json<serde_json::Value>,
    ) -> Json<serde_json::Value> {
        let prompt = body["messages"][1]["content"].as_str().unwrap_or_default();
        let probability = if prompt.contains(marker) { 0.95 } else { 0.01 };
        let verdict = format!(
            "{{\"probability\": {probability}, \"explanation\": \"scripted verdict\"}}"
        );
        Json(json!({"choices": [{"message": {"role": "assistant", "content": verdict}}]}))
    }

    let app = Router::new()
        .route("/v1/chat/completions", post(handler))
        .with_state(block_marker);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://127.0.0.1:{}/v1", addr.port())
}

#[tokio::test]
async fn judge_blocks_harmful_tool_call_stream() {
    let api_base = spawn_fake_judge("DROP TABLE").await;
    let policy = config::PolicyRef {
        name: "tool_call_judge".to_string(),
        options: json!({"api_base": api_base}),
    };
    let (addr, _state) = spawn_server(settings(policy)).await;
    let mut socket = ws_connect(&addr, "call-judge-1").await;

    // single terminal chunk carrying the whole tool call
    let replies = run_stream(
        &mut socket,
        request_data("call-judge-1"),
        vec![tool_chunk_value(
            "call_1",
            "execute_sql",
            "{\"query\": \"DROP TABLE users\"}",
            Some("tool_calls"),
        )],
    )
    .await;

    assert_eq!(replies.len(), 1);
    let content = replies[0]["choices"][0]["delta"]["content"]
        .as_str()
        .unwrap();
    assert!(content.starts_with("\u{26d4} BLOCKED"));
    assert_eq!(replies[0]["choices"][0]["finish_reason"], "stop");
    // no tool-call content reaches the client
    assert!(replies[0]["choices"][0]["delta"]["tool_calls"].is_null());
}

#[tokio::test]
async fn judge_releases_benign_tool_call_merged() {
    let api_base = spawn_fake_judge("DROP TABLE").await;
    let policy = config::PolicyRef {
        name: "tool_call_judge".to_string(),
        options: json!({"api_base": api_base}),
    };
    let (addr, _state) = spawn_server(settings(policy)).await;
    let mut socket = ws_connect(&addr, "call-judge-2").await;

    let replies = run_stream(
        &mut socket,
        request_data("call-judge-2"),
        vec![
            tool_chunk_value("call_1", "get_weather", "{\"city\":", None),
            tool_chunk_value("", "", " \"Paris\"}", Some("tool_calls")),
        ],
    )
    .await;

    // first reply is a keep-alive while the call buffers; the second carries
    // the merged tool call
    assert_eq!(replies.len(), 2);
    assert!(replies[0]["choices"][0]["delta"]["tool_calls"].is_null());
    let merged = &replies[1]["choices"][0];
    assert_eq!(merged["finish_reason"], "tool_calls");
    assert_eq!(
        merged["delta"]["tool_calls"][0]["function"]["arguments"],
        "{\"city\": \"Paris\"}"
    );
}

#[tokio::test]
async fn incomplete_tool_call_fails_closed() {
    let (addr, _state) = spawn_with_policy("noop").await;
    let mut socket = ws_connect(&addr, "call-trunc-1").await;

    send_frame(
        &mut socket,
        &ClientFrame::Start {
            data: request_data("call-trunc-1"),
        },
    )
    .await;
    send_frame(
        &mut socket,
        &ClientFrame::Chunk {
            data: tool_chunk_value("call_1", "run", "{\"cmd\": \"rm -rf", None),
        },
    )
    .await;
    let _ = recv_frame(&mut socket).await;
    send_frame(&mut socket, &ClientFrame::End).await;

    let mut synthetic = Vec::new();
    loop {
        match recv_frame(&mut socket).await {
            ServerFrame::Chunk { data } => synthetic.push(data),
            ServerFrame::End => break,
            ServerFrame::Error { error } => panic!("unexpected ERROR: {error}"),
        }
    }
    assert_eq!(synthetic.len(), 1);
    let content = synthetic[0]["choices"][0]["delta"]["content"].as_str().unwrap();
    assert!(content.contains("incomplete tool call"));

    settle().await;
    let snapshot: serde_json::Value = reqwest::get(format!(
        "http://{addr}/api/hooks/conversation?call_id=call-trunc-1"
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
    assert_eq!(snapshot["calls"][0]["status"], "failure");
}

#[tokio::test]
async fn second_socket_for_live_call_is_refused() {
    let (addr, _state) = spawn_with_policy("noop").await;
    let mut first = ws_connect(&addr, "call-dup-1").await;
    send_frame(
        &mut first,
        &ClientFrame::Start {
            data: request_data("call-dup-1"),
        },
    )
    .await;

    let mut second = ws_connect(&addr, "call-dup-1").await;
    match recv_frame(&mut second).await {
        ServerFrame::Error { error } => assert!(error.contains("already active")),
        other => panic!("expected ERROR, got {other:?}"),
    }
}

#[tokio::test]
async fn client_disconnect_frees_the_slot() {
    let (addr, state) = spawn_with_policy("noop").await;
    let mut socket = ws_connect(&addr, "call-gone-1").await;
    send_frame(
        &mut socket,
        &ClientFrame::Start {
            data: request_data("call-gone-1"),
        },
    )
    .await;
    send_frame(
        &mut socket,
        &ClientFrame::Chunk {
            data: chunk_value(Some("ab"), None),
        },
    )
    .await;
    let _ = recv_frame(&mut socket).await;
    drop(socket);

    settle().await;
    // slot is free again: a fresh claim succeeds
    assert!(state.claim_stream("call-gone-1"));
    state.release_stream("call-gone-1");

    // no success event was recorded for the severed stream
    settle().await;
    let snapshot: serde_json::Value = reqwest::get(format!(
        "http://{addr}/api/hooks/conversation?call_id=call-gone-1"
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
    assert_ne!(snapshot["calls"][0]["status"], "success");
}
