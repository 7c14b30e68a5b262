//! Full loop: the gateway-side orchestrator talking to a real control plane.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use futures_util::StreamExt;
use serde_json::json;

use callback::{StreamConnectionManager, StreamOrchestrator};
use wire::ChatCompletionChunk;

fn chunk(text: Option<&str>, finish: Option<&str>) -> ChatCompletionChunk {
    ChatCompletionChunk::from_value(chunk_value(text, finish)).unwrap()
}

#[tokio::test]
async fn orchestrator_applies_control_plane_rewrites_end_to_end() {
    let (addr, _state) = spawn_with_policy("all_caps").await;
    let call_id = "call-loop-1";

    let manager = Arc::new(StreamConnectionManager::new());
    let connection = manager
        .get_or_create(
            &format!("ws://{addr}/api/streams/{call_id}"),
            call_id,
            json!({"model": "gpt-4", "litellm_call_id": call_id}),
        )
        .await
        .expect("control plane reachable");

    let orchestrator = StreamOrchestrator::new(
        call_id,
        connection,
        Some(manager.clone()),
        Duration::from_secs(5),
        Duration::from_secs(30),
    );
    let upstream = tokio_stream::iter(vec![
        chunk(Some("ab"), None),
        chunk(Some("cd"), None),
        chunk(None, Some("stop")),
    ]);
    let out: Vec<ChatCompletionChunk> = orchestrator.run(upstream).collect().await;

    let texts: Vec<Option<&str>> = out.iter().map(|c| c.delta_text()).collect();
    assert_eq!(texts, vec![Some("AB"), Some("CD"), None]);
    assert_eq!(out[2].finish_reason(), Some("stop"));

    // orchestrator cleanup freed the slot
    settle().await;
    assert!(manager.lookup(call_id).is_none());
}

#[tokio::test]
async fn whole_stream_passes_through_when_control_plane_is_unreachable() {
    let manager = Arc::new(StreamConnectionManager::new());
    let result = manager
        .get_or_create(
            "ws://127.0.0.1:9/api/streams/call-x",
            "call-x",
            json!({}),
        )
        .await;
    assert!(result.is_err());
    assert!(manager.lookup("call-x").is_none());
}
