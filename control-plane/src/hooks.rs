//! HTTP surface: the generic hook endpoint and the read/stream endpoints.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use crate::app::AppState;
use crate::bus::{activity_channel, conversation_channel};
use crate::conversation::utils::{extract_call_id, extract_trace_id, strip_post_time_ns};
use crate::conversation::{build_call_snapshots, CallIdInfo, ConversationSnapshot};
use crate::dispatch::{dispatch_hook, HookName};
use crate::result_pipeline::log_and_publish_hook_result;
use crate::sse::sse_response;

type HookError = (StatusCode, String);

/// Generic hook endpoint.
///
/// Dataflow: debug-log the original payload, invoke the policy, log/persist/
/// publish the result, return the replacement (or the payload unchanged).
pub async fn hook_generic(
    State(state): State<Arc<AppState>>,
    Path(hook_name): Path<String>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, HookError> {
    let call_id = extract_call_id(&payload);
    let trace_id = extract_trace_id(&payload);

    let mut stored = payload.clone();
    if let Some(obj) = stored.as_object_mut() {
        obj.insert(
            "post_time_ns".into(),
            Value::from(Utc::now().timestamp_nanos_opt().unwrap_or(0)),
        );
        if let Some(call_id) = &call_id {
            obj.insert("litellm_call_id".into(), Value::from(call_id.clone()));
        }
        if let Some(trace_id) = &trace_id {
            obj.insert("litellm_trace_id".into(), Value::from(trace_id.clone()));
        }
    }
    let debug_store = state.debug_logs.clone();
    let debug_type = format!("hook:{hook_name}");
    let record = stored.clone();
    state
        .debug_queue
        .submit(async move { debug_store.append(&debug_type, record).await });
    state.count_hook(&hook_name);

    let result = match HookName::parse(&hook_name) {
        Some(hook) => {
            let policy_payload = strip_post_time_ns(&payload);
            dispatch_hook(&*state.policy, hook, &policy_payload)
                .await
                .map_err(|e| {
                    tracing::error!("hook {hook_name} policy failure: {e}");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("hook {hook_name} failed: {e}"),
                    )
                })?
        }
        None => {
            tracing::debug!("hook {hook_name} has no policy operation; passing through");
            None
        }
    };

    let final_result = result.clone().unwrap_or_else(|| payload.clone());
    log_and_publish_hook_result(
        &state,
        &hook_name,
        call_id.as_deref(),
        trace_id.as_deref(),
        stored,
        Some(final_result.clone()),
    );
    Ok(Json(strip_post_time_ns(&final_result)))
}

pub async fn hook_counters(State(state): State<Arc<AppState>>) -> Json<HashMap<String, u64>> {
    let counters = state
        .counters
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone();
    Json(counters)
}

#[derive(Deserialize)]
pub struct RecentCallsQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn recent_call_ids(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentCallsQuery>,
) -> Result<Json<Vec<CallIdInfo>>, HookError> {
    let limit = query.limit.clamp(1, 500);
    let calls = state
        .conversations
        .recent_calls(limit)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))?;
    Ok(Json(calls))
}

#[derive(Deserialize)]
pub struct ConversationQuery {
    pub call_id: String,
}

pub async fn conversation_snapshot(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConversationQuery>,
) -> Result<Json<ConversationSnapshot>, HookError> {
    if query.call_id.len() < 4 {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            "call_id must be at least 4 characters".into(),
        ));
    }
    let events = state
        .conversations
        .load_events_for_call(&query.call_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))?;
    let calls = build_call_snapshots(&events);
    Ok(Json(ConversationSnapshot {
        call_id: query.call_id,
        trace_id: events.iter().find_map(|e| e.trace_id.clone()),
        events,
        calls,
    }))
}

/// Keys the window on the connection peer; a request header would let every
/// caller mint itself a fresh bucket.
fn enforce_sse_rate_limit(
    state: &AppState,
    client: SocketAddr,
    path: &str,
) -> Result<(), HookError> {
    let key = format!("{}:{path}", client.ip());
    if !state.limiter.try_acquire(&key) {
        return Err((
            StatusCode::TOO_MANY_REQUESTS,
            "Too many streaming requests, please slow down.".into(),
        ));
    }
    Ok(())
}

/// Live per-call conversation events over SSE.
pub async fn conversation_stream(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConversationQuery>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
) -> Result<Response, HookError> {
    enforce_sse_rate_limit(&state, client, "/api/hooks/conversation/stream")?;
    let rx = state.bus.subscribe(&conversation_channel(&query.call_id));
    Ok(sse_response(rx))
}

/// All control-plane activity over SSE.
pub async fn activity_stream(
    State(state): State<Arc<AppState>>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
) -> Result<Response, HookError> {
    enforce_sse_rate_limit(&state, client, "/api/activity/stream")?;
    let rx = state.bus.subscribe(&activity_channel());
    Ok(sse_response(rx))
}
