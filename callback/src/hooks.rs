//! HTTP hook client: POSTs hook payloads to the control plane.
//!
//! Every failure mode here degrades to "no change": a broken control plane
//! must never take the proxy down with it.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;

/// Client for `POST /api/hooks/{hook_name}`.
pub struct HookClient {
    base_url: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl HookClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            timeout,
            http: reqwest::Client::new(),
        }
    }

    /// Posts `payload` (stamped with `post_time_ns`) to the named hook.
    ///
    /// Returns the control plane's JSON reply, or `None` on any transport or
    /// protocol failure; the caller treats `None` as "no change".
    pub async fn post(&self, hook: &str, payload: &Value) -> Option<Value> {
        let mut payload = payload.clone();
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("post_time_ns".to_string(), Value::from(now_ns()));
        }
        let url = format!("{}/api/hooks/{hook}", self.base_url.trim_end_matches('/'));
        let response = match self
            .http
            .post(&url)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                tracing::error!("timeout posting {hook} hook: {e}");
                return None;
            }
            Err(e) if e.is_connect() => {
                tracing::error!("network error posting {hook} hook: {e}");
                return None;
            }
            Err(e) => {
                tracing::error!("error posting {hook} hook: {e}");
                return None;
            }
        };

        let status = response.status();
        if status.is_server_error() {
            tracing::error!("control plane server error ({hook} hook): {status}");
            return None;
        }
        if !status.is_success() {
            tracing::error!("client error posting {hook} hook: {status}");
            return None;
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !content_type.contains("application/json") {
            tracing::error!("unexpected content-type from control plane for {hook} hook: {content_type}");
            return None;
        }
        let body = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                tracing::error!("failed reading {hook} hook response: {e}");
                return None;
            }
        };
        if body.is_empty() {
            tracing::error!("empty response from control plane for {hook} hook");
            return None;
        }
        match serde_json::from_slice(&body) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!("malformed JSON from control plane for {hook} hook: {e}");
                None
            }
        }
    }
}

/// Wall-clock nanoseconds; the sequence basis for conversation events.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}
