//! Axum app: shared state, router, and server entry.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use axum::routing::{get, post};
use axum::Router;

use config::ControlPlaneSettings;

use crate::bus::{EventBus, MemoryBus};
use crate::conversation::StreamIndexStore;
use crate::policy::{load_policy, Policy, PolicyServices};
use crate::queue::SequentialTaskQueue;
use crate::rate_limiter::RateLimiter;
use crate::store::{ConversationStore, DebugLogStore, MemoryStore};

/// Everything the handlers share. Explicit state, no process globals.
pub struct AppState {
    pub settings: ControlPlaneSettings,
    pub policy: Arc<dyn Policy>,
    pub conversations: Arc<dyn ConversationStore>,
    pub debug_logs: Arc<dyn DebugLogStore>,
    pub bus: Arc<dyn EventBus>,
    pub debug_queue: SequentialTaskQueue,
    pub event_queue: SequentialTaskQueue,
    pub stream_indices: StreamIndexStore,
    pub limiter: RateLimiter,
    /// Per-hook invocation counters (sanity endpoints and tests).
    pub counters: Mutex<HashMap<String, u64>>,
    /// Call ids with a live stream socket; at most one socket per call.
    pub active_streams: Mutex<HashSet<String>>,
}

impl AppState {
    /// Builds state with the in-memory store/bus and the configured policy.
    pub fn new(settings: ControlPlaneSettings) -> Result<Arc<Self>, crate::policy::loader::PolicyLoadError> {
        let store = Arc::new(MemoryStore::new());
        let policy = load_policy(
            &settings.policy,
            &PolicyServices {
                debug: store.clone(),
            },
        )?;
        Ok(Self::with_parts(settings, policy, store.clone(), store, Arc::new(MemoryBus::new())))
    }

    pub fn with_parts(
        settings: ControlPlaneSettings,
        policy: Arc<dyn Policy>,
        conversations: Arc<dyn ConversationStore>,
        debug_logs: Arc<dyn DebugLogStore>,
        bus: Arc<dyn EventBus>,
    ) -> Arc<Self> {
        let limiter = RateLimiter::new(
            settings.sse_rate_limit_events,
            settings.sse_rate_limit_window,
        );
        Arc::new(Self {
            settings,
            policy,
            conversations,
            debug_logs,
            bus,
            debug_queue: SequentialTaskQueue::new("debug_logs"),
            event_queue: SequentialTaskQueue::new("conversation_events"),
            stream_indices: StreamIndexStore::new(),
            limiter,
            counters: Mutex::new(HashMap::new()),
            active_streams: Mutex::new(HashSet::new()),
        })
    }

    pub fn count_hook(&self, hook: &str) {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *counters.entry(hook.to_ascii_lowercase()).or_insert(0) += 1;
    }

    /// Claims the stream slot for `call_id`; false when already active.
    pub fn claim_stream(&self, call_id: &str) -> bool {
        self.active_streams
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(call_id.to_string())
    }

    pub fn release_stream(&self, call_id: &str) {
        self.active_streams
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(call_id);
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/hooks/counters", get(crate::hooks::hook_counters))
        .route("/api/hooks/recent_call_ids", get(crate::hooks::recent_call_ids))
        .route("/api/hooks/conversation", get(crate::hooks::conversation_snapshot))
        .route(
            "/api/hooks/conversation/stream",
            get(crate::hooks::conversation_stream),
        )
        .route("/api/activity/stream", get(crate::hooks::activity_stream))
        .route("/api/hooks/:hook_name", post(crate::hooks::hook_generic))
        .route("/api/streams/:call_id", get(crate::streams::ws_handler))
        .with_state(state)
}

/// Serves the app on an already-bound listener (tests bind port 0).
///
/// Connect info is attached so the SSE rate limiter can key on the peer
/// address.
pub async fn serve_on_listener(
    listener: tokio::net::TcpListener,
    state: Arc<AppState>,
) -> Result<(), std::io::Error> {
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
}
