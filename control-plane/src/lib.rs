//! Control plane: receives hook traffic from the gateway callback, drives the
//! configured policy, and records/publishes what happened.
//!
//! Surfaces:
//! - `POST /api/hooks/{hook_name}`: non-streaming hook dispatch ([`hooks`]).
//! - `GET /api/streams/{call_id}`: per-call streaming WebSocket ([`streams`]).
//! - Read side: recent calls, conversation snapshots, per-call and global SSE.
//!
//! Side effects (debug logs, conversation events, pub/sub) run through
//! sequential task queues so the hot path only enqueues. Storage and pub/sub
//! are trait seams ([`store`], [`bus`]) with in-memory defaults.

pub mod activity;
pub mod app;
pub mod bus;
pub mod conversation;
pub mod dispatch;
pub mod hooks;
pub mod policy;
pub mod queue;
pub mod rate_limiter;
pub mod result_pipeline;
pub mod sse;
pub mod store;
pub mod streams;

pub use app::{router, serve_on_listener, AppState};
