//! Pub/sub seam: per-call, per-trace, and global activity channels.
//!
//! The transport is an external collaborator; in-process fan-out is the
//! default implementation and powers the SSE endpoints directly. A
//! Redis-backed bus implements the same trait without touching the core.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

pub fn conversation_channel(call_id: &str) -> String {
    format!("sluice:conversation:{call_id}")
}

pub fn conversation_trace_channel(trace_id: &str) -> String {
    format!("sluice:conversation-trace:{trace_id}")
}

pub fn activity_channel() -> String {
    "sluice:activity".to_string()
}

/// Fire-and-forget fan-out of serialized events.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), String>;
    /// Subscribes to a channel; the receiver sees messages published after
    /// this call.
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String>;
}

/// In-process bus: one broadcast channel per name, created on first use.
#[derive(Default)]
pub struct MemoryBus {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), String> {
        // send only fails with zero receivers, which is not an error here
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.sender(channel).subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_later_publishes() {
        let bus = MemoryBus::new();
        let mut rx = bus.subscribe("sluice:conversation:call-1");
        bus.publish("sluice:conversation:call-1", "hello".into())
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let bus = MemoryBus::new();
        let mut rx = bus.subscribe("a");
        bus.publish("b", "for-b".into()).await.unwrap();
        bus.publish("a", "for-a".into()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "for-a");
    }

    #[test]
    fn channel_names() {
        assert_eq!(conversation_channel("c1"), "sluice:conversation:c1");
        assert_eq!(conversation_trace_channel("t1"), "sluice:conversation-trace:t1");
        assert_eq!(activity_channel(), "sluice:activity");
    }
}
