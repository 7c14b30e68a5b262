//! Per-key sliding-window rate limiter for the SSE endpoints.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Allows `max_events` per `window` per key. `try_acquire` never blocks.
pub struct RateLimiter {
    max_events: usize,
    window: Duration,
    buckets: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_events: usize, window: Duration) -> Self {
        Self {
            max_events: max_events.max(1),
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Records an event for `key`; returns false when the window is full.
    pub fn try_acquire(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let timestamps = buckets.entry(key.to_string()).or_default();
        while timestamps
            .front()
            .is_some_and(|&t| now.duration_since(t) >= self.window)
        {
            timestamps.pop_front();
        }
        if timestamps.len() >= self.max_events {
            return false;
        }
        timestamps.push_back(now);
        true
    }

    /// Resets all buckets (test utility).
    pub fn clear(&self) {
        self.buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enforces_window_limit_per_key() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.try_acquire("a"));
        assert!(limiter.try_acquire("a"));
        assert!(!limiter.try_acquire("a"));
        // distinct keys get distinct budgets
        assert!(limiter.try_acquire("b"));
    }

    #[test]
    fn window_expiry_frees_slots() {
        let limiter = RateLimiter::new(1, Duration::from_millis(20));
        assert!(limiter.try_acquire("a"));
        assert!(!limiter.try_acquire("a"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.try_acquire("a"));
    }

    #[test]
    fn clear_resets_budgets() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.try_acquire("a"));
        limiter.clear();
        assert!(limiter.try_acquire("a"));
    }
}
