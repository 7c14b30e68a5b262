//! Sequential task queue: FIFO side-effects off the hot hook path.

use futures::future::BoxFuture;
use tokio::sync::mpsc;

/// Runs submitted futures one at a time, in submission order.
///
/// Submission never blocks. A failing task is logged and swallowed; the
/// worker keeps draining.
pub struct SequentialTaskQueue {
    name: &'static str,
    tx: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
}

impl SequentialTaskQueue {
    /// Creates the queue and spawns its single worker task.
    pub fn new(name: &'static str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                task.await;
            }
        });
        Self { name, tx }
    }

    /// Enqueues `task` to run after everything previously submitted.
    pub fn submit<F>(&self, task: F)
    where
        F: std::future::Future<Output = Result<(), String>> + Send + 'static,
    {
        let name = self.name;
        let wrapped: BoxFuture<'static, ()> = Box::pin(async move {
            if let Err(e) = task.await {
                tracing::error!("task queue[{name}] task failed: {e}");
            }
        });
        if self.tx.send(wrapped).is_err() {
            tracing::error!("task queue[{name}] worker gone; dropping task");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[tokio::test]
    async fn tasks_run_in_submission_order() {
        let queue = SequentialTaskQueue::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let seen = seen.clone();
            queue.submit(async move {
                // later tasks sleep less: order must still hold
                tokio::time::sleep(Duration::from_millis(20 - i * 4)).await;
                seen.lock().unwrap().push(i);
                Ok(())
            });
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn failure_does_not_stop_the_worker() {
        let queue = SequentialTaskQueue::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        queue.submit(async move { Err("boom".to_string()) });
        let seen2 = seen.clone();
        queue.submit(async move {
            seen2.lock().unwrap().push("after");
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["after"]);
    }
}
