//! Tracking of spawned background tasks.
//!
//! Shutdown must not close the transport or the store while a gossip round
//! is still in flight, so every background task the node spawns goes through
//! a [`RoutineTracker`] and [`wait`](RoutineTracker::wait) blocks until all
//! of them have returned.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Counts live tracked tasks; a waiter is woken when the count hits zero.
#[derive(Clone, Default)]
pub struct RoutineTracker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    active: AtomicUsize,
    idle: Notify,
}

impl RoutineTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `future` as a tracked tokio task.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let output = future.await;
            if inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.idle.notify_waiters();
            }
            output
        })
    }

    /// Number of tracked tasks still running.
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Waits until every tracked task has returned. Returns immediately if
    /// none are running.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register interest before re-checking the counter, otherwise a
            // task finishing in between would notify nobody.
            notified.as_mut().enable();
            if self.inner.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn wait_returns_immediately_when_idle() {
        let tracker = RoutineTracker::new();
        tracker.wait().await;
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test]
    async fn wait_blocks_until_tasks_finish() {
        let tracker = RoutineTracker::new();
        for _ in 0..4 {
            tracker.spawn(async {
                sleep(Duration::from_millis(20)).await;
            });
        }
        assert!(tracker.active() > 0);
        tracker.wait().await;
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test]
    async fn tasks_spawned_while_waiting_are_awaited() {
        let tracker = RoutineTracker::new();
        let inner = tracker.clone();
        tracker.spawn(async move {
            sleep(Duration::from_millis(10)).await;
            inner.spawn(async {
                sleep(Duration::from_millis(20)).await;
            });
        });
        tracker.wait().await;
        assert_eq!(tracker.active(), 0);
    }
}
