//! Completion tracking for streaming producers.
//!
//! A pipe enqueues an unknown total number of messages while workers
//! concurrently retire them, so a plain counter can hit zero between
//! batches. [`Completion`] models this as an atomic outstanding count
//! plus a producer-finished flag: the waiter is released only when the
//! producer has finished *and* every enqueued item has been retired, so
//! the cleanup handler runs exactly once and never prematurely.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct Completion {
    outstanding: AtomicU64,
    producer_done: AtomicBool,
    notify: Notify,
}

impl Completion {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one enqueued item. Must happen before the item becomes
    /// visible to consumers.
    pub fn add_work(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    /// Retire one item: delivered, failed, or discarded — every dequeue
    /// outcome counts exactly once.
    pub fn complete_one(&self) {
        let previous = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "completion count underflow");

        if previous == 1 && self.producer_done.load(Ordering::Acquire) {
            self.notify.notify_waiters();
        }
    }

    /// Mark the producing side finished: no further `add_work` calls will
    /// follow.
    pub fn finish_producing(&self) {
        self.producer_done.store(true, Ordering::Release);

        if self.outstanding.load(Ordering::Acquire) == 0 {
            self.notify.notify_waiters();
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.producer_done.load(Ordering::Acquire)
            && self.outstanding.load(Ordering::Acquire) == 0
    }

    /// Wait until the producer has finished and all work is retired.
    pub async fn wait(&self) {
        loop {
            // Register interest before re-checking to avoid a lost wakeup
            // between the check and the await.
            let notified = self.notify.notified();
            if self.is_complete() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    #[tokio::test]
    async fn completes_immediately_with_no_work() {
        let completion = Completion::new();
        completion.finish_producing();
        completion.wait().await;
        assert!(completion.is_complete());
    }

    #[tokio::test]
    async fn waits_for_outstanding_work() {
        let completion = Arc::new(Completion::new());
        completion.add_work();
        completion.add_work();
        completion.finish_producing();
        assert!(!completion.is_complete());

        let waiter = tokio::spawn({
            let completion = Arc::clone(&completion);
            async move { completion.wait().await }
        });

        completion.complete_one();
        assert!(!completion.is_complete());
        completion.complete_one();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn does_not_release_before_producer_finishes() {
        let completion = Arc::new(Completion::new());
        completion.add_work();
        completion.complete_one();

        // All work retired, but the producer is still batching.
        assert!(!completion.is_complete());

        completion.finish_producing();
        completion.wait().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_retirements_release_once() {
        let completion = Arc::new(Completion::new());
        for _ in 0..100 {
            completion.add_work();
        }
        completion.finish_producing();

        let mut handles = Vec::new();
        for _ in 0..100 {
            let completion = Arc::clone(&completion);
            handles.push(tokio::spawn(async move { completion.complete_one() }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(1), completion.wait())
            .await
            .unwrap();
        assert!(completion.is_complete());
    }
}
