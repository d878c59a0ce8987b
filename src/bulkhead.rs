//! Bulkhead semaphore for max-concurrency admission control
//!
//! Each registered breaker is guarded by a bounded token pool. Callers wait
//! up to a configurable timeout for a token; waiting past the timeout fails
//! without consuming one. Queue transitions are reported to the breaker's
//! collector so exporters can track contention.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::clock::Clock;
use crate::collector::{EventType, MetricCollector};

/// A bounded token pool with timed acquisition.
///
/// The timeout race runs against the injected [`Clock`], not the tokio
/// timer, so waits stay deterministic under a virtual clock.
#[derive(Debug)]
pub struct BulkheadSemaphore {
    clock: Arc<dyn Clock>,
    permits: Semaphore,
    capacity: usize,
}

impl BulkheadSemaphore {
    /// Create a pool holding `capacity` tokens.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(clock: Arc<dyn Clock>, capacity: usize) -> Self {
        assert!(capacity > 0, "bulkhead capacity must be greater than zero");

        Self {
            clock,
            permits: Semaphore::new(capacity),
            capacity,
        }
    }

    /// Acquire a token, waiting up to `timeout`.
    ///
    /// A zero timeout attempts a non-blocking acquisition. Otherwise, an
    /// immediately available token is taken without emitting queue events;
    /// failing that, `SemaphoreQueued` is emitted, the pool is raced against
    /// the clock's timeout signal, and `SemaphoreDequeued` is emitted on
    /// either exit. Returns whether a token was acquired.
    pub async fn wait(&self, timeout: Duration, collector: &dyn MetricCollector) -> bool {
        if timeout.is_zero() {
            return match self.permits.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    true
                }
                Err(_) => false,
            };
        }

        if let Ok(permit) = self.permits.try_acquire() {
            permit.forget();
            return true;
        }

        collector.report_count(EventType::SemaphoreQueued);

        let deadline = self.clock.delay(timeout);
        let acquired = tokio::select! {
            permit = self.permits.acquire() => {
                permit.expect("token pool is never closed").forget();
                true
            }
            _ = deadline => false,
        };

        collector.report_count(EventType::SemaphoreDequeued);
        acquired
    }

    /// Return exactly one token to the pool.
    ///
    /// Signalling a full pool is a programmer error: tokens must be returned
    /// only for successful waits.
    pub fn signal(&self) {
        debug_assert!(
            self.permits.available_permits() < self.capacity,
            "signal without a matching wait"
        );
        self.permits.add_permits(1);
    }

    /// Number of tokens the pool holds when idle.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tokens currently available.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::testing::RecordingCollector;
    use crate::clock::VirtualClock;

    #[tokio::test]
    async fn test_wait_and_signal_cycle() {
        let clock = Arc::new(VirtualClock::new());
        let collector = RecordingCollector::new();
        let semaphore = BulkheadSemaphore::new(clock, 3);

        for _ in 0..3 {
            assert!(semaphore.wait(Duration::from_secs(1), collector.as_ref()).await);
        }
        assert_eq!(semaphore.available(), 0);

        // Immediate acquisitions emit no queue events.
        assert!(collector.counts().is_empty());

        assert!(!semaphore.wait(Duration::ZERO, collector.as_ref()).await);

        semaphore.signal();
        assert!(semaphore.wait(Duration::ZERO, collector.as_ref()).await);
        assert!(!semaphore.wait(Duration::ZERO, collector.as_ref()).await);
    }

    #[tokio::test]
    async fn test_wait_timeout_emits_queue_events() {
        let clock = Arc::new(VirtualClock::new());
        let collector = RecordingCollector::new();
        let semaphore = Arc::new(BulkheadSemaphore::new(clock.clone(), 1));

        assert!(semaphore.wait(Duration::from_secs(1), collector.as_ref()).await);

        let waiter = tokio::spawn({
            let semaphore = semaphore.clone();
            let collector = collector.clone();
            async move {
                semaphore
                    .wait(Duration::from_secs(60), collector.as_ref())
                    .await
            }
        });

        clock.blocking_advance(Duration::from_secs(60)).await;

        assert!(!waiter.await.unwrap());
        assert_eq!(
            collector.counts(),
            vec![EventType::SemaphoreQueued, EventType::SemaphoreDequeued]
        );
    }

    #[tokio::test]
    async fn test_queued_waiter_gets_released_token() {
        let clock = Arc::new(VirtualClock::new());
        let collector = RecordingCollector::new();
        let semaphore = Arc::new(BulkheadSemaphore::new(clock.clone(), 1));

        assert!(semaphore.wait(Duration::ZERO, collector.as_ref()).await);

        let waiter = tokio::spawn({
            let semaphore = semaphore.clone();
            let collector = collector.clone();
            async move {
                semaphore
                    .wait(Duration::from_secs(60), collector.as_ref())
                    .await
            }
        });

        // Let the waiter reach its timer before releasing.
        clock.blocking_advance(Duration::ZERO).await;
        semaphore.signal();

        assert!(waiter.await.unwrap());
        assert_eq!(
            collector.counts(),
            vec![EventType::SemaphoreQueued, EventType::SemaphoreDequeued]
        );
    }

    #[test]
    #[should_panic(expected = "bulkhead capacity must be greater than zero")]
    fn test_zero_capacity_panics() {
        BulkheadSemaphore::new(Arc::new(VirtualClock::new()), 0);
    }
}
