//! Named registry multiplexing breakers behind semaphores
//!
//! The registry owns one wrapped breaker per name, each guarded by a
//! bulkhead semaphore sized to the breaker's max concurrency. A registry
//! call reports the full event sequence to the breaker's collector:
//! `Attempt`, the optional semaphore queue pair, `SemaphoreAcquired`, the
//! inner breaker events, `SemaphoreReleased`, `Success` or `Failure`, the
//! optional fallback outcome, and finally `TotalDuration`.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::builder::CircuitBuilder;
use crate::bulkhead::BulkheadSemaphore;
use crate::circuit::CircuitBreaker;
use crate::clock::{Clock, SystemClock};
use crate::collector::{EventType, MetricCollector};
use crate::errors::BreakerError;

/// Fallback invoked with the call error; its result replaces the outcome.
pub type FallbackFn<T, E> = Box<dyn FnOnce(&BreakerError<E>) -> Result<T, E> + Send>;

/// Per-call options for registry invocations.
pub struct CallOptions<T, E> {
    fallback: Option<FallbackFn<T, E>>,
}

impl<T, E> CallOptions<T, E> {
    /// Options with no fallback.
    pub fn new() -> Self {
        Self { fallback: None }
    }

    /// Recover from call errors with `fallback`. It sees every error the
    /// call can produce, including `CircuitOpen` and `MaxConcurrency`.
    pub fn with_fallback<F>(mut self, fallback: F) -> Self
    where
        F: FnOnce(&BreakerError<E>) -> Result<T, E> + Send + 'static,
    {
        self.fallback = Some(Box::new(fallback));
        self
    }
}

impl<T, E> Default for CallOptions<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

/// A name-to-breaker registry.
///
/// Cloning is cheap and shares the underlying map.
#[derive(Debug, Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug)]
struct RegistryInner {
    clock: Arc<dyn Clock>,
    breakers: RwLock<HashMap<String, Arc<WrappedBreaker>>>,
}

#[derive(Debug)]
struct WrappedBreaker {
    breaker: CircuitBreaker,
    semaphore: BulkheadSemaphore,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Registry whose semaphores wait against the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                clock,
                breakers: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a breaker under `name`. The configuration cannot change
    /// afterwards; registering the same name twice fails.
    pub fn configure<F>(&self, name: impl Into<String>, configure: F) -> Result<(), BreakerError>
    where
        F: FnOnce(CircuitBuilder) -> CircuitBuilder,
    {
        let name = name.into();
        let mut breakers = self.inner.breakers.write().unwrap();

        if breakers.contains_key(&name) {
            return Err(BreakerError::AlreadyConfigured);
        }

        let breaker = configure(CircuitBuilder::new()).build();
        let semaphore =
            BulkheadSemaphore::new(self.inner.clock.clone(), breaker.core.max_concurrency);

        tracing::debug!(name = %name, "configured circuit breaker");
        breakers.insert(name, Arc::new(WrappedBreaker { breaker, semaphore }));
        Ok(())
    }

    /// Invoke `f` through the breaker configured under `name`.
    ///
    /// When the outcome is an error and a fallback was supplied, the
    /// fallback's result replaces it.
    pub async fn call<F, Fut, T, E>(
        &self,
        name: &str,
        f: F,
        options: CallOptions<T, E>,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Any + Send,
    {
        let Some(wrapped) = self.lookup(name) else {
            return Err(BreakerError::Unconfigured);
        };

        let collector = wrapped.breaker.core.collector.clone();
        let started = Instant::now();
        let result = call_wrapped(&wrapped, f, options).await;
        collector.report_duration(EventType::TotalDuration, started.elapsed());
        result
    }

    /// The channel form of [`call`](Self::call): the receiver gets exactly
    /// one result and then closes.
    pub fn call_async<F, Fut, T, E>(
        &self,
        name: &str,
        f: F,
        options: CallOptions<T, E>,
    ) -> oneshot::Receiver<Result<T, BreakerError<E>>>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Any + Send,
    {
        let registry = self.clone();
        let name = name.to_string();
        let (sender, receiver) = oneshot::channel();

        tokio::spawn(async move {
            let _ = sender.send(registry.call(&name, f, options).await);
        });

        receiver
    }

    fn lookup(&self, name: &str) -> Option<Arc<WrappedBreaker>> {
        self.inner.breakers.read().unwrap().get(name).cloned()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

async fn call_wrapped<F, Fut, T, E>(
    wrapped: &WrappedBreaker,
    f: F,
    options: CallOptions<T, E>,
) -> Result<T, BreakerError<E>>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Any + Send,
{
    let collector = wrapped.breaker.core.collector.clone();
    collector.report_count(EventType::Attempt);

    let error = match call_with_semaphore(wrapped, f).await {
        Ok(value) => {
            collector.report_count(EventType::Success);
            return Ok(value);
        }
        Err(error) => {
            collector.report_count(EventType::Failure);
            error
        }
    };

    let Some(fallback) = options.fallback else {
        return Err(error);
    };

    match fallback(&error) {
        Ok(value) => {
            collector.report_count(EventType::FallbackSuccess);
            Ok(value)
        }
        Err(inner) => {
            collector.report_count(EventType::FallbackFailure);
            Err(BreakerError::Operation(inner))
        }
    }
}

async fn call_with_semaphore<F, Fut, T, E>(
    wrapped: &WrappedBreaker,
    f: F,
) -> Result<T, BreakerError<E>>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Any + Send,
{
    let breaker = &wrapped.breaker;
    let collector = breaker.core.collector.clone();

    if !wrapped
        .semaphore
        .wait(breaker.core.max_concurrency_timeout, collector.as_ref())
        .await
    {
        collector.report_count(EventType::Rejection);
        return Err(BreakerError::MaxConcurrency);
    }

    // Scoped release: the token goes back on every exit path, panics
    // included.
    let _release = SemaphoreRelease {
        semaphore: &wrapped.semaphore,
        collector: collector.as_ref(),
    };

    collector.report_count(EventType::SemaphoreAcquired);
    breaker.call_protected(f).await
}

struct SemaphoreRelease<'a> {
    semaphore: &'a BulkheadSemaphore,
    collector: &'a dyn MetricCollector,
}

impl Drop for SemaphoreRelease<'_> {
    fn drop(&mut self) {
        self.collector.report_count(EventType::SemaphoreReleased);
        self.semaphore.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ConstantBackoff;
    use crate::clock::VirtualClock;
    use crate::collector::testing::RecordingCollector;
    use crate::trip::ConsecutiveFailureTripCondition;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{mpsc, watch};

    #[derive(Debug, PartialEq)]
    struct TestError;

    fn test_config(builder: CircuitBuilder) -> CircuitBuilder {
        builder
            .invocation_timeout(Duration::from_secs(60))
            .half_closed_retry_probability(1.0)
            .reset_backoff(ConstantBackoff::new(Duration::from_secs(15)))
            .trip_condition(ConsecutiveFailureTripCondition::new(5))
    }

    #[tokio::test]
    async fn test_successful_call() {
        let registry = Registry::new();
        registry.configure("test", |b| b).unwrap();

        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();

        let result = registry
            .call(
                "test",
                move |_cancel| async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok::<(), TestError>(())
                },
                CallOptions::new(),
            )
            .await;

        assert!(result.is_ok());
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_error_call() {
        let registry = Registry::new();
        registry.configure("test", |b| b).unwrap();

        let result = registry
            .call(
                "test",
                |_cancel| async { Err::<(), _>(TestError) },
                CallOptions::new(),
            )
            .await;

        assert!(matches!(result, Err(BreakerError::Operation(TestError))));
    }

    #[tokio::test]
    async fn test_error_call_with_fallback() {
        let registry = Registry::new();
        registry.configure("test", |b| b).unwrap();

        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();

        let result = registry
            .call(
                "test",
                |_cancel| async { Err::<(), _>(TestError) },
                CallOptions::new().with_fallback(move |error| {
                    assert!(matches!(error, BreakerError::Operation(TestError)));
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .await;

        assert!(result.is_ok());
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_fallback_error_replaces_outcome() {
        let registry = Registry::new();
        registry.configure("test", |b| b).unwrap();

        let result = registry
            .call(
                "test",
                |_cancel| async { Err::<(), _>("utoh 1".to_string()) },
                CallOptions::new().with_fallback(|error| {
                    assert!(
                        matches!(error, BreakerError::Operation(inner) if inner == "utoh 1")
                    );
                    Err("utoh 2".to_string())
                }),
            )
            .await;

        assert!(matches!(result, Err(BreakerError::Operation(inner)) if inner == "utoh 2"));
    }

    #[tokio::test]
    async fn test_breaker_through_registry() {
        let registry = Registry::new();
        registry.configure("test", test_config).unwrap();

        let fallback_calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let count = fallback_calls.clone();
            let result = registry
                .call(
                    "test",
                    |_cancel| async { Err::<(), _>(TestError) },
                    CallOptions::new().with_fallback(move |_error| {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }),
                )
                .await;
            assert!(result.is_ok());
        }

        let result = registry
            .call(
                "test",
                |_cancel| async { Err::<(), _>(TestError) },
                CallOptions::new(),
            )
            .await;
        assert!(matches!(result, Err(BreakerError::CircuitOpen)));

        let count = fallback_calls.clone();
        let result = registry
            .call(
                "test",
                |_cancel| async { Err::<(), _>(TestError) },
                CallOptions::new().with_fallback(move |_error| {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .await;
        assert!(result.is_ok());
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 6);
    }

    /// Launch `count` calls that block inside the protected region until
    /// released. Returns the receivers plus the release switch.
    fn launch_blockers(
        registry: &Registry,
        count: usize,
    ) -> (
        Vec<oneshot::Receiver<Result<(), BreakerError<TestError>>>>,
        mpsc::Receiver<()>,
        watch::Sender<bool>,
    ) {
        let (started_tx, started_rx) = mpsc::channel(count);
        let (release_tx, release_rx) = watch::channel(false);
        let mut calls = Vec::new();

        for _ in 0..count {
            let started = started_tx.clone();
            let mut release = release_rx.clone();

            calls.push(registry.call_async(
                "test",
                move |_cancel| async move {
                    started.send(()).await.unwrap();
                    release.wait_for(|open| *open).await.unwrap();
                    Ok::<(), TestError>(())
                },
                CallOptions::new(),
            ));
        }

        (calls, started_rx, release_tx)
    }

    #[tokio::test]
    async fn test_max_concurrency_rejection() {
        let registry = Registry::new();
        registry
            .configure("test", |b| {
                test_config(b)
                    .invocation_timeout(Duration::ZERO)
                    .max_concurrency(5)
                    .max_concurrency_timeout(Duration::ZERO)
            })
            .unwrap();

        let (calls, mut started, release) = launch_blockers(&registry, 5);
        for _ in 0..5 {
            started.recv().await.unwrap();
        }

        // All tokens are held: a sixth call is rejected immediately and the
        // fallback observes the rejection.
        let observed = Arc::new(AtomicBool::new(false));
        let flag = observed.clone();
        let result = registry
            .call(
                "test",
                |_cancel| async { Ok::<(), TestError>(()) },
                CallOptions::new().with_fallback(move |error| {
                    assert!(matches!(error, BreakerError::MaxConcurrency));
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .await;
        assert!(result.is_ok());
        assert!(observed.load(Ordering::SeqCst));

        release.send(true).unwrap();
        for call in calls {
            assert!(call.await.unwrap().is_ok());
        }

        let result = registry
            .call(
                "test",
                |_cancel| async { Ok::<(), TestError>(()) },
                CallOptions::new(),
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_max_concurrency_timeout() {
        let clock = Arc::new(VirtualClock::new());
        let registry = Registry::with_clock(clock.clone());
        registry
            .configure("test", |b| {
                test_config(b)
                    .invocation_timeout(Duration::ZERO)
                    .max_concurrency(5)
                    .max_concurrency_timeout(Duration::from_secs(60))
            })
            .unwrap();

        let (calls, mut started, release) = launch_blockers(&registry, 5);
        for _ in 0..5 {
            started.recv().await.unwrap();
        }

        let waiting = registry.call_async(
            "test",
            |_cancel| async { Ok::<(), TestError>(()) },
            CallOptions::new().with_fallback(|error| {
                assert!(matches!(error, BreakerError::MaxConcurrency));
                Ok(())
            }),
        );

        clock.blocking_advance(Duration::from_secs(60)).await;
        assert!(waiting.await.unwrap().is_ok());

        release.send(true).unwrap();
        for call in calls {
            assert!(call.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn test_double_configure() {
        let registry = Registry::new();

        assert!(registry.configure("test", |b| b).is_ok());
        assert!(matches!(
            registry.configure("test", |b| b),
            Err(BreakerError::AlreadyConfigured)
        ));
    }

    #[tokio::test]
    async fn test_call_unconfigured() {
        let registry = Registry::new();

        let result = registry
            .call(
                "test",
                |_cancel| async { Ok::<(), TestError>(()) },
                CallOptions::new(),
            )
            .await;

        assert!(matches!(result, Err(BreakerError::Unconfigured)));
    }

    #[tokio::test]
    async fn test_call_async_unconfigured() {
        let registry = Registry::new();

        let receiver = registry.call_async(
            "test",
            |_cancel| async { Ok::<(), TestError>(()) },
            CallOptions::new(),
        );

        assert!(matches!(
            receiver.await,
            Ok(Err(BreakerError::Unconfigured))
        ));
    }

    #[tokio::test]
    async fn test_event_order_for_successful_call() {
        let collector = RecordingCollector::new();
        let registry = Registry::new();
        registry
            .configure("test", |b| test_config(b).collector(collector.clone()))
            .unwrap();

        let result = registry
            .call(
                "test",
                |_cancel| async { Ok::<(), TestError>(()) },
                CallOptions::new(),
            )
            .await;
        assert!(result.is_ok());

        assert_eq!(
            collector.counts(),
            vec![
                EventType::Attempt,
                EventType::SemaphoreAcquired,
                EventType::SemaphoreReleased,
                EventType::Success,
            ]
        );

        let durations: Vec<EventType> =
            collector.durations().iter().map(|(event, _)| *event).collect();
        assert_eq!(
            durations,
            vec![EventType::RunDuration, EventType::TotalDuration]
        );
    }

    #[tokio::test]
    async fn test_event_order_for_rejection() {
        let collector = RecordingCollector::new();
        let registry = Registry::new();
        registry
            .configure("test", |b| {
                test_config(b)
                    .invocation_timeout(Duration::ZERO)
                    .max_concurrency(1)
                    .max_concurrency_timeout(Duration::ZERO)
                    .collector(collector.clone())
            })
            .unwrap();

        let (calls, mut started, release) = launch_blockers(&registry, 1);
        started.recv().await.unwrap();

        let result = registry
            .call(
                "test",
                |_cancel| async { Ok::<(), TestError>(()) },
                CallOptions::new(),
            )
            .await;
        assert!(matches!(result, Err(BreakerError::MaxConcurrency)));

        release.send(true).unwrap();
        for call in calls {
            assert!(call.await.unwrap().is_ok());
        }

        let counts = collector.counts();
        let rejection = counts
            .iter()
            .position(|event| *event == EventType::Rejection)
            .expect("rejection event");
        assert_eq!(counts[rejection - 1], EventType::Attempt);
        assert_eq!(counts[rejection + 1], EventType::Failure);
    }
}
