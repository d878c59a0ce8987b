//! Circuit breaker state machine and protected invocation
//!
//! A breaker admits or rejects calls based on its trip condition, schedules
//! cool-downs through its backoff, and probabilistically samples recovery in
//! the half-closed state. All mutable state sits behind a single lock; the
//! lock is never held across an await or a collector callback.

use std::any::Any;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use rand::Rng;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::builder::CircuitBuilder;
use crate::classifier::FailureInterpreter;
use crate::clock::Clock;
use crate::collector::{EventType, MetricCollector};
use crate::errors::BreakerError;
use crate::trip::TripCondition;

/// Externally observable breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation; calls pass through.
    Closed,
    /// Shedding; calls fail fast.
    Open,
    /// Probational; calls are admitted with some probability.
    HalfClosed,
}

/// A circuit breaker protecting one logical call site.
///
/// Cloning is cheap and shares the underlying state, so a breaker can be
/// handed to as many callers as needed.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    pub(crate) core: Arc<BreakerCore>,
}

#[derive(Debug)]
pub(crate) struct BreakerCore {
    pub(crate) invocation_timeout: Duration,
    pub(crate) half_closed_retry_probability: f64,
    pub(crate) max_concurrency: usize,
    pub(crate) max_concurrency_timeout: Duration,
    pub(crate) failure_interpreter: Box<dyn FailureInterpreter>,
    pub(crate) trip_condition: Box<dyn TripCondition>,
    pub(crate) collector: Arc<dyn MetricCollector>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) inner: Mutex<BreakerState>,
}

#[derive(Debug)]
pub(crate) struct BreakerState {
    pub(crate) state: CircuitState,
    pub(crate) hard_trip: bool,
    pub(crate) last_failure_time: Option<SystemTime>,
    pub(crate) reset_timeout: Option<Duration>,
    pub(crate) backoff: Box<dyn Backoff>,
}

impl CircuitBreaker {
    /// Start configuring a breaker.
    pub fn builder() -> CircuitBuilder {
        CircuitBuilder::new()
    }

    /// Manually trip the breaker. It stays open until [`reset`](Self::reset)
    /// is called, regardless of elapsed time.
    pub fn trip(&self) {
        self.core.inner.lock().unwrap().hard_trip = true;

        tracing::warn!("circuit hard-tripped");
        self.core.collector.report_state(CircuitState::Open);
    }

    /// Clear the hard trip and the scheduled cool-down, rewind the backoff,
    /// and signal a success to the trip condition. The stored state is
    /// recomputed by the next admission check.
    pub fn reset(&self) {
        {
            let mut inner = self.core.inner.lock().unwrap();
            inner.hard_trip = false;
            inner.reset_timeout = None;
            inner.backoff.reset();
        }

        self.core.trip_condition.success();
    }

    /// The externally observable state. A hard trip reports as open.
    pub fn state(&self) -> CircuitState {
        let inner = self.core.inner.lock().unwrap();

        if inner.hard_trip {
            CircuitState::Open
        } else {
            inner.state
        }
    }

    /// Whether a call should be admitted right now.
    ///
    /// Successive reads may differ: the verdict follows the trip condition,
    /// the scheduled cool-down, and the half-closed retry probability.
    pub fn should_try(&self) -> bool {
        let (admitted, transition) = {
            let mut inner = self.core.inner.lock().unwrap();

            if inner.hard_trip {
                return false;
            }

            let previous = inner.state;
            let admitted = self.advance_state(&mut inner);
            let transition = (inner.state != previous).then_some(inner.state);
            (admitted, transition)
        };

        if let Some(state) = transition {
            tracing::debug!(?state, "circuit changed state");
            self.core.collector.report_state(state);
        }

        admitted
    }

    fn advance_state(&self, inner: &mut BreakerState) -> bool {
        if !self.core.trip_condition.should_trip() {
            inner.state = CircuitState::Closed;
            return true;
        }

        if inner.state == CircuitState::Closed {
            // A fresh OPEN period starts from the base interval.
            inner.backoff.reset();
        }

        if inner.state != CircuitState::Open {
            inner.reset_timeout = Some(inner.backoff.next_interval());
        }

        if self.reset_timeout_elapsed(inner) {
            inner.state = CircuitState::HalfClosed;
            return rand::thread_rng().gen::<f64>() < self.core.half_closed_retry_probability;
        }

        inner.state = CircuitState::Open;
        false
    }

    fn reset_timeout_elapsed(&self, inner: &BreakerState) -> bool {
        if inner.state != CircuitState::Open {
            return false;
        }

        let (Some(last_failure), Some(reset_timeout)) =
            (inner.last_failure_time, inner.reset_timeout)
        else {
            return false;
        };

        let elapsed = self
            .core
            .clock
            .now()
            .duration_since(last_failure)
            .unwrap_or_default();
        elapsed >= reset_timeout
    }

    /// Mark the outcome of a protected section.
    ///
    /// A timeout, or any error the failure interpreter counts, records a
    /// failure and returns `false`. Everything else - including errors the
    /// interpreter declines - resets the breaker and returns `true`.
    pub fn mark_result<E: Any>(&self, error: Option<&BreakerError<E>>) -> bool {
        let counts_against = match error {
            None => false,
            Some(error) => {
                matches!(error, BreakerError::InvocationTimeout) || self.interpret_failure(error)
            }
        };

        if counts_against {
            self.core.inner.lock().unwrap().last_failure_time = Some(self.core.clock.now());
            self.core.trip_condition.failure();
            false
        } else {
            self.reset();
            true
        }
    }

    fn interpret_failure<E: Any>(&self, error: &BreakerError<E>) -> bool {
        let cause: &dyn Any = match error {
            BreakerError::Operation(inner) => inner,
            other => other,
        };

        self.core.failure_interpreter.should_trip(cause)
    }

    /// Invoke `f` under the protection of this breaker.
    ///
    /// The operation receives a [`CancellationToken`] which is cancelled if
    /// the invocation timeout elapses; the breaker does not wait for the
    /// operation to observe it before returning.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Any + Send,
    {
        self.core.collector.report_count(EventType::Attempt);
        self.call_protected(f).await
    }

    /// The body of [`call`](Self::call) without the leading `Attempt`
    /// emission; the registry reports its own.
    pub(crate) async fn call_protected<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Any + Send,
    {
        if !self.should_try() {
            self.core.collector.report_count(EventType::ShortCircuit);
            return Err(BreakerError::CircuitOpen);
        }

        let started = Instant::now();
        let result = call_with_timeout(f, &self.core.clock, self.core.invocation_timeout).await;
        self.core
            .collector
            .report_duration(EventType::RunDuration, started.elapsed());

        match result {
            Ok(value) => {
                self.mark_result::<E>(None);
                Ok(value)
            }
            Err(error) => {
                let tolerated = self.mark_result(Some(&error));

                let event = if matches!(error, BreakerError::InvocationTimeout) {
                    EventType::Timeout
                } else if tolerated {
                    EventType::BadRequest
                } else {
                    EventType::Error
                };
                self.core.collector.report_count(event);

                Err(error)
            }
        }
    }

    /// Invoke `f` on a spawned task, returning a channel that receives the
    /// [`call`](Self::call) outcome exactly once and then closes.
    pub fn call_async<F, Fut, T, E>(&self, f: F) -> oneshot::Receiver<Result<T, BreakerError<E>>>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Any + Send,
    {
        let breaker = self.clone();
        let (sender, receiver) = oneshot::channel();

        tokio::spawn(async move {
            let _ = sender.send(breaker.call(f).await);
        });

        receiver
    }
}

/// Race `f` against the invocation timeout.
///
/// A zero timeout runs the operation inline with an inert cancellation
/// token and no timer.
async fn call_with_timeout<F, Fut, T, E>(
    f: F,
    clock: &Arc<dyn Clock>,
    timeout: Duration,
) -> Result<T, BreakerError<E>>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    if timeout.is_zero() {
        return f(CancellationToken::new())
            .await
            .map_err(BreakerError::Operation);
    }

    let cancel = CancellationToken::new();
    let worker = tokio::spawn(f(cancel.clone()));

    tokio::select! {
        finished = worker => match finished {
            Ok(outcome) => outcome.map_err(BreakerError::Operation),
            Err(failure) if failure.is_panic() => std::panic::resume_unwind(failure.into_panic()),
            // The worker only disappears without a result when the runtime
            // is shutting down.
            Err(_) => Err(BreakerError::InvocationTimeout),
        },
        _ = clock.delay(timeout) => {
            cancel.cancel();
            Err(BreakerError::InvocationTimeout)
        }
    }
}
