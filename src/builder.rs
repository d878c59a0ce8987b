//! Builder API for circuit breaker configuration

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backoff::{Backoff, ConstantBackoff};
use crate::circuit::{BreakerCore, BreakerState, CircuitBreaker, CircuitState};
use crate::classifier::{AnyErrorInterpreter, FailureInterpreter};
use crate::clock::{Clock, SystemClock};
use crate::collector::{BreakerConfig, MetricCollector, NoopCollector};
use crate::trip::{ConsecutiveFailureTripCondition, TripCondition};

const DEFAULT_INVOCATION_TIMEOUT: Duration = Duration::from_millis(100);
const DEFAULT_HALF_CLOSED_RETRY_PROBABILITY: f64 = 0.5;
const DEFAULT_RESET_INTERVAL: Duration = Duration::from_millis(1000);
const DEFAULT_TRIP_THRESHOLD: usize = 5;
const DEFAULT_MAX_CONCURRENCY: usize = 100;
const DEFAULT_MAX_CONCURRENCY_TIMEOUT: Duration = Duration::from_millis(100);

/// Builder for circuit breakers with a fluent API.
///
/// Every tunable has a production default; tests typically swap in a
/// [`VirtualClock`](crate::clock::VirtualClock) and a deterministic trip
/// condition.
#[derive(Debug)]
pub struct CircuitBuilder {
    invocation_timeout: Duration,
    half_closed_retry_probability: f64,
    reset_backoff: Box<dyn Backoff>,
    failure_interpreter: Box<dyn FailureInterpreter>,
    trip_condition: Box<dyn TripCondition>,
    collector: Arc<dyn MetricCollector>,
    clock: Arc<dyn Clock>,
    max_concurrency: usize,
    max_concurrency_timeout: Duration,
}

impl CircuitBuilder {
    pub fn new() -> Self {
        Self {
            invocation_timeout: DEFAULT_INVOCATION_TIMEOUT,
            half_closed_retry_probability: DEFAULT_HALF_CLOSED_RETRY_PROBABILITY,
            reset_backoff: Box::new(ConstantBackoff::new(DEFAULT_RESET_INTERVAL)),
            failure_interpreter: Box::new(AnyErrorInterpreter),
            trip_condition: Box::new(ConsecutiveFailureTripCondition::new(
                DEFAULT_TRIP_THRESHOLD,
            )),
            collector: Arc::new(NoopCollector),
            clock: Arc::new(SystemClock),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_concurrency_timeout: DEFAULT_MAX_CONCURRENCY_TIMEOUT,
        }
    }

    /// Maximum time an operation may run before it is cancelled. Zero
    /// disables the timer and runs the operation inline.
    pub fn invocation_timeout(mut self, timeout: Duration) -> Self {
        self.invocation_timeout = timeout;
        self
    }

    /// Probability of admitting a trial call while half-closed.
    pub fn half_closed_retry_probability(mut self, probability: f64) -> Self {
        self.half_closed_retry_probability = probability.clamp(0.0, 1.0);
        self
    }

    /// Backoff generating successive cool-down intervals between OPEN
    /// periods.
    pub fn reset_backoff(mut self, backoff: impl Backoff + 'static) -> Self {
        self.reset_backoff = Box::new(backoff);
        self
    }

    /// Interpreter deciding which operation errors count against the
    /// breaker.
    pub fn failure_interpreter(mut self, interpreter: impl FailureInterpreter + 'static) -> Self {
        self.failure_interpreter = Box::new(interpreter);
        self
    }

    /// Condition deciding when accumulated failures should open the circuit.
    pub fn trip_condition(mut self, condition: impl TripCondition + 'static) -> Self {
        self.trip_condition = Box::new(condition);
        self
    }

    /// Sink for events, latency samples and state changes.
    pub fn collector(mut self, collector: Arc<dyn MetricCollector>) -> Self {
        self.collector = collector;
        self
    }

    /// Time source for cool-downs, timeouts and semaphore waits.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Size of the semaphore guarding this breaker in a registry.
    ///
    /// # Panics
    ///
    /// Panics if `limit` is zero.
    pub fn max_concurrency(mut self, limit: usize) -> Self {
        assert!(limit > 0, "max concurrency must be greater than zero");
        self.max_concurrency = limit;
        self
    }

    /// Maximum time to wait for a semaphore token. Zero means a
    /// non-blocking try.
    pub fn max_concurrency_timeout(mut self, timeout: Duration) -> Self {
        self.max_concurrency_timeout = timeout;
        self
    }

    /// Build the circuit breaker and announce it to the collector.
    pub fn build(self) -> CircuitBreaker {
        self.collector.report_new(BreakerConfig {
            max_concurrency: self.max_concurrency,
        });

        CircuitBreaker {
            core: Arc::new(BreakerCore {
                invocation_timeout: self.invocation_timeout,
                half_closed_retry_probability: self.half_closed_retry_probability,
                max_concurrency: self.max_concurrency,
                max_concurrency_timeout: self.max_concurrency_timeout,
                failure_interpreter: self.failure_interpreter,
                trip_condition: self.trip_condition,
                collector: self.collector,
                clock: self.clock,
                inner: Mutex::new(BreakerState {
                    state: CircuitState::Closed,
                    hard_trip: false,
                    last_failure_time: None,
                    reset_timeout: None,
                    backoff: self.reset_backoff,
                }),
            }),
        }
    }
}

impl Default for CircuitBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let breaker = CircuitBuilder::new().build();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.should_try());
        assert_eq!(breaker.core.invocation_timeout, Duration::from_millis(100));
        assert_eq!(breaker.core.max_concurrency, 100);
    }

    #[test]
    fn test_probability_is_clamped() {
        let breaker = CircuitBuilder::new()
            .half_closed_retry_probability(7.5)
            .build();

        assert_eq!(breaker.core.half_closed_retry_probability, 1.0);
    }

    #[test]
    #[should_panic(expected = "max concurrency must be greater than zero")]
    fn test_zero_max_concurrency_panics() {
        CircuitBuilder::new().max_concurrency(0);
    }
}
