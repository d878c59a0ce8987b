//! Metric collection pipeline
//!
//! Breakers and registries report typed events, latency samples and state
//! changes to a [`MetricCollector`]. Collectors compose by wrapping: a
//! [`MultiCollector`] fans out to several backends and a [`NamedCollector`]
//! injects the breaker name into every emission.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::circuit::CircuitState;

/// Interesting occurrences reported during a protected call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// A call was requested.
    Attempt,
    /// The call completed without an error.
    Success,
    /// The call produced an error or could not be admitted.
    Failure,
    /// The operation failed with an error that counts against the breaker.
    Error,
    /// The operation failed with an error the interpreter declined to count.
    BadRequest,
    /// The circuit was open and the operation was not invoked.
    ShortCircuit,
    /// The operation timed out.
    Timeout,
    /// The semaphore wait timed out and the operation was not invoked.
    Rejection,
    /// A fallback returned without an error.
    FallbackSuccess,
    /// A fallback returned an error.
    FallbackFailure,
    /// Duration of the operation itself.
    RunDuration,
    /// Duration of the whole registry call.
    TotalDuration,
    /// A caller began waiting for a semaphore token. Not emitted when a
    /// token is immediately available.
    SemaphoreQueued,
    /// A caller stopped waiting, with or without a token.
    SemaphoreDequeued,
    /// A semaphore token was acquired.
    SemaphoreAcquired,
    /// A semaphore token was returned.
    SemaphoreReleased,
}

/// Immutable per-breaker values shared with collectors at build time.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub max_concurrency: usize,
}

/// A sink for breaker events, latency samples and state changes.
pub trait MetricCollector: Send + Sync + fmt::Debug {
    /// Fires once when a breaker is built, carrying its immutable config.
    fn report_new(&self, config: BreakerConfig);

    /// Fires for each non-latency event.
    fn report_count(&self, event: EventType);

    /// Fires for latency events with the measured duration.
    fn report_duration(&self, event: EventType, duration: Duration);

    /// Fires when the breaker changes state.
    fn report_state(&self, state: CircuitState);
}

/// Collector that discards everything. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCollector;

impl MetricCollector for NoopCollector {
    fn report_new(&self, _config: BreakerConfig) {}

    fn report_count(&self, _event: EventType) {}

    fn report_duration(&self, _event: EventType, _duration: Duration) {}

    fn report_state(&self, _state: CircuitState) {}
}

/// Collector that forwards every emission to several backends in
/// registration order.
#[derive(Debug)]
pub struct MultiCollector {
    collectors: Vec<Arc<dyn MetricCollector>>,
}

impl MultiCollector {
    pub fn new(collectors: Vec<Arc<dyn MetricCollector>>) -> Self {
        Self { collectors }
    }
}

impl MetricCollector for MultiCollector {
    fn report_new(&self, config: BreakerConfig) {
        for collector in &self.collectors {
            collector.report_new(config);
        }
    }

    fn report_count(&self, event: EventType) {
        for collector in &self.collectors {
            collector.report_count(event);
        }
    }

    fn report_duration(&self, event: EventType, duration: Duration) {
        for collector in &self.collectors {
            collector.report_duration(event, duration);
        }
    }

    fn report_state(&self, state: CircuitState) {
        for collector in &self.collectors {
            collector.report_state(state);
        }
    }
}

/// A [`MetricCollector`] whose methods also receive the breaker name.
///
/// Backends that aggregate several breakers (such as the Hystrix exporter)
/// implement this and are attached to individual breakers through
/// [`NamedCollector`].
pub trait NamedMetricCollector: Send + Sync + fmt::Debug {
    fn report_new(&self, name: &str, config: BreakerConfig);

    fn report_count(&self, name: &str, event: EventType);

    fn report_duration(&self, name: &str, event: EventType, duration: Duration);

    fn report_state(&self, name: &str, state: CircuitState);
}

/// Adapter that turns a [`NamedMetricCollector`] into a [`MetricCollector`]
/// by injecting a fixed breaker name into every emission.
#[derive(Debug)]
pub struct NamedCollector {
    name: String,
    collector: Arc<dyn NamedMetricCollector>,
}

impl NamedCollector {
    pub fn new(name: impl Into<String>, collector: Arc<dyn NamedMetricCollector>) -> Self {
        Self {
            name: name.into(),
            collector,
        }
    }
}

impl MetricCollector for NamedCollector {
    fn report_new(&self, config: BreakerConfig) {
        self.collector.report_new(&self.name, config);
    }

    fn report_count(&self, event: EventType) {
        self.collector.report_count(&self.name, event);
    }

    fn report_duration(&self, event: EventType, duration: Duration) {
        self.collector.report_duration(&self.name, event, duration);
    }

    fn report_state(&self, state: CircuitState) {
        self.collector.report_state(&self.name, state);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every emission for ordering assertions.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingCollector {
        counts: Mutex<Vec<EventType>>,
        durations: Mutex<Vec<(EventType, Duration)>>,
        states: Mutex<Vec<CircuitState>>,
    }

    impl RecordingCollector {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn counts(&self) -> Vec<EventType> {
            self.counts.lock().unwrap().clone()
        }

        pub(crate) fn durations(&self) -> Vec<(EventType, Duration)> {
            self.durations.lock().unwrap().clone()
        }

        pub(crate) fn states(&self) -> Vec<CircuitState> {
            self.states.lock().unwrap().clone()
        }
    }

    impl MetricCollector for RecordingCollector {
        fn report_new(&self, _config: BreakerConfig) {}

        fn report_count(&self, event: EventType) {
            self.counts.lock().unwrap().push(event);
        }

        fn report_duration(&self, event: EventType, duration: Duration) {
            self.durations.lock().unwrap().push((event, duration));
        }

        fn report_state(&self, state: CircuitState) {
            self.states.lock().unwrap().push(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingCollector;
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_multi_collector_fans_out() {
        let first = RecordingCollector::new();
        let second = RecordingCollector::new();
        let multi = MultiCollector::new(vec![
            first.clone() as Arc<dyn MetricCollector>,
            second.clone(),
        ]);

        multi.report_count(EventType::Attempt);
        multi.report_duration(EventType::RunDuration, Duration::from_millis(5));
        multi.report_state(CircuitState::Open);

        for collector in [&first, &second] {
            assert_eq!(collector.counts(), vec![EventType::Attempt]);
            assert_eq!(
                collector.durations(),
                vec![(EventType::RunDuration, Duration::from_millis(5))]
            );
            assert_eq!(collector.states(), vec![CircuitState::Open]);
        }
    }

    #[test]
    fn test_named_collector_injects_name() {
        #[derive(Debug, Default)]
        struct NameRecorder {
            seen: Mutex<Vec<(String, EventType)>>,
        }

        impl NamedMetricCollector for NameRecorder {
            fn report_new(&self, _name: &str, _config: BreakerConfig) {}

            fn report_count(&self, name: &str, event: EventType) {
                self.seen.lock().unwrap().push((name.to_string(), event));
            }

            fn report_duration(&self, _name: &str, _event: EventType, _duration: Duration) {}

            fn report_state(&self, _name: &str, _state: CircuitState) {}
        }

        let recorder = Arc::new(NameRecorder::default());
        let named = NamedCollector::new("payments", recorder.clone());

        named.report_count(EventType::Success);

        assert_eq!(
            recorder.seen.lock().unwrap().clone(),
            vec![("payments".to_string(), EventType::Success)]
        );
    }
}
