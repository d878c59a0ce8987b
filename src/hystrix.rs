//! Hystrix-compatible metrics exporter
//!
//! Collects per-breaker rolling statistics and emits one *command* and one
//! *thread-pool* event map per breaker per second, shaped for the Hystrix
//! dashboard. Transport is left to the caller: events arrive on a bounded
//! channel, ready to be served over SSE or anything else.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::circuit::CircuitState;
use crate::clock::{unix_seconds, Clock, SystemClock};
use crate::collector::{BreakerConfig, EventType, NamedMetricCollector};
use crate::stats::{BreakerStats, FrozenBreakerStats};

/// Cadence of the exporter loop.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// How many events may queue before the exporter awaits the consumer.
const EVENT_BUFFER: usize = 64;

/// A [`NamedMetricCollector`] that aggregates rolling stats per breaker and
/// periodically emits Hystrix dashboard events.
///
/// Attach it to breakers through
/// [`NamedCollector`](crate::collector::NamedCollector), then drain the
/// receiver returned by [`new`](Self::new):
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use fusebox::{HystrixCollector, NamedCollector, Registry};
///
/// # async fn run() {
/// let (hystrix, mut events) = HystrixCollector::new();
/// let hystrix = Arc::new(hystrix);
/// let reporter = hystrix.start();
///
/// let registry = Registry::new();
/// registry
///     .configure("payments", |breaker| {
///         breaker.collector(Arc::new(NamedCollector::new("payments", hystrix.clone())))
///     })
///     .unwrap();
///
/// while let Some(event) = events.recv().await {
///     // hand to the SSE transport
///     println!("{event}");
/// }
/// reporter.abort();
/// # }
/// ```
#[derive(Debug)]
pub struct HystrixCollector {
    clock: Arc<dyn Clock>,
    breakers: Arc<RwLock<HashMap<String, Arc<BreakerStats>>>>,
    events: mpsc::Sender<Value>,
}

impl HystrixCollector {
    pub fn new() -> (Self, mpsc::Receiver<Value>) {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> (Self, mpsc::Receiver<Value>) {
        let (events, receiver) = mpsc::channel(EVENT_BUFFER);

        (
            Self {
                clock,
                breakers: Arc::new(RwLock::new(HashMap::new())),
                events,
            },
            receiver,
        )
    }

    /// Spawn the reporting loop.
    ///
    /// The task emits a snapshot of every known breaker each second and
    /// stops once the event receiver is dropped; abort the handle to stop it
    /// earlier.
    pub fn start(&self) -> JoinHandle<()> {
        let clock = self.clock.clone();
        let breakers = self.breakers.clone();
        let events = self.events.clone();

        tracing::debug!("hystrix reporter started");

        tokio::spawn(async move {
            loop {
                let snapshot: Vec<(String, Arc<BreakerStats>)> = {
                    let breakers = breakers.read().unwrap();
                    let mut entries: Vec<_> = breakers
                        .iter()
                        .map(|(name, stats)| (name.clone(), stats.clone()))
                        .collect();
                    entries.sort_by(|a, b| a.0.cmp(&b.0));
                    entries
                };

                for (name, stats) in snapshot {
                    let frozen = stats.freeze();
                    let now = unix_seconds(clock.now());

                    if events.send(command_stats(&name, &frozen, now)).await.is_err() {
                        return;
                    }

                    if events.send(thread_pool_stats(&name, &frozen)).await.is_err() {
                        return;
                    }
                }

                if clock.delay(REPORT_INTERVAL).await.is_err() {
                    return;
                }
            }
        })
    }

    fn stats(&self, name: &str) -> Option<Arc<BreakerStats>> {
        self.breakers.read().unwrap().get(name).cloned()
    }
}

impl NamedMetricCollector for HystrixCollector {
    fn report_new(&self, name: &str, config: BreakerConfig) {
        let stats = Arc::new(BreakerStats::with_clock(config, self.clock.clone()));
        self.breakers
            .write()
            .unwrap()
            .insert(name.to_string(), stats);
    }

    fn report_count(&self, name: &str, event: EventType) {
        if let Some(stats) = self.stats(name) {
            stats.increment(event);
        }
    }

    fn report_duration(&self, name: &str, event: EventType, duration: Duration) {
        if let Some(stats) = self.stats(name) {
            stats.add_duration(event, duration);
        }
    }

    fn report_state(&self, name: &str, state: CircuitState) {
        if let Some(stats) = self.stats(name) {
            stats.set_state(state);
        }
    }
}

fn command_stats(name: &str, frozen: &FrozenBreakerStats, now: i64) -> Value {
    let run_durations = frozen.samples(EventType::RunDuration);
    let total_durations = frozen.samples(EventType::TotalDuration);

    let errors = frozen.counter(EventType::Failure);
    let requests = frozen.counter(EventType::Attempt);
    let error_percentage = if requests > 0 {
        (errors as f64 / requests as f64).min(1.0) * 100.0
    } else {
        0.0
    };

    json!({
        "type": "HystrixCommand",
        "name": name,
        "group": name,
        "currentTime": now,
        "errorCount": errors,
        "requestCount": requests,
        "errorPercentage": error_percentage,
        "rollingCountSuccess": frozen.counter(EventType::Success),
        "rollingCountFailure": frozen.counter(EventType::Error),
        "rollingCountBadRequest": frozen.counter(EventType::BadRequest),
        "rollingCountShortCircuited": frozen.counter(EventType::ShortCircuit),
        "rollingCountTimeout": frozen.counter(EventType::Timeout),
        "rollingCountSemaphoreRejected": frozen.counter(EventType::Rejection),
        "rollingCountFallbackSuccess": frozen.counter(EventType::FallbackSuccess),
        "rollingCountFallbackFailure": frozen.counter(EventType::FallbackFailure),
        "latencyExecute": latencies(run_durations),
        "latencyTotal": latencies(total_durations),
        "latencyExecute_mean": mean(run_durations).as_millis() as u64,
        "latencyTotal_mean": mean(total_durations).as_millis() as u64,
        "isCircuitBreakerOpen": frozen.state != CircuitState::Closed,
        "currentConcurrentExecutionCount": 0,
        "propertyValue_circuitBreakerEnabled": true,
        "propertyValue_circuitBreakerErrorThresholdPercentage": 0,
        "propertyValue_circuitBreakerForceOpen": false,
        "propertyValue_circuitBreakerForceClosed": false,
        "propertyValue_circuitBreakerRequestVolumeThreshold": 0,
        "propertyValue_circuitBreakerSleepWindowInMilliseconds": 0,
        "propertyValue_executionIsolationSemaphoreMaxConcurrentRequests": 0,
        "propertyValue_executionIsolationStrategy": "SEMAPHORE",
        "propertyValue_executionIsolationThreadInterruptOnTimeout": false,
        "propertyValue_executionIsolationThreadPoolKeyOverride": "",
        "propertyValue_executionIsolationThreadTimeoutInMilliseconds": "",
        "propertyValue_fallbackIsolationSemaphoreMaxConcurrentRequests": 0,
        "propertyValue_metricsRollingStatisticalWindowInMilliseconds": 1000,
        "propertyValue_requestCacheEnabled": false,
        "propertyValue_requestLogEnabled": false,
        "reportingHosts": 1,
        "rollingCountCollapsedRequests": 0,
        "rollingCountExceptionsThrown": 0,
        "rollingCountFallbackRejection": 0,
        "rollingCountResponsesFromCache": 0,
        "rollingCountThreadPoolRejected": 0,
    })
}

fn thread_pool_stats(name: &str, frozen: &FrozenBreakerStats) -> Value {
    let capacity = frozen.config.max_concurrency;

    json!({
        "type": "HystrixThreadPool",
        "name": name,
        "currentCorePoolSize": capacity,
        "currentLargestPoolSize": capacity,
        "currentMaximumPoolSize": capacity,
        "currentPoolSize": capacity,
        "currentActiveCount": frozen.current(EventType::SemaphoreAcquired),
        "rollingMaxActiveThreads": frozen.maximum(EventType::SemaphoreAcquired),
        "rollingCountThreadsExecuted": frozen.counter(EventType::SemaphoreAcquired),
        "currentQueueSize": frozen.current(EventType::SemaphoreQueued),
        "currentCompletedTaskCount": 15,
        "currentTaskCount": 15,
        "propertyValue_metricsRollingStatisticalWindowInMilliseconds": 1000,
        "propertyValue_queueSizeRejectionThreshold": "NaN",
        "reportingHosts": 1,
    })
}

fn latencies(values: &[Duration]) -> Value {
    json!({
        "0": percentile(values, 0.000).as_millis() as u64,
        "25": percentile(values, 0.250).as_millis() as u64,
        "50": percentile(values, 0.500).as_millis() as u64,
        "75": percentile(values, 0.750).as_millis() as u64,
        "90": percentile(values, 0.900).as_millis() as u64,
        "95": percentile(values, 0.950).as_millis() as u64,
        "99": percentile(values, 0.990).as_millis() as u64,
        "99.5": percentile(values, 0.995).as_millis() as u64,
        "100": percentile(values, 1.000).as_millis() as u64,
    })
}

/// Percentile over an already sorted sample list.
fn percentile(values: &[Duration], p: f64) -> Duration {
    if values.is_empty() {
        return Duration::ZERO;
    }

    if p == 0.0 {
        return values[0];
    }

    let index = round_to(p * values.len() as f64, 0.05) as usize;
    values[index.min(values.len() - 1)]
}

fn round_to(x: f64, unit: f64) -> f64 {
    if x > 0.0 {
        ((x / unit + 0.5) as i64) as f64 * unit
    } else {
        ((x / unit - 0.5) as i64) as f64 * unit
    }
}

fn mean(values: &[Duration]) -> Duration {
    if values.is_empty() {
        return Duration::ZERO;
    }

    let sum: Duration = values.iter().sum();
    sum.div_f64(values.len() as f64)
}
