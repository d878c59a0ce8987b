//! Trip conditions controlling the open/closed verdict
//!
//! A trip condition accumulates call outcomes and answers whether the
//! breaker ought to open. `should_trip` must be idempotent over repeated
//! reads: it may prune internal logs as a side effect, but the verdict may
//! only change through `success` and `failure`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::clock::{Clock, SystemClock};

/// Decides the breaker verdict from accumulated outcomes.
pub trait TripCondition: Send + Sync + fmt::Debug {
    /// Invoked on every successful call and on a hard reset.
    fn success(&self);

    /// Invoked on every counted failure and on a hard trip.
    fn failure(&self);

    /// Whether the breaker ought to be open right now.
    fn should_trip(&self) -> bool;
}

/// Trips after a configurable number of failures in a row. A single success
/// breaks the chain.
#[derive(Debug)]
pub struct ConsecutiveFailureTripCondition {
    count: AtomicUsize,
    threshold: usize,
}

impl ConsecutiveFailureTripCondition {
    pub fn new(threshold: usize) -> Self {
        Self {
            count: AtomicUsize::new(0),
            threshold,
        }
    }
}

impl TripCondition for ConsecutiveFailureTripCondition {
    fn success(&self) {
        self.count.store(0, Ordering::SeqCst);
    }

    fn failure(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn should_trip(&self) -> bool {
        self.count.load(Ordering::SeqCst) >= self.threshold
    }
}

/// Trips once enough failures land inside a sliding time window.
///
/// Successes are not tracked; only the recency of failures matters.
#[derive(Debug)]
pub struct WindowFailureTripCondition {
    window: Duration,
    threshold: usize,
    clock: Arc<dyn Clock>,
    failures: Mutex<VecDeque<SystemTime>>,
}

impl WindowFailureTripCondition {
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self::with_clock(window, threshold, Arc::new(SystemClock))
    }

    pub fn with_clock(window: Duration, threshold: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            window,
            threshold,
            clock,
            failures: Mutex::new(VecDeque::new()),
        }
    }
}

impl TripCondition for WindowFailureTripCondition {
    fn success(&self) {}

    fn failure(&self) {
        self.failures.lock().unwrap().push_back(self.clock.now());
    }

    fn should_trip(&self) -> bool {
        let mut failures = self.failures.lock().unwrap();
        let cutoff = self.clock.now() - self.window;

        while failures.front().is_some_and(|at| *at <= cutoff) {
            failures.pop_front();
        }

        failures.len() >= self.threshold
    }
}

/// Trips when the failure ratio over the last `size` outcomes reaches a
/// threshold. The verdict stays closed until the log has filled once.
#[derive(Debug)]
pub struct PercentageFailureTripCondition {
    size: usize,
    threshold: f64,
    log: Mutex<OutcomeLog>,
}

#[derive(Debug)]
struct OutcomeLog {
    entries: VecDeque<bool>,
    failures: usize,
}

impl PercentageFailureTripCondition {
    pub fn new(size: usize, threshold: f64) -> Self {
        Self {
            size,
            threshold,
            log: Mutex::new(OutcomeLog {
                entries: VecDeque::with_capacity(size),
                failures: 0,
            }),
        }
    }

    fn record(&self, success: bool) {
        let mut log = self.log.lock().unwrap();
        log.entries.push_back(success);

        if !success {
            log.failures += 1;
        }

        if log.entries.len() > self.size {
            // Only an evicted failure releases its count.
            if let Some(false) = log.entries.pop_front() {
                log.failures -= 1;
            }
        }
    }
}

impl TripCondition for PercentageFailureTripCondition {
    fn success(&self) {
        self.record(true);
    }

    fn failure(&self) {
        self.record(false);
    }

    fn should_trip(&self) -> bool {
        let log = self.log.lock().unwrap();

        log.entries.len() >= self.size
            && log.failures as f64 / self.size as f64 >= self.threshold
    }
}
