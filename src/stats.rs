//! Rolling per-second statistics
//!
//! Events and latency samples are bucketed by wall-clock second. Buckets
//! expire after a fixed retention, counters reset at bucket boundaries, and
//! in-flight gauges carry across them. `freeze` produces an immutable
//! snapshot for exporters.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::circuit::CircuitState;
use crate::clock::{unix_seconds, Clock, SystemClock};
use crate::collector::{BreakerConfig, EventType};

/// How long a bucket participates in snapshots.
pub const STATS_RETENTION: Duration = Duration::from_secs(10);

/// Paired events count under their own type but move the gauge of the first
/// event of the pair: queued/dequeued and acquired/released each share one
/// in-flight gauge.
fn dual_relation(event: EventType) -> (EventType, i64) {
    match event {
        EventType::SemaphoreQueued => (EventType::SemaphoreQueued, 1),
        EventType::SemaphoreDequeued => (EventType::SemaphoreQueued, -1),
        EventType::SemaphoreAcquired => (EventType::SemaphoreAcquired, 1),
        EventType::SemaphoreReleased => (EventType::SemaphoreAcquired, -1),
        other => (other, 1),
    }
}

/// Rolling statistics for one breaker.
#[derive(Debug)]
pub struct BreakerStats {
    clock: Arc<dyn Clock>,
    inner: Mutex<StatsInner>,
}

#[derive(Debug)]
struct StatsInner {
    config: BreakerConfig,
    state: CircuitState,
    buckets: BTreeMap<i64, Bucket>,
}

#[derive(Debug, Default)]
struct Bucket {
    counters: HashMap<EventType, u64>,
    durations: HashMap<EventType, Vec<Duration>>,
    currents: HashMap<EventType, i64>,
    maximums: HashMap<EventType, i64>,
}

impl BreakerStats {
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(StatsInner {
                config,
                state: CircuitState::Closed,
                buckets: BTreeMap::new(),
            }),
        }
    }

    /// Record the breaker's last reported state.
    pub fn set_state(&self, state: CircuitState) {
        self.inner.lock().unwrap().state = state;
    }

    /// Count an event in the current bucket, applying the paired-event gauge
    /// rewrite.
    pub fn increment(&self, event: EventType) {
        let (gauge, delta) = dual_relation(event);
        let epoch = unix_seconds(self.clock.now());

        let mut inner = self.inner.lock().unwrap();
        let bucket = inner.current_bucket(epoch);

        *bucket.counters.entry(event).or_insert(0) += 1;

        let current = bucket.currents.entry(gauge).or_insert(0);
        *current += delta;
        let current = *current;

        let maximum = bucket.maximums.entry(gauge).or_insert(0);
        if current > *maximum {
            *maximum = current;
        }
    }

    /// Append a latency sample to the current bucket.
    pub fn add_duration(&self, event: EventType, duration: Duration) {
        let epoch = unix_seconds(self.clock.now());

        let mut inner = self.inner.lock().unwrap();
        inner
            .current_bucket(epoch)
            .durations
            .entry(event)
            .or_default()
            .push(duration);
    }

    /// Snapshot the retained buckets.
    ///
    /// Counters are summed, durations concatenated and sorted ascending,
    /// gauges taken from the newest bucket, and maximums maxed across the
    /// window.
    pub fn freeze(&self) -> FrozenBreakerStats {
        let epoch = unix_seconds(self.clock.now());
        let mut inner = self.inner.lock().unwrap();

        // Make sure a bucket exists for the current second so in-flight
        // gauges survive into the snapshot.
        inner.current_bucket(epoch);
        inner.prune(epoch);

        let mut counters: HashMap<EventType, u64> = HashMap::new();
        let mut durations: HashMap<EventType, Vec<Duration>> = HashMap::new();
        let mut currents: HashMap<EventType, i64> = HashMap::new();
        let mut maximums: HashMap<EventType, i64> = HashMap::new();

        for bucket in inner.buckets.values() {
            for (event, count) in &bucket.counters {
                *counters.entry(*event).or_insert(0) += count;
            }

            for (event, samples) in &bucket.durations {
                durations.entry(*event).or_default().extend_from_slice(samples);
            }

            // Ascending iteration: the newest bucket wins.
            for (event, current) in &bucket.currents {
                currents.insert(*event, *current);
            }

            for (event, maximum) in &bucket.maximums {
                let entry = maximums.entry(*event).or_insert(0);
                *entry = (*entry).max(*maximum);
            }
        }

        for samples in durations.values_mut() {
            samples.sort_unstable();
        }

        FrozenBreakerStats {
            config: inner.config,
            state: inner.state,
            counters,
            durations,
            currents,
            maximums,
        }
    }
}

impl StatsInner {
    fn current_bucket(&mut self, epoch: i64) -> &mut Bucket {
        if !self.buckets.contains_key(&epoch) {
            self.prune(epoch);

            let mut bucket = Bucket::default();

            // Carry in-flight gauges across the bucket boundary; the new
            // bucket's maximum starts from the carried value, the only one
            // it has seen.
            if let Some(previous) = self.buckets.values().next_back() {
                bucket.currents = previous.currents.clone();
                bucket.maximums = previous.currents.clone();
            }

            self.buckets.insert(epoch, bucket);
        }

        self.buckets.get_mut(&epoch).expect("bucket just ensured")
    }

    fn prune(&mut self, epoch: i64) {
        let expiry = epoch - STATS_RETENTION.as_secs() as i64;
        let stale: Vec<i64> = self.buckets.range(..=expiry).map(|(ts, _)| *ts).collect();

        for ts in stale {
            // Keep the newest bucket even when stale so gauges never vanish
            // across an idle gap.
            if self.buckets.len() == 1 {
                break;
            }

            self.buckets.remove(&ts);
        }
    }
}

/// An immutable statistics snapshot.
#[derive(Debug)]
pub struct FrozenBreakerStats {
    pub config: BreakerConfig,
    pub state: CircuitState,
    pub counters: HashMap<EventType, u64>,
    pub durations: HashMap<EventType, Vec<Duration>>,
    pub currents: HashMap<EventType, i64>,
    pub maximums: HashMap<EventType, i64>,
}

impl FrozenBreakerStats {
    /// Counter for an event, zero when absent.
    pub fn counter(&self, event: EventType) -> u64 {
        self.counters.get(&event).copied().unwrap_or(0)
    }

    /// Gauge value from the newest bucket, zero when absent.
    pub fn current(&self, event: EventType) -> i64 {
        self.currents.get(&event).copied().unwrap_or(0)
    }

    /// Highest gauge value across the window, zero when absent.
    pub fn maximum(&self, event: EventType) -> i64 {
        self.maximums.get(&event).copied().unwrap_or(0)
    }

    /// Sorted latency samples for an event.
    pub fn samples(&self, event: EventType) -> &[Duration] {
        self.durations.get(&event).map(Vec::as_slice).unwrap_or(&[])
    }
}
