//! Clock abstraction for time reads and cancellable delays
//!
//! Breakers, semaphores, trip conditions and statistics all read time through
//! an injected [`Clock`] so that tests can drive them deterministically with
//! a [`VirtualClock`].

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{oneshot, watch};

/// A source of wall-clock time and cancellable one-shot delays.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time.
    fn now(&self) -> SystemTime;

    /// One-shot signal that fires once `duration` has elapsed. Dropping the
    /// receiver abandons the delay.
    fn delay(&self, duration: Duration) -> oneshot::Receiver<()>;
}

/// Truncate a timestamp to whole seconds since the Unix epoch.
pub(crate) fn unix_seconds(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// Production clock backed by the system time and the tokio timer.
///
/// `delay` spawns onto the current tokio runtime, so it must be called from
/// within one.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn delay(&self, duration: Duration) -> oneshot::Receiver<()> {
        let (signal, receiver) = oneshot::channel();

        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = signal.send(());
        });

        receiver
    }
}

/// Manually driven clock for deterministic tests.
///
/// Time only moves when [`advance`](VirtualClock::advance) is called; pending
/// delays whose deadline is reached fire at that point. The durations passed
/// to every `delay` call are recorded for assertions.
#[derive(Debug)]
pub struct VirtualClock {
    state: Mutex<VirtualState>,
    registrations: watch::Sender<usize>,
}

#[derive(Debug)]
struct VirtualState {
    now: SystemTime,
    pending: Vec<PendingDelay>,
    delay_args: Vec<Duration>,
}

#[derive(Debug)]
struct PendingDelay {
    deadline: SystemTime,
    signal: oneshot::Sender<()>,
}

impl VirtualClock {
    pub fn new() -> Self {
        let (registrations, _) = watch::channel(0);

        Self {
            state: Mutex::new(VirtualState {
                now: SystemTime::now(),
                pending: Vec::new(),
                delay_args: Vec::new(),
            }),
            registrations,
        }
    }

    /// Move time forward, firing every delay whose deadline is reached.
    pub fn advance(&self, duration: Duration) {
        let mut state = self.state.lock().unwrap();
        state.now += duration;

        let now = state.now;
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending)
            .into_iter()
            .partition(|delay| delay.deadline <= now);
        state.pending = pending;
        drop(state);

        for delay in due {
            let _ = delay.signal.send(());
        }
    }

    /// Wait until at least one delay is registered, then advance.
    ///
    /// This mirrors the common test sequence of letting a task reach its
    /// timer before firing it.
    pub async fn blocking_advance(&self, duration: Duration) {
        let mut registrations = self.registrations.subscribe();

        loop {
            if !self.state.lock().unwrap().pending.is_empty() {
                break;
            }

            if registrations.changed().await.is_err() {
                break;
            }
        }

        self.advance(duration);
    }

    /// Durations of every `delay` call made so far.
    pub fn delay_args(&self) -> Vec<Duration> {
        self.state.lock().unwrap().delay_args.clone()
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> SystemTime {
        self.state.lock().unwrap().now
    }

    fn delay(&self, duration: Duration) -> oneshot::Receiver<()> {
        let (signal, receiver) = oneshot::channel();

        {
            let mut state = self.state.lock().unwrap();
            state.delay_args.push(duration);

            if duration.is_zero() {
                let _ = signal.send(());
            } else {
                let deadline = state.now + duration;
                state.pending.push(PendingDelay { deadline, signal });
            }
        }

        self.registrations.send_modify(|count| *count += 1);
        receiver
    }
}
