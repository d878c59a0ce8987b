#![recursion_limit = "256"]
//! Fusebox - circuit breakers for unreliable collaborators
//!
//! This crate protects calls to remote services, databases and other
//! failure-prone subsystems:
//! - A breaker state machine (closed / open / half-closed) with a sticky
//!   manual trip override
//! - Pluggable trip conditions, failure interpreters, reset backoffs and
//!   clocks
//! - A named registry that multiplexes many breakers, each guarded by a
//!   bounded semaphore with timed acquisition
//! - Rolling per-second statistics with a Hystrix-compatible exporter
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use fusebox::{CallOptions, Registry};
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = Registry::new();
//!
//!     registry
//!         .configure("inventory", |breaker| {
//!             breaker
//!                 .invocation_timeout(Duration::from_millis(250))
//!                 .max_concurrency(32)
//!         })
//!         .unwrap();
//!
//!     let result = registry
//!         .call(
//!             "inventory",
//!             |_cancel| async { fetch_inventory().await },
//!             CallOptions::new().with_fallback(|_err| Ok(Vec::new())),
//!         )
//!         .await;
//!
//!     println!("fetched: {result:?}");
//! }
//!
//! async fn fetch_inventory() -> Result<Vec<String>, std::io::Error> {
//!     Ok(vec!["widget".to_string()])
//! }
//! ```

pub mod backoff;
pub mod builder;
pub mod bulkhead;
pub mod circuit;
pub mod classifier;
pub mod clock;
pub mod collector;
pub mod errors;
pub mod hystrix;
pub mod registry;
pub mod stats;
pub mod trip;

pub use backoff::{Backoff, ConstantBackoff, LinearBackoff};
pub use builder::CircuitBuilder;
pub use bulkhead::BulkheadSemaphore;
pub use circuit::{CircuitBreaker, CircuitState};
pub use classifier::{AnyErrorInterpreter, FailureInterpreter, PredicateInterpreter};
pub use clock::{Clock, SystemClock, VirtualClock};
pub use collector::{
    BreakerConfig, EventType, MetricCollector, MultiCollector, NamedCollector,
    NamedMetricCollector, NoopCollector,
};
pub use errors::BreakerError;
pub use hystrix::HystrixCollector;
pub use registry::{CallOptions, FallbackFn, Registry};
pub use stats::{BreakerStats, FrozenBreakerStats};
pub use trip::{
    ConsecutiveFailureTripCondition, PercentageFailureTripCondition, TripCondition,
    WindowFailureTripCondition,
};
