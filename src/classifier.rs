//! Failure interpretation for error filtering
//!
//! An interpreter decides whether an error from the protected operation
//! counts against the breaker. Errors that are the caller's own fault (bad
//! requests, validation problems) can be passed through without moving the
//! breaker toward a trip.

use std::any::Any;
use std::fmt;

/// Decides whether an error should count toward tripping the breaker.
///
/// The error arrives type-erased; implementations downcast to the error
/// types they understand. Timeouts never reach the interpreter - they always
/// count against the breaker.
///
/// # Examples
///
/// ```rust
/// use std::any::Any;
///
/// use fusebox::FailureInterpreter;
///
/// #[derive(Debug)]
/// struct StatusError {
///     status: u16,
/// }
///
/// #[derive(Debug)]
/// struct ServerErrorsOnly;
///
/// impl FailureInterpreter for ServerErrorsOnly {
///     fn should_trip(&self, error: &dyn Any) -> bool {
///         error
///             .downcast_ref::<StatusError>()
///             .map(|e| e.status >= 500)
///             .unwrap_or(true)
///     }
/// }
/// ```
pub trait FailureInterpreter: Send + Sync + fmt::Debug {
    /// Returns `true` when the error counts against the breaker.
    fn should_trip(&self, error: &dyn Any) -> bool;
}

/// Default interpreter: every error counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyErrorInterpreter;

impl FailureInterpreter for AnyErrorInterpreter {
    fn should_trip(&self, _error: &dyn Any) -> bool {
        true
    }
}

/// Closure-backed interpreter for simple filtering patterns.
pub struct PredicateInterpreter<F>
where
    F: Fn(&dyn Any) -> bool + Send + Sync,
{
    predicate: F,
}

impl<F> PredicateInterpreter<F>
where
    F: Fn(&dyn Any) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> FailureInterpreter for PredicateInterpreter<F>
where
    F: Fn(&dyn Any) -> bool + Send + Sync,
{
    fn should_trip(&self, error: &dyn Any) -> bool {
        (self.predicate)(error)
    }
}

impl<F> fmt::Debug for PredicateInterpreter<F>
where
    F: Fn(&dyn Any) -> bool + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredicateInterpreter")
            .field("predicate", &"<closure>")
            .finish()
    }
}
