//! Error types for protected calls and registry management

use std::error::Error;
use std::fmt;

/// Errors surfaced by breakers and registries.
///
/// The `Operation` variant carries the protected operation's own error
/// unchanged; everything else is produced locally. Nothing is retried
/// internally - a registry fallback is the only recovery hook.
#[derive(Debug)]
pub enum BreakerError<E = Box<dyn Error + Send + Sync>> {
    /// Admission was denied by the breaker state.
    CircuitOpen,
    /// The invocation timer elapsed before the operation produced a result.
    InvocationTimeout,
    /// The semaphore wait timed out before a token became available.
    MaxConcurrency,
    /// A breaker with this name is already registered.
    AlreadyConfigured,
    /// No breaker with this name has been registered.
    Unconfigured,
    /// The protected operation failed.
    Operation(E),
}

impl<E: fmt::Display> fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerError::CircuitOpen => write!(f, "circuit is open"),
            BreakerError::InvocationTimeout => write!(f, "invocation has timed out"),
            BreakerError::MaxConcurrency => write!(f, "breaker is at max concurrency"),
            BreakerError::AlreadyConfigured => write!(f, "breaker is already configured"),
            BreakerError::Unconfigured => write!(f, "breaker not configured"),
            BreakerError::Operation(e) => write!(f, "protected operation failed: {}", e),
        }
    }
}

impl<E: Error + 'static> Error for BreakerError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BreakerError::Operation(e) => Some(e),
            _ => None,
        }
    }
}
