//! Error types for the resilience layer.

use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Result type for circuit breaker operations.
pub type BreakerResult<T, E> = Result<T, BreakerError<E>>;

/// Error type for circuit breaker operations.
#[derive(Debug)]
pub enum BreakerError<E> {
    /// The circuit is open (or every half-open trial slot is taken), so the
    /// operation was never started.
    Open,

    /// The operation did not complete within the configured request timeout.
    Timeout(Duration),

    /// The underlying operation failed.
    Operation(E),
}

impl<E> BreakerError<E> {
    /// True when the call was refused without running the operation.
    pub fn is_rejection(&self) -> bool {
        matches!(self, BreakerError::Open)
    }

    /// Returns the operation error, if any.
    pub fn into_operation(self) -> Option<E> {
        match self {
            BreakerError::Operation(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> Display for BreakerError<E>
where
    E: Display,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BreakerError::Open => write!(f, "Circuit breaker is open"),
            BreakerError::Timeout(d) => write!(f, "Operation timed out after {}ms", d.as_millis()),
            BreakerError::Operation(e) => write!(f, "Operation error: {}", e),
        }
    }
}

impl<E: Error + 'static> Error for BreakerError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BreakerError::Open => None,
            BreakerError::Timeout(_) => None,
            BreakerError::Operation(e) => Some(e),
        }
    }
}

/// Errors raised by queue adapters.
#[derive(Error, Debug)]
pub enum QueueError {
    /// A message could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The queue no longer accepts messages.
    #[error("Queue is closed")]
    Closed,

    /// No dead letter has the given message id.
    #[error("Dead letter not found: {0}")]
    DeadLetterNotFound(Uuid),

    /// The backing store failed.
    #[error("Queue backend error: {0}")]
    Backend(String),

    /// The adapter was configured with unusable values.
    #[error("Configuration error: {0}")]
    Config(String),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        QueueError::Backend(e.to_string())
    }
}

/// Errors raised by event persistence stores.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// No record has the given id.
    #[error("Persisted event not found: {0}")]
    NotFound(Uuid),

    /// The store failed.
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Errors raised while loading runtime settings.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// A source could not be read or deserialized.
    #[error("Failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    /// Values were read but cannot be used.
    #[error("Invalid settings: {0}")]
    Invalid(String),
}

/// Top-level error for starting and stopping the resilience layer.
#[derive(Error, Debug)]
pub enum ResilienceError {
    /// Settings were rejected.
    #[error(transparent)]
    Settings(#[from] SettingsError),

    /// The event queue failed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Event persistence failed.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Upstream;

    impl Display for Upstream {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            write!(f, "upstream refused")
        }
    }

    impl Error for Upstream {}

    #[test]
    fn operation_error_exposes_source() {
        let err = BreakerError::Operation(Upstream);
        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "Operation error: upstream refused");
    }

    #[test]
    fn timeout_message_includes_bound() {
        let err: BreakerError<Upstream> = BreakerError::Timeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "Operation timed out after 250ms");
        assert!(!err.is_rejection());
    }
}
