//! Error types for the collection engine

use std::time::Duration;
use thiserror::Error;

/// Failure of a single paginated list call after breaker and retry policy
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    #[error("failed after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
}

/// Admission failures from the resource pool
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("resource pool acquisition cancelled")]
    Cancelled,

    #[error("resource pool {pool}: insufficient memory (need {requested} bytes, limit {capacity} bytes)")]
    ExceedsCapacity {
        pool: String,
        requested: u64,
        capacity: u64,
    },

    #[error("resource pool {pool}: process memory {resident} bytes above admission threshold {threshold} bytes")]
    MemoryPressure {
        pool: String,
        resident: u64,
        threshold: u64,
    },

    #[error("resource pool closed")]
    Closed,
}

/// Errors surfaced by a collection run
#[derive(Debug, Error)]
pub enum CollectError {
    /// A page fetch failed; `phase` names the list being read
    #[error("failed to fetch {phase}")]
    Fetch {
        phase: &'static str,
        #[source]
        source: FetchError,
    },

    #[error("collection cancelled")]
    Cancelled,

    #[error("collection exceeded its {0:?} deadline")]
    DeadlineExceeded(Duration),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Pool(PoolError),

    /// A worker task panicked or was aborted
    #[error("collection task failed: {0}")]
    Task(String),
}

impl CollectError {
    /// True for caller-driven termination (cancel or deadline), false for backend failures
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded(_))
    }
}

impl From<PoolError> for CollectError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Cancelled => Self::Cancelled,
            other => Self::Pool(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_fetch_error_keeps_cause() {
        let err = CollectError::Fetch {
            phase: "pods",
            source: FetchError::RetriesExhausted {
                attempts: 3,
                source: anyhow::anyhow!("connection refused"),
            },
        };

        assert_eq!(err.to_string(), "failed to fetch pods");
        let fetch = err.source().unwrap();
        assert_eq!(fetch.to_string(), "failed after 3 attempts");
        assert_eq!(fetch.source().unwrap().to_string(), "connection refused");
        assert!(!err.is_cancellation());
    }

    #[test]
    fn test_circuit_open_names_breaker() {
        let err = FetchError::CircuitOpen {
            name: "pod-metrics".to_string(),
        };
        assert!(err.to_string().contains("pod-metrics"));
    }

    #[test]
    fn test_cancellation_kinds() {
        assert!(CollectError::Cancelled.is_cancellation());
        assert!(CollectError::DeadlineExceeded(Duration::from_secs(30)).is_cancellation());
        assert!(!CollectError::InvalidConfig("x".into()).is_cancellation());
        assert!(CollectError::from(PoolError::Cancelled).is_cancellation());
        assert!(matches!(
            CollectError::from(PoolError::Closed),
            CollectError::Pool(PoolError::Closed)
        ));
    }
}
