//! Engine error taxonomy.
//!
//! Kinds, not call sites: every failure in the pipeline maps onto one of
//! these so the ingest thread can stay exception-free. Boundary code wraps
//! unexpected failures into `Internal` with a correlation id and logs them;
//! nothing here ever propagates past the preprocessor entry points.

use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad input from the exchange: dropped, counted, never propagated.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Depth stream discontinuity; the book circuit opens and a fresh
    /// snapshot must be requested.
    #[error("sequence gap: expected next id {expected}, got range ({first}..{last}]")]
    SequenceGap { expected: u64, first: u64, last: u64 },

    /// An external dependency is circuit-open; callers treat the result as
    /// "no information".
    #[error("circuit open: {0}")]
    CircuitOpen(&'static str),

    /// Durable storage failure; retried with backoff, then dead-lettered.
    #[error("storage: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Invalid configuration at startup. Fatal.
    #[error("config: {0}")]
    Config(String),

    /// Invariant violation. The owning detector goes unhealthy and
    /// suppresses emission until reset.
    #[error("internal [corr={correlation_id}]: {message}")]
    Internal { correlation_id: u64, message: String },
}

static CORRELATION_SEQ: AtomicU64 = AtomicU64::new(1);

/// Monotonically increasing correlation id for internal-error logging.
pub fn next_correlation_id() -> u64 {
    CORRELATION_SEQ.fetch_add(1, Ordering::Relaxed)
}

impl EngineError {
    pub fn internal(message: impl Into<String>) -> Self {
        EngineError::Internal {
            correlation_id: next_correlation_id(),
            message: message.into(),
        }
    }

    /// True for failures the storage worker should retry before giving up.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Storage(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_ids_increase() {
        let a = next_correlation_id();
        let b = next_correlation_id();
        assert!(b > a);
    }

    #[test]
    fn only_storage_errors_are_retryable() {
        assert!(EngineError::Storage(rusqlite::Error::InvalidQuery).is_retryable());
        assert!(!EngineError::Validation("x".into()).is_retryable());
        assert!(!EngineError::internal("boom").is_retryable());
    }
}
