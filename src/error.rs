//! Error types for query orchestration.
//!
//! `QueryError` is the structured taxonomy surfaced to callers. It is `Clone`
//! so one leaseholder's failure can be handed to every waiter on the same
//! fingerprint.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    /// Non-fatal; the classifier degrades to free text instead of returning this.
    #[error("Query classification ambiguous: {0}")]
    ClassificationAmbiguous(String),

    #[error("Invalid structured filter: {0}")]
    InvalidFilter(String),

    #[error("Context store unavailable: {0}")]
    RetrievalUnavailable(String),

    #[error("Insufficient context: {0}")]
    InsufficientContext(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Cancellation requested")]
    CancellationRequested,

    #[error("Lease expired before the answer was produced")]
    LeaseExpired,

    #[error("Unknown stream handle: {0}")]
    UnknownStream(String),
}

impl QueryError {
    /// Whether the caller may resubmit the same query unchanged.
    pub fn is_retry_safe(&self) -> bool {
        matches!(
            self,
            QueryError::RetrievalUnavailable(_)
                | QueryError::GenerationFailed(_)
                | QueryError::LeaseExpired
                | QueryError::InsufficientContext(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;

/// Failures at the Context Store boundary
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store request timed out after {0}ms")]
    Timeout(u64),

    #[error("Invalid store request: {0}")]
    InvalidRequest(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_safety_follows_taxonomy() {
        assert!(QueryError::GenerationFailed("llm 500".into()).is_retry_safe());
        assert!(QueryError::LeaseExpired.is_retry_safe());
        assert!(!QueryError::InvalidFilter("lat".into()).is_retry_safe());
        assert!(!QueryError::CancellationRequested.is_retry_safe());
    }

    #[test]
    fn errors_display_detail() {
        let err = QueryError::InvalidFilter("latitude 95 out of range".into());
        assert!(err.to_string().contains("latitude 95"));
        let err = StoreError::Timeout(250);
        assert!(err.to_string().contains("250ms"));
    }
}
