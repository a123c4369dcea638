//! Error taxonomy shared by every layer of the query stack.
//!
//! One enum rather than per-module errors: the cache, breaker, batch
//! executor and stream all surface the same caller-facing failures, and
//! downstream consumers match on the variant to decide whether to retry,
//! back off, or give up.

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the resilient query layer.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    /// No query client has been wired into the core.
    #[error("no query client configured")]
    NotConfigured,

    /// Could not reach the metrics backend at all.
    #[error("connection to metrics backend failed: {0}")]
    ConnectionFailed(String),

    /// The backend answered with a non-success status.
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// A deadline elapsed before the operation finished.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The caller's cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The circuit breaker refused the call without invoking it.
    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),

    /// The backend payload could not be decoded into a typed result.
    #[error("failed to parse backend response: {0}")]
    ParseFailed(String),

    /// A soft limit was hit (cache or queue at capacity). Informational,
    /// never fatal on its own.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// The batch deadline elapsed with work still outstanding.
    #[error("batch deadline elapsed with {completed} of {total} queries completed")]
    BatchIncomplete { completed: usize, total: usize },

    /// Every batch worker finished but some queries failed.
    #[error("{failed} of {total} batch queries failed, first was '{first_query}': {source}")]
    BatchPartial {
        failed: usize,
        total: usize,
        first_query: String,
        #[source]
        source: Box<QueryError>,
    },
}

impl QueryError {
    /// Whether the batch executor's per-query retry loop should try again.
    ///
    /// Connection loss and timeouts are transient; an open circuit might
    /// heal between attempts (its timeout can elapse). A backend-reported
    /// query failure is deterministic, the same expression fails the same
    /// way, so retrying it only burns backoff time.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QueryError::ConnectionFailed(_)
                | QueryError::Timeout(_)
                | QueryError::CircuitOpen(_)
        )
    }
}
