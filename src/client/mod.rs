//! The consumed transport capability.
//!
//! The raw HTTP/JSON transport that executes a single query against the
//! metrics backend lives outside this crate; it is consumed here as the
//! object-safe `QueryClient` trait. Everything in `promgate` wraps an
//! implementation of this trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::QueryError;
use crate::model::{LabelSet, QueryResult};

/// Time parameters of a query, shared by execution and cache keying.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeParams {
    /// Evaluate at a single point in time.
    Instant { at: DateTime<Utc> },

    /// Evaluate repeatedly across a span at a fixed step.
    Range {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    },
}

/// A client able to execute queries against a metrics backend.
///
/// Implementations own request construction, TLS/auth and payload
/// decoding; they report backend-side failures as `QueryError` variants
/// (`ConnectionFailed`, `QueryFailed`, `ParseFailed`).
#[async_trait]
pub trait QueryClient: Send + Sync {
    /// Cheap reachability probe.
    async fn test_connection(&self) -> Result<(), QueryError>;

    /// Evaluate an instant query at `at`.
    async fn query(&self, query: &str, at: DateTime<Utc>) -> Result<QueryResult, QueryError>;

    /// Evaluate a range query from `start` to `end` at `step` resolution.
    async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<QueryResult, QueryError>;

    /// List the label sets of series matching the given matchers.
    async fn series(
        &self,
        matchers: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<LabelSet>, QueryError>;

    /// List all known label names.
    async fn labels(&self) -> Result<Vec<String>, QueryError>;
}
