//! Bounded-concurrency batch execution of named queries.
//!
//! Many queries are issued at once against the cache/breaker-wrapped
//! client, bounded by a semaphore, each with its own retry loop, all
//! under a single whole-batch deadline. Results are collected as they
//! complete; callers must not assume submission order.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::client::QueryClient;
use crate::error::QueryError;
use crate::model::QueryResult;

/// Initial retry backoff; doubles on each subsequent attempt.
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for batch execution.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum queries in flight at once
    pub max_concurrency: usize,

    /// Deadline for the whole batch
    pub batch_timeout: Duration,

    /// Retries per query after the initial attempt
    pub retry_attempts: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            batch_timeout: Duration::from_secs(30),
            retry_attempts: 3,
        }
    }
}

/// Outcome of a batch call: every submitted name appears in `results`
/// or is accounted for by `error`, never both.
#[derive(Debug)]
pub struct BatchResponse {
    pub results: HashMap<String, QueryResult>,
    pub error: Option<QueryError>,
}

impl BatchResponse {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

/// Issues named queries concurrently with per-query retry and a
/// whole-batch deadline.
pub struct BatchExecutor {
    client: Arc<dyn QueryClient>,
    config: BatchConfig,
}

impl BatchExecutor {
    pub fn new(client: Arc<dyn QueryClient>, config: BatchConfig) -> Self {
        Self { client, config }
    }

    /// Execute every query in `queries` at timestamp `at`.
    ///
    /// On deadline expiry, outstanding workers are aborted and the
    /// response carries whatever succeeded plus a `BatchIncomplete`
    /// error. If all workers finish but some failed, the response
    /// carries the successful subset plus a `BatchPartial` error
    /// wrapping the first failure.
    pub async fn batch_query(
        &self,
        queries: HashMap<String, String>,
        at: DateTime<Utc>,
    ) -> BatchResponse {
        let total = queries.len();
        if total == 0 {
            return BatchResponse {
                results: HashMap::new(),
                error: None,
            };
        }

        let deadline = Instant::now() + self.config.batch_timeout;
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let (tx, mut rx) = mpsc::channel::<(String, Result<QueryResult, QueryError>)>(total);

        let mut workers = Vec::with_capacity(total);
        for (name, query) in queries {
            let client = Arc::clone(&self.client);
            let semaphore = Arc::clone(&semaphore);
            let tx = tx.clone();
            let retry_attempts = self.config.retry_attempts;

            workers.push(tokio::spawn(async move {
                // Holding the permit for the whole retry loop keeps the
                // concurrency bound on actual backend pressure.
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let outcome =
                    query_with_retry(client.as_ref(), &query, at, retry_attempts, deadline).await;
                let _ = tx.send((name, outcome)).await;
            }));
        }
        drop(tx);

        let mut results = HashMap::new();
        let mut failures: Vec<(String, QueryError)> = Vec::new();
        let mut deadline_hit = false;

        loop {
            tokio::select! {
                received = rx.recv() => {
                    match received {
                        Some((name, Ok(result))) => {
                            results.insert(name, result);
                        }
                        Some((name, Err(err))) => {
                            debug!(query = %name, error = %err, "batch query failed");
                            failures.push((name, err));
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    deadline_hit = true;
                    break;
                }
            }
        }

        if deadline_hit {
            let completed = results.len() + failures.len();
            warn!(completed, total, "batch deadline elapsed, aborting remaining queries");
            for worker in &workers {
                worker.abort();
            }
            return BatchResponse {
                results,
                error: Some(QueryError::BatchIncomplete { completed, total }),
            };
        }

        let error = failures.into_iter().next().map(|(first_query, source)| {
            // Only the first failure is surfaced in detail; the count
            // tells callers how much else went wrong.
            QueryError::BatchPartial {
                failed: total - results.len(),
                total,
                first_query,
                source: Box::new(source),
            }
        });

        BatchResponse { results, error }
    }
}

/// One query with exponential backoff, aborting rather than sleeping
/// past the deadline.
async fn query_with_retry(
    client: &dyn QueryClient,
    query: &str,
    at: DateTime<Utc>,
    retry_attempts: u32,
    deadline: Instant,
) -> Result<QueryResult, QueryError> {
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt: u32 = 0;

    loop {
        match client.query(query, at).await {
            Ok(result) => return Ok(result),
            Err(err) => {
                if attempt >= retry_attempts || !err.is_retryable() {
                    return Err(err);
                }
                if Instant::now() + backoff >= deadline {
                    debug!(query, "deadline too close to retry");
                    return Err(err);
                }

                attempt += 1;
                debug!(query, attempt, backoff_ms = backoff.as_millis() as u64, "retrying query");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Point, QueryValue};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Client whose queries fail a scripted number of times, then succeed.
    struct FlakyClient {
        fail_first: u32,
        calls: AtomicU32,
        delay: Duration,
    }

    impl FlakyClient {
        fn new(fail_first: u32) -> Self {
            Self {
                fail_first,
                calls: AtomicU32::new(0),
                delay: Duration::ZERO,
            }
        }

        fn slow(fail_first: u32, delay: Duration) -> Self {
            Self {
                fail_first,
                calls: AtomicU32::new(0),
                delay,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl QueryClient for FlakyClient {
        async fn test_connection(&self) -> Result<(), QueryError> {
            Ok(())
        }

        async fn query(&self, query: &str, _at: DateTime<Utc>) -> Result<QueryResult, QueryError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(QueryError::ConnectionFailed("flaky".into()));
            }
            if query == "always_fails" {
                return Err(QueryError::QueryFailed("bad expression".into()));
            }
            Ok(QueryResult::new(QueryValue::Scalar(Point {
                timestamp: 0.0,
                value: 1.0,
            })))
        }

        async fn query_range(
            &self,
            _query: &str,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
            _step: Duration,
        ) -> Result<QueryResult, QueryError> {
            unimplemented!("not used in batch tests")
        }

        async fn series(
            &self,
            _matchers: &[String],
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<Vec<crate::model::LabelSet>, QueryError> {
            unimplemented!("not used in batch tests")
        }

        async fn labels(&self) -> Result<Vec<String>, QueryError> {
            unimplemented!("not used in batch tests")
        }
    }

    fn queries(names: &[&str]) -> HashMap<String, String> {
        names
            .iter()
            .map(|n| (n.to_string(), format!("up{{job=\"{n}\"}}")))
            .collect()
    }

    #[tokio::test]
    async fn test_empty_batch_returns_immediately() {
        let executor = BatchExecutor::new(Arc::new(FlakyClient::new(0)), BatchConfig::default());
        let response = executor.batch_query(HashMap::new(), Utc::now()).await;
        assert!(response.results.is_empty());
        assert!(response.is_complete());
    }

    #[tokio::test]
    async fn test_retry_until_success_counts_attempts() {
        let client = Arc::new(FlakyClient::new(2));
        let executor = BatchExecutor::new(
            Arc::clone(&client) as Arc<dyn QueryClient>,
            BatchConfig {
                retry_attempts: 2,
                ..BatchConfig::default()
            },
        );

        let response = executor.batch_query(queries(&["cpu"]), Utc::now()).await;
        assert!(response.is_complete());
        assert_eq!(response.results.len(), 1);
        // Two failures plus the final success.
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn test_partial_failure_reports_first_query() {
        let client = Arc::new(FlakyClient::new(0));
        let executor = BatchExecutor::new(
            client as Arc<dyn QueryClient>,
            BatchConfig {
                retry_attempts: 1,
                ..BatchConfig::default()
            },
        );

        let mut batch = queries(&["cpu", "mem"]);
        batch.insert("bad".to_string(), "always_fails".to_string());

        let response = executor.batch_query(batch, Utc::now()).await;
        assert_eq!(response.results.len(), 2);
        assert!(!response.results.contains_key("bad"));
        match response.error {
            Some(QueryError::BatchPartial {
                failed,
                total,
                ref first_query,
                ..
            }) => {
                assert_eq!(failed, 1);
                assert_eq!(total, 3);
                assert_eq!(first_query, "bad");
            }
            other => panic!("expected BatchPartial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_backend_rejected_query_is_not_retried() {
        let client = Arc::new(FlakyClient::new(0));
        let executor = BatchExecutor::new(
            Arc::clone(&client) as Arc<dyn QueryClient>,
            BatchConfig {
                retry_attempts: 3,
                ..BatchConfig::default()
            },
        );

        let batch: HashMap<String, String> =
            [("bad".to_string(), "always_fails".to_string())].into();
        let response = executor.batch_query(batch, Utc::now()).await;

        assert!(!response.is_complete());
        // Deterministic failure: one attempt, no backoff burned.
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_deadline_returns_partial_results() {
        let client = Arc::new(FlakyClient::slow(0, Duration::from_millis(200)));
        let executor = BatchExecutor::new(
            client as Arc<dyn QueryClient>,
            BatchConfig {
                max_concurrency: 1,
                batch_timeout: Duration::from_millis(300),
                retry_attempts: 0,
            },
        );

        let response = executor
            .batch_query(queries(&["a", "b", "c", "d"]), Utc::now())
            .await;

        match response.error {
            Some(QueryError::BatchIncomplete { completed, total }) => {
                assert_eq!(total, 4);
                assert!(completed < total);
                assert_eq!(response.results.len(), completed);
            }
            other => panic!("expected BatchIncomplete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        struct GaugeClient {
            current: AtomicU32,
            peak: AtomicU32,
        }

        #[async_trait]
        impl QueryClient for GaugeClient {
            async fn test_connection(&self) -> Result<(), QueryError> {
                Ok(())
            }

            async fn query(
                &self,
                _query: &str,
                _at: DateTime<Utc>,
            ) -> Result<QueryResult, QueryError> {
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.current.fetch_sub(1, Ordering::SeqCst);
                Ok(QueryResult::new(QueryValue::Scalar(Point {
                    timestamp: 0.0,
                    value: 0.0,
                })))
            }

            async fn query_range(
                &self,
                _q: &str,
                _s: DateTime<Utc>,
                _e: DateTime<Utc>,
                _st: Duration,
            ) -> Result<QueryResult, QueryError> {
                unimplemented!()
            }

            async fn series(
                &self,
                _m: &[String],
                _s: DateTime<Utc>,
                _e: DateTime<Utc>,
            ) -> Result<Vec<crate::model::LabelSet>, QueryError> {
                unimplemented!()
            }

            async fn labels(&self) -> Result<Vec<String>, QueryError> {
                unimplemented!()
            }
        }

        let client = Arc::new(GaugeClient {
            current: AtomicU32::new(0),
            peak: AtomicU32::new(0),
        });
        let executor = BatchExecutor::new(
            Arc::clone(&client) as Arc<dyn QueryClient>,
            BatchConfig {
                max_concurrency: 2,
                ..BatchConfig::default()
            },
        );

        let response = executor
            .batch_query(queries(&["a", "b", "c", "d", "e", "f"]), Utc::now())
            .await;
        assert!(response.is_complete());
        assert_eq!(response.results.len(), 6);
        assert!(client.peak.load(Ordering::SeqCst) <= 2);
    }
}
