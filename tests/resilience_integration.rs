//! Integration tests for the resilient query stack.
//!
//! These tests drive the cache, circuit breaker, batch executor and
//! stream chunker together through the `Core` facade against a
//! scripted in-memory query client.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use promgate::client::QueryClient;
use promgate::config::{BreakerSection, CacheSection, Config};
use promgate::error::QueryError;
use promgate::model::{LabelSet, Point, QueryResult, QueryValue, RangeSeries};
use promgate::Core;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Scripted backend: fails while `healthy` is false, counts every call,
/// and serves a fixed matrix for range queries.
struct ScriptedClient {
    healthy: AtomicBool,
    calls: AtomicU32,
    matrix_points: usize,
}

impl ScriptedClient {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            healthy: AtomicBool::new(true),
            calls: AtomicU32::new(0),
            matrix_points: 2500,
        })
    }

    fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), QueryError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueryError::ConnectionFailed("backend down".into()))
        }
    }

    fn matrix(&self) -> Vec<RangeSeries> {
        vec![RangeSeries {
            metric: [("__name__".to_string(), "node_cpu".to_string())].into(),
            points: (0..self.matrix_points)
                .map(|i| Point {
                    timestamp: i as f64,
                    value: i as f64,
                })
                .collect(),
        }]
    }
}

#[async_trait]
impl QueryClient for ScriptedClient {
    async fn test_connection(&self) -> Result<(), QueryError> {
        self.check()
    }

    async fn query(&self, _query: &str, _at: DateTime<Utc>) -> Result<QueryResult, QueryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
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
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(QueryResult::new(QueryValue::Matrix(self.matrix())))
    }

    async fn series(
        &self,
        _matchers: &[String],
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<LabelSet>, QueryError> {
        self.check()?;
        Ok(Vec::new())
    }

    async fn labels(&self) -> Result<Vec<String>, QueryError> {
        self.check()?;
        Ok(vec!["job".to_string(), "instance".to_string()])
    }
}

fn fast_breaker_config() -> Config {
    Config {
        breaker: BreakerSection {
            max_requests: 1,
            interval_secs: 60,
            timeout_secs: 1,
            failure_threshold: 3,
        },
        ..Config::default()
    }
}

#[tokio::test]
async fn test_breaker_trips_and_recovers_through_core() {
    init_tracing();
    let client = ScriptedClient::new();
    let core = Core::with_client(
        fast_breaker_config(),
        Arc::clone(&client) as Arc<dyn QueryClient>,
    );

    client.set_healthy(false);
    for _ in 0..3 {
        let _ = core.query("up", Utc::now()).await;
    }

    // Circuit is open: the backend is no longer invoked.
    let calls_before = client.calls();
    let result = core.query("up", Utc::now()).await;
    assert!(matches!(result, Err(QueryError::CircuitOpen(_))));
    assert_eq!(client.calls(), calls_before);

    let status = core.status().await;
    assert_eq!(serde_json::to_value(&status).unwrap()["breaker"]["state"], "Open");

    // After the open timeout one healthy trial closes the circuit.
    client.set_healthy(true);
    tokio::time::sleep(Duration::from_millis(1100)).await;
    // A fresh minute bucket would still hit the cache from before the
    // outage, so use a distinct query.
    core.query("up{job=\"recovered\"}", Utc::now()).await.unwrap();
    assert_eq!(
        serde_json::to_value(&core.status().await).unwrap()["breaker"]["state"],
        "Closed"
    );

    core.shutdown().await;
}

#[tokio::test]
async fn test_cache_serves_during_backend_outage_window() {
    let client = ScriptedClient::new();
    let core = Core::with_client(
        Config {
            cache: CacheSection {
                default_ttl_secs: 60,
                max_size: 100,
                sweep_interval_secs: 30,
            },
            ..fast_breaker_config()
        },
        Arc::clone(&client) as Arc<dyn QueryClient>,
    );

    let at = Utc::now();
    core.query("up", at).await.unwrap();
    assert_eq!(client.calls(), 1);

    // The backend dies, but the identical query is still answered.
    client.set_healthy(false);
    let result = core.query("up", at).await.unwrap();
    assert_eq!(
        result.value,
        QueryValue::Scalar(Point {
            timestamp: 0.0,
            value: 1.0
        })
    );
    assert_eq!(client.calls(), 1);

    core.shutdown().await;
}

#[tokio::test]
async fn test_batch_query_resolves_every_name() {
    let client = ScriptedClient::new();
    let core = Core::with_client(Config::default(), client as Arc<dyn QueryClient>);

    let queries: HashMap<String, String> = [
        ("cpu", "rate(node_cpu_seconds_total[5m])"),
        ("mem", "node_memory_MemAvailable_bytes"),
        ("disk", "node_filesystem_avail_bytes"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    let response = core.batch_query(queries, Utc::now()).await;
    assert!(response.is_complete());
    assert_eq!(response.results.len(), 3);
    assert!(response.results.contains_key("cpu"));
    assert!(response.results.contains_key("mem"));
    assert!(response.results.contains_key("disk"));

    core.shutdown().await;
}

#[tokio::test]
async fn test_batch_queries_share_the_cache() {
    let client = ScriptedClient::new();
    let mut config = Config::default();
    // Serialize the workers so the second lookup sees the first's
    // write-back instead of racing it.
    config.batch.max_concurrency = 1;
    let core = Core::with_client(config, Arc::clone(&client) as Arc<dyn QueryClient>);

    let at = Utc::now();
    // Two names, same canonical query: only one live call expected.
    let queries: HashMap<String, String> = [
        ("first".to_string(), "up{job=\"node\"}".to_string()),
        ("second".to_string(), "up{ job=\"node\" }".to_string()),
    ]
    .into();

    let response = core.batch_query(queries, at).await;
    assert!(response.is_complete());
    assert_eq!(response.results.len(), 2);
    assert_eq!(client.calls(), 1);

    core.shutdown().await;
}

#[tokio::test]
async fn test_stream_round_trip_through_core() {
    let client = ScriptedClient::new();
    let core = Core::with_client(Config::default(), client as Arc<dyn QueryClient>);

    let now = Utc::now();
    let rx = core
        .stream_query_range(
            "rate(node_cpu_seconds_total[5m])",
            now - chrono::Duration::hours(1),
            now,
            Duration::from_secs(15),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let collected = core.collect(rx, CancellationToken::new()).await.unwrap();
    assert_eq!(collected.len(), 1);
    assert_eq!(collected[0].points.len(), 2500);
    // Points come back in original order with nothing lost.
    assert_eq!(collected[0].points.first().unwrap().timestamp, 0.0);
    assert_eq!(collected[0].points.last().unwrap().timestamp, 2499.0);

    core.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let core = Core::new(Config::default());
    core.shutdown().await;
    core.shutdown().await;
}
