//! The assembled query stack.
//!
//! [`ResilientClient`] is the cache-aside, breaker-wrapped view of the
//! transport; [`Core`] composes it with the batch executor and stream
//! chunker behind one facade built from [`Config`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::batch::{BatchExecutor, BatchResponse};
use crate::breaker::{BreakerStats, CircuitBreaker};
use crate::cache::key::{self, QueryKind};
use crate::cache::{CacheStats, MetricCache};
use crate::client::{QueryClient, TimeParams};
use crate::config::Config;
use crate::error::QueryError;
use crate::model::{LabelSet, QueryResult, RangeSeries};
use crate::stream::{Collector, StreamChunk, StreamChunker};

/// Combined read-only health document for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub cache: CacheStats,
    pub breaker: BreakerStats,
}

/// Cache-aside, breaker-wrapped view of a [`QueryClient`].
///
/// Instant and range queries go cache-first; on a miss the live call
/// runs under the circuit breaker and the result is written back.
/// Series and label lookups are breaker-wrapped but not cached.
pub struct ResilientClient {
    transport: RwLock<Option<Arc<dyn QueryClient>>>,
    cache: Arc<MetricCache>,
    breaker: Arc<CircuitBreaker>,
}

impl ResilientClient {
    pub fn new(cache: Arc<MetricCache>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            transport: RwLock::new(None),
            cache,
            breaker,
        }
    }

    pub fn set_transport(&self, client: Arc<dyn QueryClient>) {
        *self
            .transport
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(client);
    }

    fn transport(&self) -> Result<Arc<dyn QueryClient>, QueryError> {
        self.transport
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(QueryError::NotConfigured)
    }
}

#[async_trait]
impl QueryClient for ResilientClient {
    async fn test_connection(&self) -> Result<(), QueryError> {
        let transport = self.transport()?;
        self.breaker
            .call(|| async move { transport.test_connection().await })
            .await
    }

    async fn query(&self, query: &str, at: DateTime<Utc>) -> Result<QueryResult, QueryError> {
        let cache_key = key::generate(QueryKind::Instant, query, &TimeParams::Instant { at });
        if let Some(hit) = self.cache.get(&cache_key).await {
            debug!(key = %cache_key, "instant query served from cache");
            return Ok(hit);
        }

        let transport = self.transport()?;
        let result = self
            .breaker
            .call(|| async move { transport.query(query, at).await })
            .await?;

        self.cache.set(cache_key, result.clone(), None).await;
        Ok(result)
    }

    async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<QueryResult, QueryError> {
        let cache_key = key::generate(
            QueryKind::Range,
            query,
            &TimeParams::Range { start, end, step },
        );
        if let Some(hit) = self.cache.get(&cache_key).await {
            debug!(key = %cache_key, "range query served from cache");
            return Ok(hit);
        }

        let transport = self.transport()?;
        let result = self
            .breaker
            .call(|| async move { transport.query_range(query, start, end, step).await })
            .await?;

        self.cache.set(cache_key, result.clone(), None).await;
        Ok(result)
    }

    async fn series(
        &self,
        matchers: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<LabelSet>, QueryError> {
        let transport = self.transport()?;
        self.breaker
            .call(|| async move { transport.series(matchers, start, end).await })
            .await
    }

    async fn labels(&self) -> Result<Vec<String>, QueryError> {
        let transport = self.transport()?;
        self.breaker
            .call(|| async move { transport.labels().await })
            .await
    }
}

/// The resilient query layer: cache, breaker, batch execution and
/// chunked streaming behind one facade.
///
/// Built from [`Config`]; the transport is wired in afterwards with
/// [`Core::set_client`] (queries fail with `NotConfigured` until then).
pub struct Core {
    pub config: Arc<Config>,
    cache: Arc<MetricCache>,
    breaker: Arc<CircuitBreaker>,
    resilient: Arc<ResilientClient>,
    batch: BatchExecutor,
    chunker: StreamChunker,
    collector: Collector,
}

impl Core {
    /// Build the stack from configuration. Must run inside a tokio
    /// runtime (the cache spawns its sweep task).
    pub fn new(config: Config) -> Self {
        Self::build(config, None)
    }

    /// Build the stack with the transport already wired.
    pub fn with_client(config: Config, client: Arc<dyn QueryClient>) -> Self {
        Self::build(config, Some(client))
    }

    fn build(config: Config, client: Option<Arc<dyn QueryClient>>) -> Self {
        let config = Arc::new(config);
        let cache = MetricCache::new(config.cache_config());
        let breaker = Arc::new(CircuitBreaker::new(config.breaker_config("metrics-backend")));

        let resilient = Arc::new(ResilientClient::new(
            Arc::clone(&cache),
            Arc::clone(&breaker),
        ));
        if let Some(client) = client {
            resilient.set_transport(client);
        }

        let batch_client: Arc<dyn QueryClient> = Arc::clone(&resilient) as Arc<dyn QueryClient>;
        let batch = BatchExecutor::new(batch_client, config.batch_config());
        let chunker = StreamChunker::new(config.stream_config());
        let collector = Collector::new(config.stream_config());

        Self {
            config,
            cache,
            breaker,
            resilient,
            batch,
            chunker,
            collector,
        }
    }

    /// Wire (or replace) the transport implementation.
    pub fn set_client(&self, client: Arc<dyn QueryClient>) {
        self.resilient.set_transport(client);
    }

    pub async fn test_connection(&self) -> Result<(), QueryError> {
        self.resilient.test_connection().await
    }

    /// Instant query through the cache-aside path.
    pub async fn query(&self, query: &str, at: DateTime<Utc>) -> Result<QueryResult, QueryError> {
        self.resilient.query(query, at).await
    }

    /// Range query through the cache-aside path.
    pub async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<QueryResult, QueryError> {
        self.resilient.query_range(query, start, end, step).await
    }

    pub async fn series(
        &self,
        matchers: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<LabelSet>, QueryError> {
        self.resilient.series(matchers, start, end).await
    }

    pub async fn labels(&self) -> Result<Vec<String>, QueryError> {
        self.resilient.labels().await
    }

    /// Execute many named queries concurrently; each goes through the
    /// same cache/breaker path as [`Core::query`].
    pub async fn batch_query(
        &self,
        queries: std::collections::HashMap<String, String>,
        at: DateTime<Utc>,
    ) -> BatchResponse {
        self.batch.batch_query(queries, at).await
    }

    /// Range query whose matrix result is handed over as bounded chunks
    /// instead of one large object. Fails with `ParseFailed` if the
    /// backend returns a non-matrix result.
    pub async fn stream_query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamChunk>, QueryError> {
        let result = self.query_range(query, start, end, step).await?;
        let series = match result.value {
            crate::model::QueryValue::Matrix(series) => series,
            other => {
                return Err(QueryError::ParseFailed(format!(
                    "range query returned {:?} instead of a matrix",
                    other.result_type()
                )))
            }
        };

        Ok(self.chunker.stream(series, cancel))
    }

    /// Reassemble a chunk stream produced by [`Core::stream_query_range`].
    pub async fn collect(
        &self,
        rx: mpsc::Receiver<StreamChunk>,
        cancel: CancellationToken,
    ) -> Result<Vec<RangeSeries>, QueryError> {
        self.collector.collect(rx, cancel).await
    }

    /// Invalidate one cached entry by key.
    pub async fn invalidate(&self, cache_key: &str) -> bool {
        self.cache.delete(cache_key).await
    }

    /// Drop every cached result.
    pub async fn clear_cache(&self) {
        self.cache.clear().await
    }

    /// Read-only snapshot of cache and breaker statistics.
    pub async fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            cache: self.cache.stats().await,
            breaker: self.breaker.stats(),
        }
    }

    /// Stop background work (the cache sweeper). Safe to call more
    /// than once.
    pub async fn shutdown(&self) {
        self.cache.stop().await;
    }
}
