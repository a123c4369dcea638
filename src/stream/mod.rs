//! Client-side chunked streaming of large range-query results.
//!
//! The backend returns one complete payload per range query; for big
//! time spans the decoded matrix is memory-hostile to hand over whole.
//! The chunker re-slices an already-decoded matrix into bounded pieces
//! pushed through a bounded channel, and the collector reassembles them
//! on the consumer side. Streaming here is purely a client-side
//! re-chunking; the backend protocol has no streaming of its own.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::QueryError;
use crate::model::{LabelSet, Point, RangeSeries};

/// Configuration for stream chunking.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Maximum points per chunk
    pub chunk_size: usize,

    /// Bounded channel capacity, in chunks
    pub buffer_size: usize,

    /// Collector-side wait per chunk
    pub read_timeout: Duration,

    /// Producer-side wait per emission
    pub write_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            buffer_size: 16,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// One bounded slice of a streamed matrix result.
///
/// Chunk ids are strictly increasing within a stream. Exactly one chunk
/// (the last) carries `is_complete = true`, unless the stream instead
/// terminates early with an `error` chunk.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub chunk_id: u64,
    pub metric: LabelSet,
    pub points: Vec<Point>,
    pub is_complete: bool,
    pub timestamp: DateTime<Utc>,
    pub error: Option<QueryError>,
}

impl StreamChunk {
    fn data(chunk_id: u64, metric: LabelSet, points: Vec<Point>, is_complete: bool) -> Self {
        Self {
            chunk_id,
            metric,
            points,
            is_complete,
            timestamp: Utc::now(),
            error: None,
        }
    }

    fn terminal_error(chunk_id: u64, error: QueryError) -> Self {
        Self {
            chunk_id,
            metric: LabelSet::new(),
            points: Vec::new(),
            is_complete: false,
            timestamp: Utc::now(),
            error: Some(error),
        }
    }
}

/// Re-slices a decoded matrix into bounded chunks on a background task.
pub struct StreamChunker {
    config: StreamConfig,
}

impl StreamChunker {
    pub fn new(config: StreamConfig) -> Self {
        Self { config }
    }

    /// Start streaming `series` as chunks.
    ///
    /// The producer checks `cancel` before every emission and bounds
    /// each data send by `write_timeout`; on either firing it stops
    /// after delivering a terminal error chunk (terminal sends are not
    /// timed, so the consumer always sees the cause). Dropping the
    /// receiver also stops the producer.
    pub fn stream(
        &self,
        series: Vec<RangeSeries>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<StreamChunk> {
        let (tx, rx) = mpsc::channel(self.config.buffer_size.max(1));
        let config = self.config.clone();

        tokio::spawn(async move {
            produce_chunks(series, config, tx, cancel).await;
        });

        rx
    }
}

async fn produce_chunks(
    series: Vec<RangeSeries>,
    config: StreamConfig,
    tx: mpsc::Sender<StreamChunk>,
    cancel: CancellationToken,
) {
    let chunk_size = config.chunk_size.max(1);
    let total_chunks: usize = series
        .iter()
        .map(|s| s.points.chunks(chunk_size).count())
        .sum();

    // An empty matrix still terminates the stream cleanly: one empty
    // complete chunk.
    if total_chunks == 0 {
        let _ = tx
            .send_timeout(
                StreamChunk::data(0, LabelSet::new(), Vec::new(), true),
                config.write_timeout,
            )
            .await;
        return;
    }

    let mut chunk_id: u64 = 0;
    for one_series in series {
        for window in one_series.points.chunks(chunk_size) {
            if cancel.is_cancelled() {
                debug!(chunk_id, "stream cancelled by consumer");
                let _ = tx
                    .send(StreamChunk::terminal_error(chunk_id, QueryError::Cancelled))
                    .await;
                return;
            }

            let is_complete = chunk_id as usize + 1 == total_chunks;
            let chunk = StreamChunk::data(
                chunk_id,
                one_series.metric.clone(),
                window.to_vec(),
                is_complete,
            );

            match tx.send_timeout(chunk, config.write_timeout).await {
                Ok(()) => {}
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    warn!(chunk_id, "stream consumer too slow, terminating");
                    // The channel just proved full, so a timed send here
                    // would drop the terminal chunk. The producer is done
                    // either way; wait as long as it takes to deliver it.
                    // Only a dropped receiver loses it.
                    let _ = tx
                        .send(StreamChunk::terminal_error(
                            chunk_id,
                            QueryError::Timeout(config.write_timeout),
                        ))
                        .await;
                    return;
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    debug!(chunk_id, "stream receiver dropped");
                    return;
                }
            }

            chunk_id += 1;
        }
    }
}

/// Reassembles a chunk stream back into a coherent matrix.
pub struct Collector {
    config: StreamConfig,
}

impl Collector {
    pub fn new(config: StreamConfig) -> Self {
        Self { config }
    }

    /// Drain `rx` until the complete chunk arrives.
    ///
    /// The first error chunk is surfaced as-is; a read timeout, the
    /// cancellation token firing, an id gap, or the channel closing
    /// before completion all fail the collection rather than returning
    /// partial, unmarked data.
    pub async fn collect(
        &self,
        mut rx: mpsc::Receiver<StreamChunk>,
        cancel: CancellationToken,
    ) -> Result<Vec<RangeSeries>, QueryError> {
        let mut series: Vec<RangeSeries> = Vec::new();
        let mut index: HashMap<LabelSet, usize> = HashMap::new();
        let mut expected_id: u64 = 0;

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(QueryError::Cancelled),
                received = tokio::time::timeout(self.config.read_timeout, rx.recv()) => {
                    match received {
                        Err(_) => return Err(QueryError::Timeout(self.config.read_timeout)),
                        Ok(None) => {
                            return Err(QueryError::QueryFailed(
                                "stream ended before the complete chunk".to_string(),
                            ))
                        }
                        Ok(Some(chunk)) => chunk,
                    }
                }
            };

            if let Some(err) = chunk.error {
                return Err(err);
            }
            if chunk.chunk_id != expected_id {
                return Err(QueryError::ParseFailed(format!(
                    "stream chunk id gap: expected {expected_id}, got {}",
                    chunk.chunk_id
                )));
            }
            expected_id += 1;

            if !chunk.points.is_empty() || !chunk.metric.is_empty() {
                let idx = match index.get(&chunk.metric) {
                    Some(&idx) => idx,
                    None => {
                        index.insert(chunk.metric.clone(), series.len());
                        series.push(RangeSeries::new(chunk.metric));
                        series.len() - 1
                    }
                };
                series[idx].points.extend(chunk.points);
            }

            if chunk.is_complete {
                return Ok(series);
            }
        }
    }
}
