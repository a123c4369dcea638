use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::batch::BatchConfig;
use crate::breaker::BreakerConfig;
use crate::cache::CacheConfig;
use crate::stream::StreamConfig;

/// Metrics backend connection settings, handed to whichever transport
/// implementation gets wired in as the query client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend base URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Result cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    /// Default TTL in seconds for entries inserted without an explicit one
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,

    /// Maximum number of cached entries
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,

    /// Interval in seconds between background expiry sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_cache_ttl() -> u64 {
    60
}

fn default_cache_max_size() -> usize {
    1000
}

fn default_sweep_interval() -> u64 {
    30
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_cache_ttl(),
            max_size: default_cache_max_size(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSection {
    /// Trial calls allowed while half-open
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// Closed-state rolling window in seconds (0 disables the rollover)
    #[serde(default = "default_breaker_interval")]
    pub interval_secs: u64,

    /// Seconds to stay open before admitting trial calls
    #[serde(default = "default_breaker_timeout")]
    pub timeout_secs: u64,

    /// Consecutive failures that trip the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_max_requests() -> u32 {
    1
}

fn default_breaker_interval() -> u64 {
    60
}

fn default_breaker_timeout() -> u64 {
    30
}

fn default_failure_threshold() -> u32 {
    5
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            interval_secs: default_breaker_interval(),
            timeout_secs: default_breaker_timeout(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

/// Batch execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSection {
    /// Maximum queries in flight at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Whole-batch deadline in seconds
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout_secs: u64,

    /// Retries per query after the initial attempt
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
}

fn default_max_concurrency() -> usize {
    10
}

fn default_batch_timeout() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    3
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            batch_timeout_secs: default_batch_timeout(),
            retry_attempts: default_retry_attempts(),
        }
    }
}

/// Streaming settings for large range results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSection {
    /// Maximum points per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Bounded channel capacity, in chunks
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Collector-side wait per chunk, in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Producer-side wait per emission, in seconds
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
}

fn default_chunk_size() -> usize {
    1000
}

fn default_buffer_size() -> usize {
    16
}

fn default_read_timeout() -> u64 {
    30
}

fn default_write_timeout() -> u64 {
    5
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            buffer_size: default_buffer_size(),
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub cache: CacheSection,

    #[serde(default)]
    pub breaker: BreakerSection,

    #[serde(default)]
    pub batch: BatchSection,

    #[serde(default)]
    pub stream: StreamSection,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            default_ttl: Duration::from_secs(self.cache.default_ttl_secs),
            max_size: self.cache.max_size,
            sweep_interval: Duration::from_secs(self.cache.sweep_interval_secs),
        }
    }

    pub fn breaker_config(&self, name: impl Into<String>) -> BreakerConfig {
        BreakerConfig {
            name: name.into(),
            max_requests: self.breaker.max_requests,
            interval: Duration::from_secs(self.breaker.interval_secs),
            timeout: Duration::from_secs(self.breaker.timeout_secs),
            failure_threshold: self.breaker.failure_threshold,
        }
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            max_concurrency: self.batch.max_concurrency,
            batch_timeout: Duration::from_secs(self.batch.batch_timeout_secs),
            retry_attempts: self.batch.retry_attempts,
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            chunk_size: self.stream.chunk_size,
            buffer_size: self.stream.buffer_size,
            read_timeout: Duration::from_secs(self.stream.read_timeout_secs),
            write_timeout: Duration::from_secs(self.stream.write_timeout_secs),
        }
    }
}

/// Load configuration from a YAML file.
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Load configuration from environment variables.
///
/// Every setting is optional and falls back to its default:
/// - PROMGATE_URL
/// - PROMGATE_REQUEST_TIMEOUT
/// - PROMGATE_CACHE_TTL / PROMGATE_CACHE_MAX_SIZE / PROMGATE_CACHE_SWEEP_INTERVAL
/// - PROMGATE_BREAKER_MAX_REQUESTS / PROMGATE_BREAKER_INTERVAL /
///   PROMGATE_BREAKER_TIMEOUT / PROMGATE_BREAKER_FAILURE_THRESHOLD
/// - PROMGATE_BATCH_CONCURRENCY / PROMGATE_BATCH_TIMEOUT / PROMGATE_BATCH_RETRIES
/// - PROMGATE_STREAM_CHUNK_SIZE / PROMGATE_STREAM_BUFFER_SIZE
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = Config::new();

    if let Ok(url) = std::env::var("PROMGATE_URL") {
        if !url.trim().is_empty() {
            config.backend.url = Some(url.trim().to_string());
        }
    }

    set_parsed(&mut config.backend.request_timeout_secs, "PROMGATE_REQUEST_TIMEOUT");

    set_parsed(&mut config.cache.default_ttl_secs, "PROMGATE_CACHE_TTL");
    set_parsed(&mut config.cache.max_size, "PROMGATE_CACHE_MAX_SIZE");
    set_parsed(&mut config.cache.sweep_interval_secs, "PROMGATE_CACHE_SWEEP_INTERVAL");

    set_parsed(&mut config.breaker.max_requests, "PROMGATE_BREAKER_MAX_REQUESTS");
    set_parsed(&mut config.breaker.interval_secs, "PROMGATE_BREAKER_INTERVAL");
    set_parsed(&mut config.breaker.timeout_secs, "PROMGATE_BREAKER_TIMEOUT");
    set_parsed(
        &mut config.breaker.failure_threshold,
        "PROMGATE_BREAKER_FAILURE_THRESHOLD",
    );

    set_parsed(&mut config.batch.max_concurrency, "PROMGATE_BATCH_CONCURRENCY");
    set_parsed(&mut config.batch.batch_timeout_secs, "PROMGATE_BATCH_TIMEOUT");
    set_parsed(&mut config.batch.retry_attempts, "PROMGATE_BATCH_RETRIES");

    set_parsed(&mut config.stream.chunk_size, "PROMGATE_STREAM_CHUNK_SIZE");
    set_parsed(&mut config.stream.buffer_size, "PROMGATE_STREAM_BUFFER_SIZE");

    Ok(config)
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, var: &str) {
    if let Ok(raw) = std::env::var(var) {
        if let Ok(val) = raw.parse() {
            *slot = val;
        }
    }
}

/// Load configuration from file or environment.
///
/// Tries the YAML file when a path is given, otherwise falls back to
/// environment variables.
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    if let Some(path) = config_path {
        load_from_yaml(path)
    } else {
        load_from_env()
    }
}
