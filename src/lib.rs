//! promgate - resilient caching query layer for Prometheus-compatible
//! metrics backends
//!
//! Wraps an abstract query transport with a circuit breaker, a
//! TTL-bounded result cache keyed by canonicalized queries, a
//! bounded-concurrency batch executor with retry, and client-side
//! chunked streaming of large range results.

pub mod batch;
pub mod breaker;
pub mod cache;
pub mod client;
pub mod config;
pub mod core;
pub mod error;
pub mod model;
pub mod stream;

pub use crate::core::Core;
pub use client::QueryClient;
pub use config::Config;
pub use error::QueryError;
