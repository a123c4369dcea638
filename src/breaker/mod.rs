//! Circuit breaker isolating the metrics backend.
//!
//! This module implements a circuit breaker with three states:
//! - Closed: normal operation, calls pass through and counts accumulate
//! - Open: backend assumed down, calls fail fast without being invoked
//! - HalfOpen: testing recovery, a bounded number of trial calls allowed
//!
//! Every state transition and every closed-window rollover increments a
//! generation counter. A call captures the generation at admission; if
//! the breaker has moved on by the time the call completes, the
//! completion is dropped instead of corrupting the new generation's
//! counts. This replaces per-call identity tracking with a plain epoch
//! compare.

use futures::FutureExt;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::QueryError;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,

    /// Backend assumed down, calls rejected until the timeout elapses
    Open,

    /// Testing recovery, limited trial calls allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open => "Open",
            CircuitState::HalfOpen => "HalfOpen",
        };
        f.write_str(name)
    }
}

/// Call counts for the current generation.
///
/// A success zeroes `consecutive_failures`; a failure zeroes
/// `consecutive_successes`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests += 1;
    }

    fn on_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }

    fn clear(&mut self) {
        *self = Counts::default();
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Name carried in errors, logs and the state-change hook
    pub name: String,

    /// Maximum concurrent trial calls in HalfOpen; also the number of
    /// consecutive trial successes needed to close the circuit
    pub max_requests: u32,

    /// Rolling window in Closed after which counts reset and the
    /// generation advances; zero disables the rollover
    pub interval: Duration,

    /// How long to stay Open before admitting trial calls
    pub timeout: Duration,

    /// Consecutive failures that trip the default `ready_to_trip`
    pub failure_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            name: "backend".to_string(),
            max_requests: 1,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            failure_threshold: 5,
        }
    }
}

/// Read-only breaker statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_failures: u32,
}

type TripPredicate = Box<dyn Fn(&Counts) -> bool + Send + Sync>;
type StateChangeHook = Box<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

type Transition = (CircuitState, CircuitState);

struct Inner {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    /// Closed: next rolling-window reset. Open: when trials may begin.
    expiry: Option<Instant>,
}

/// Failure-isolating wrapper around calls to the metrics backend.
pub struct CircuitBreaker {
    name: String,
    max_requests: u32,
    interval: Duration,
    timeout: Duration,
    ready_to_trip: TripPredicate,
    on_state_change: Option<StateChangeHook>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let threshold = config.failure_threshold.max(1);
        let expiry = if config.interval.is_zero() {
            None
        } else {
            Some(Instant::now() + config.interval)
        };

        Self {
            name: config.name,
            max_requests: config.max_requests.max(1),
            interval: config.interval,
            timeout: config.timeout,
            ready_to_trip: Box::new(move |counts| counts.consecutive_failures >= threshold),
            on_state_change: None,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
            }),
        }
    }

    /// Replace the default trip predicate.
    pub fn with_ready_to_trip<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Counts) -> bool + Send + Sync + 'static,
    {
        self.ready_to_trip = Box::new(predicate);
        self
    }

    /// Observe state transitions as `(name, from, to)`.
    pub fn with_on_state_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Box::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `work` under the breaker.
    ///
    /// Fails fast with `CircuitOpen` while the circuit is Open or the
    /// HalfOpen trial budget is spent. A panic inside `work` records a
    /// failure before resuming the unwind.
    pub async fn call<T, F, Fut>(&self, work: F) -> Result<T, QueryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, QueryError>>,
    {
        let (transition, admitted) = self.admit();
        self.fire(transition);
        let generation = admitted?;

        match AssertUnwindSafe(work()).catch_unwind().await {
            Ok(Ok(value)) => {
                self.fire(self.settle(generation, true));
                Ok(value)
            }
            Ok(Err(err)) => {
                self.fire(self.settle(generation, false));
                Err(err)
            }
            Err(panic) => {
                warn!(breaker = %self.name, "wrapped call panicked, recorded as failure");
                self.fire(self.settle(generation, false));
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Current state, accounting for an elapsed Open timeout.
    pub fn state(&self) -> CircuitState {
        let (transition, state) = {
            let mut inner = self.lock();
            let transition = self.refresh(&mut inner, Instant::now());
            (transition, inner.state)
        };
        self.fire(transition);
        state
    }

    /// Copy of the current generation's counts.
    pub fn counts(&self) -> Counts {
        let (transition, counts) = {
            let mut inner = self.lock();
            let transition = self.refresh(&mut inner, Instant::now());
            (transition, inner.counts)
        };
        self.fire(transition);
        counts
    }

    /// Read-only statistics snapshot for status reporting.
    pub fn stats(&self) -> BreakerStats {
        let (transition, stats) = {
            let mut inner = self.lock();
            let transition = self.refresh(&mut inner, Instant::now());
            (
                transition,
                BreakerStats {
                    state: inner.state,
                    requests: inner.counts.requests,
                    total_successes: inner.counts.total_successes,
                    total_failures: inner.counts.total_failures,
                    consecutive_failures: inner.counts.consecutive_failures,
                },
            )
        };
        self.fire(transition);
        stats
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admission decision: returns the generation the call runs under,
    /// or the fast-fail error.
    fn admit(&self) -> (Option<Transition>, Result<u64, QueryError>) {
        let mut inner = self.lock();
        let transition = self.refresh(&mut inner, Instant::now());

        let result = match inner.state {
            CircuitState::Open => Err(QueryError::CircuitOpen(self.name.clone())),
            CircuitState::HalfOpen if inner.counts.requests >= self.max_requests => {
                debug!(breaker = %self.name, "half-open trial budget exhausted");
                Err(QueryError::CircuitOpen(self.name.clone()))
            }
            _ => {
                inner.counts.on_request();
                Ok(inner.generation)
            }
        };

        (transition, result)
    }

    /// Apply a completion. A completion from a superseded generation is
    /// dropped without touching counts or state.
    fn settle(&self, generation: u64, success: bool) -> Option<Transition> {
        let mut inner = self.lock();
        let now = Instant::now();

        if let Some(transition) = self.refresh(&mut inner, now) {
            // The refresh itself advanced the generation, so this
            // completion is necessarily stale.
            return Some(transition);
        }
        if inner.generation != generation {
            debug!(breaker = %self.name, "dropped stale completion");
            return None;
        }

        if success {
            inner.counts.on_success();
            if inner.state == CircuitState::HalfOpen
                && inner.counts.consecutive_successes >= self.max_requests
            {
                return Some(self.set_state(&mut inner, CircuitState::Closed, now));
            }
        } else {
            inner.counts.on_failure();
            match inner.state {
                CircuitState::Closed if (self.ready_to_trip)(&inner.counts) => {
                    return Some(self.set_state(&mut inner, CircuitState::Open, now));
                }
                CircuitState::HalfOpen => {
                    return Some(self.set_state(&mut inner, CircuitState::Open, now));
                }
                _ => {}
            }
        }

        None
    }

    /// Lazily apply time-driven changes: the Open timeout elapsing and
    /// the Closed rolling-window reset.
    fn refresh(&self, inner: &mut Inner, now: Instant) -> Option<Transition> {
        match inner.state {
            CircuitState::Closed => {
                if let Some(expiry) = inner.expiry {
                    if now >= expiry {
                        // Window rollover: new generation, same state.
                        inner.generation += 1;
                        inner.counts.clear();
                        inner.expiry = Some(now + self.interval);
                        debug!(breaker = %self.name, "closed-window counts reset");
                    }
                }
                None
            }
            CircuitState::Open => {
                let expiry = inner.expiry?;
                if now >= expiry {
                    Some(self.set_state(inner, CircuitState::HalfOpen, now))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => None,
        }
    }

    fn set_state(&self, inner: &mut Inner, to: CircuitState, now: Instant) -> Transition {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.counts.clear();
        inner.expiry = match to {
            CircuitState::Closed => {
                if self.interval.is_zero() {
                    None
                } else {
                    Some(now + self.interval)
                }
            }
            CircuitState::Open => Some(now + self.timeout),
            CircuitState::HalfOpen => None,
        };
        (from, to)
    }

    /// Log a transition and invoke the hook, outside the state lock.
    fn fire(&self, transition: Option<Transition>) {
        let Some((from, to)) = transition else {
            return;
        };
        info!(breaker = %self.name, %from, %to, "circuit state changed");
        if let Some(hook) = &self.on_state_change {
            hook(&self.name, from, to);
        }
    }
}
