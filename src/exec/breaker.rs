//! Circuit breaker fault isolation.
//!
//! A [`CircuitBreaker`] guards one logical dependency (e.g. one external
//! backend) and fails fast after repeated failures instead of letting
//! every caller time out against a dead dependency.
//!
//! State machine: `Closed` admits all calls and counts consecutive
//! failures; reaching the threshold trips to `Open`, which rejects
//! everything until the recovery timeout elapses. The `Open -> HalfOpen`
//! transition is lazy, performed by an explicit [`CircuitBreaker::
//! check_transition`] call at the top of every admission or state read
//! rather than by a background timer. `HalfOpen` admits a bounded number
//! of probe calls: one success closes the breaker, one failure reopens it.

use crate::error::{Error, ErrorKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Default number of consecutive failures before the breaker trips.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default recovery timeout before an open breaker probes again.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Default number of probe calls admitted while half-open.
pub const DEFAULT_HALF_OPEN_MAX_CALLS: u32 = 3;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// All calls admitted; failures are counted.
    Closed,
    /// All calls rejected until the recovery timeout elapses.
    Open,
    /// A bounded number of probe calls admitted.
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before tripping to Open.
    pub failure_threshold: u32,
    /// How long an open breaker rejects before probing.
    pub timeout: Duration,
    /// Probe calls admitted while half-open.
    pub half_open_max_calls: u32,
    /// Error kinds that do not count as failures (e.g. client-side
    /// validation errors that say nothing about the dependency's health).
    pub excluded_kinds: HashSet<ErrorKind>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            half_open_max_calls: DEFAULT_HALF_OPEN_MAX_CALLS,
            excluded_kinds: HashSet::from([ErrorKind::Validation]),
        }
    }
}

impl BreakerConfig {
    /// Create a config with the given threshold and recovery timeout.
    pub fn new(failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            failure_threshold,
            timeout,
            ..Default::default()
        }
    }

    /// Set the half-open probe budget.
    pub fn with_half_open_max_calls(mut self, max_calls: u32) -> Self {
        self.half_open_max_calls = max_calls;
        self
    }

    /// Add an error kind to the exclusion set.
    pub fn exclude_kind(mut self, kind: ErrorKind) -> Self {
        self.excluded_kinds.insert(kind);
        self
    }
}

/// Observability snapshot of a breaker, carried on circuit-open errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    /// Breaker name.
    pub name: String,
    /// Current state at snapshot time.
    pub state: BreakerState,
    /// Consecutive failures counted so far.
    pub failure_count: u32,
    /// Configured trip threshold.
    pub failure_threshold: u32,
    /// Configured recovery timeout in seconds.
    pub timeout_secs: u64,
    /// When the most recent counted failure happened.
    pub last_failure_time: Option<DateTime<Utc>>,
    /// Probe calls used in the current half-open window.
    pub half_open_calls: u32,
    /// Configured half-open probe budget.
    pub half_open_max_calls: u32,
    /// Cumulative admitted calls.
    pub total_calls: u64,
    /// Cumulative successes.
    pub successful_calls: u64,
    /// Cumulative counted failures.
    pub failed_calls: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
    half_open_calls: u32,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
}

/// Per-dependency failure-rate guard.
///
/// Mutation is confined behind one mutex per breaker; `allow_request`,
/// `record_success`, and `record_failure` are each a single atomic step.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker with the given name and config.
    pub fn new(name: &str, config: BreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure_time: None,
                half_open_calls: 0,
                total_calls: 0,
                successful_calls: 0,
                failed_calls: 0,
            }),
        }
    }

    /// The breaker's registry name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Apply the lazy Open -> HalfOpen transition if the recovery timeout
    /// has elapsed.
    ///
    /// Called explicitly at the top of [`allow_request`](Self::allow_request)
    /// and [`state`](Self::state); there is no background timer.
    pub fn check_transition(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state != BreakerState::Open {
            return;
        }
        let elapsed = inner
            .last_failure_time
            .map(|t| Utc::now().signed_duration_since(t))
            .and_then(|d| d.to_std().ok());
        if matches!(elapsed, Some(e) if e >= self.config.timeout) {
            debug!(breaker = %self.name, "recovery timeout elapsed, probing");
            inner.state = BreakerState::HalfOpen;
            inner.half_open_calls = 0;
        }
    }

    /// Decide admission for one call.
    ///
    /// The only side effects are the lazy state transition and the call
    /// counters; rejection never mutates failure state.
    pub fn allow_request(&self) -> bool {
        self.check_transition();
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => {
                inner.total_calls += 1;
                true
            }
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if inner.half_open_calls < self.config.half_open_max_calls {
                    inner.half_open_calls += 1;
                    inner.total_calls += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call.
    ///
    /// A half-open probe success closes the breaker and resets the
    /// failure count; a success while closed also resets the count
    /// (failures are consecutive).
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.successful_calls += 1;
        match inner.state {
            BreakerState::HalfOpen => {
                debug!(breaker = %self.name, "probe succeeded, closing");
                inner.state = BreakerState::Closed;
                inner.failure_count = 0;
                inner.half_open_calls = 0;
            }
            BreakerState::Closed => {
                inner.failure_count = 0;
            }
            BreakerState::Open => {}
        }
    }

    /// Record a failed call.
    ///
    /// Errors whose kind is in the exclusion set are not counted at all.
    /// A half-open probe failure reopens the breaker immediately; a
    /// closed breaker trips once the consecutive count reaches the
    /// threshold.
    pub fn record_failure(&self, error: &Error) {
        if self.config.excluded_kinds.contains(&error.kind()) {
            debug!(breaker = %self.name, kind = ?error.kind(), "failure excluded from count");
            return;
        }
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.failed_calls += 1;
        inner.failure_count += 1;
        inner.last_failure_time = Some(Utc::now());
        match inner.state {
            BreakerState::HalfOpen => {
                warn!(breaker = %self.name, "probe failed, reopening");
                inner.state = BreakerState::Open;
                inner.half_open_calls = 0;
            }
            BreakerState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        "failure threshold reached, opening"
                    );
                    inner.state = BreakerState::Open;
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Current state, applying the lazy transition first.
    pub fn state(&self) -> BreakerState {
        self.check_transition();
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Observability snapshot of the breaker.
    pub fn snapshot(&self) -> BreakerSnapshot {
        self.check_transition();
        let inner = self.inner.lock().expect("breaker lock poisoned");
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.config.failure_threshold,
            timeout_secs: self.config.timeout.as_secs(),
            last_failure_time: inner.last_failure_time,
            half_open_calls: inner.half_open_calls,
            half_open_max_calls: self.config.half_open_max_calls,
            total_calls: inner.total_calls,
            successful_calls: inner.successful_calls,
            failed_calls: inner.failed_calls,
        }
    }
}

/// Name-keyed collection of circuit breakers.
///
/// Explicitly constructed and injected by the composition root rather
/// than held in a process-wide global, so isolated executors never share
/// breaker state unless they share a registry.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a breaker under its name, or return the existing one.
    ///
    /// Callers registering the same name share state; the config of the
    /// first registration wins.
    pub fn register(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().expect("registry lock poisoned");
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    /// Look up a breaker by name.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .lock()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// Snapshot every registered breaker.
    pub fn snapshots(&self) -> HashMap<String, BreakerSnapshot> {
        let breakers = self.breakers.lock().expect("registry lock poisoned");
        breakers
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.snapshot()))
            .collect()
    }

    /// Names of all registered breakers.
    pub fn names(&self) -> Vec<String> {
        let breakers = self.breakers.lock().expect("registry lock poisoned");
        breakers.keys().cloned().collect()
    }
}
