//! Circuit breakers for shard searches and object-store exports.
//!
//! # States
//! - **Closed**: calls pass through; consecutive failures are counted
//! - **Open**: calls are rejected without invoking the dependency
//! - **HalfOpen**: one trial call at a time passes through while the others
//!   are rejected; one failure reopens the circuit, `success_threshold`
//!   consecutive successes close it
//!
//! An open circuit moves to half-open on the first call made at least
//! `timeout` after the last recorded failure, and that call is the first
//! trial. Every call is bounded by a call timeout, and a timed-out call
//! counts as a failure.
//!
//! State and counters of one breaker share a single mutex. The mutex is
//! never held across an `.await`.

use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tidemark_core::config;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
    /// How long the circuit stays open after the last failure.
    pub timeout: Duration,
    /// Upper bound on a single call.
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: config::BREAKER_FAILURE_THRESHOLD,
            success_threshold: config::BREAKER_SUCCESS_THRESHOLD,
            timeout: Duration::from_secs(config::BREAKER_OPEN_SECS),
            call_timeout: Duration::from_millis(config::BREAKER_CALL_TIMEOUT_MS),
        }
    }
}

/// Why a call through a breaker did not produce a value.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// Rejected without calling the dependency.
    #[error("circuit '{name}' is open")]
    Open { name: String },
    #[error("call through circuit '{name}' timed out after {after:?}")]
    Timeout { name: String, after: Duration },
    /// The dependency's own error, already recorded as a failure.
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    /// Every call attempt, rejected ones included.
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub consecutive_failures: u32,
    /// `successful / (successful + failed)`, or `1.0` before any call completes.
    pub success_rate: f64,
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_time: Option<Instant>,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    rejected_calls: u64,
    /// A half-open trial call has been admitted and not yet finished.
    trial_in_flight: bool,
}

/// Admission to call the dependency. Dropping it ends a half-open trial,
/// including when the caller's future is cancelled mid-call.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.trial {
            self.breaker.state.lock().trial_in_flight = false;
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_failure_time: None,
                total_calls: 0,
                successful_calls: 0,
                failed_calls: 0,
                rejected_calls: 0,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Runs `f` through the breaker, bounded by the configured call timeout.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_with_timeout(self.config.call_timeout, f).await
    }

    /// Like [`CircuitBreaker::call`] with a caller-supplied bound. The
    /// effective bound is the smaller of `limit` and the configured call timeout.
    pub async fn call_with_timeout<F, Fut, T, E>(
        &self,
        limit: Duration,
        f: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(_admission) = self.try_acquire() else {
            return Err(BreakerError::Open {
                name: self.name.clone(),
            });
        };

        let after = limit.min(self.config.call_timeout);
        match tokio::time::timeout(after, f()).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record_failure();
                Err(BreakerError::Inner(e))
            }
            Err(_) => {
                self.record_failure();
                Err(BreakerError::Timeout {
                    name: self.name.clone(),
                    after,
                })
            }
        }
    }

    /// Counts the attempt and decides whether it may proceed.
    fn try_acquire(&self) -> Option<Admission<'_>> {
        let mut state = self.state.lock();
        state.total_calls += 1;

        let admitted = match state.state {
            CircuitState::Closed => Some(false),
            CircuitState::HalfOpen if state.trial_in_flight => None,
            CircuitState::HalfOpen => Some(true),
            CircuitState::Open => {
                let cooled = state
                    .last_failure_time
                    .map_or(true, |t| t.elapsed() >= self.config.timeout);
                if cooled {
                    state.consecutive_successes = 0;
                    self.transition(&mut state, CircuitState::HalfOpen);
                    Some(true)
                } else {
                    None
                }
            }
        };

        match admitted {
            Some(trial) => {
                if trial {
                    state.trial_in_flight = true;
                }
                Some(Admission {
                    breaker: self,
                    trial,
                })
            }
            None => {
                state.rejected_calls += 1;
                counter!("tidemark_breaker_rejections_total", "name" => self.name.clone())
                    .increment(1);
                None
            }
        }
    }

    fn record_success(&self) {
        let mut state = self.state.lock();
        state.successful_calls += 1;
        state.consecutive_failures = 0;
        state.consecutive_successes += 1;

        if state.state == CircuitState::HalfOpen
            && state.consecutive_successes >= self.config.success_threshold
        {
            self.transition(&mut state, CircuitState::Closed);
        }
    }

    fn record_failure(&self) {
        let mut state = self.state.lock();
        state.failed_calls += 1;
        state.consecutive_successes = 0;
        state.consecutive_failures += 1;
        state.last_failure_time = Some(Instant::now());

        match state.state {
            CircuitState::Closed => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut state, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => self.transition(&mut state, CircuitState::Open),
            CircuitState::Open => {}
        }
    }

    fn transition(&self, state: &mut BreakerState, to: CircuitState) {
        let from = state.state;
        state.state = to;
        if to == CircuitState::Closed {
            state.consecutive_failures = 0;
        }
        match to {
            CircuitState::Open => tracing::warn!(
                breaker = %self.name,
                %from,
                consecutive_failures = state.consecutive_failures,
                "circuit opened"
            ),
            _ => tracing::info!(breaker = %self.name, %from, %to, "circuit state changed"),
        }
        counter!(
            "tidemark_breaker_transitions_total",
            "name" => self.name.clone(),
            "to" => to.to_string()
        )
        .increment(1);
    }

    pub fn stats(&self) -> BreakerStats {
        let state = self.state.lock();
        let completed = state.successful_calls + state.failed_calls;
        BreakerStats {
            name: self.name.clone(),
            state: state.state,
            total_calls: state.total_calls,
            successful_calls: state.successful_calls,
            failed_calls: state.failed_calls,
            rejected_calls: state.rejected_calls,
            consecutive_failures: state.consecutive_failures,
            success_rate: if completed == 0 {
                1.0
            } else {
                state.successful_calls as f64 / completed as f64
            },
        }
    }
}

/// One breaker per dependency name, created on first use and never removed.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write();
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone()))),
        )
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    pub fn get_stats(&self, name: &str) -> Option<BreakerStats> {
        self.get(name).map(|b| b.stats())
    }

    /// Stats of every breaker, sorted by name.
    pub fn all_stats(&self) -> Vec<BreakerStats> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.read().values().cloned().collect();
        let mut stats: Vec<BreakerStats> = breakers.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }
}
