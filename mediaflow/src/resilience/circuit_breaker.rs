//! Circuit breaker guarding calls to one unreliable dependency.

use std::future::Future;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Thresholds for one breaker class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call is admitted.
    pub recovery_timeout_ms: u64,
}

impl BreakerConfig {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout_ms: recovery_timeout.as_millis() as u64,
        }
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(120))
    }
}

/// State of a circuit breaker.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing; calls are rejected without reaching the dependency.
    Open,
    /// Recovery probe; exactly one trial call is admitted.
    HalfOpen,
}

/// Point-in-time view of a breaker, for status endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    /// Milliseconds until a trial call is admitted (only while open).
    pub retry_after_ms: Option<u64>,
    pub opened_at: Option<DateTime<Utc>>,
    pub rejected_calls: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    trial_in_flight: bool,
    rejected_calls: u64,
    /// Bumped on every state change; outcomes of calls admitted under an
    /// older generation never move the state.
    generation: u64,
}

/// Circuit breaker for protecting against cascading failures.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

/// Admission ticket for one call. Releases a half-open trial slot if the
/// call is dropped before reporting an outcome.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl Admission<'_> {
    fn success(mut self) {
        self.settled = true;
        self.breaker.settle(self.generation, self.trial, true);
    }

    fn failure(mut self) {
        self.settled = true;
        self.breaker.settle(self.generation, self.trial, false);
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            let mut inner = self.breaker.inner.lock();
            if inner.generation == self.generation {
                inner.trial_in_flight = false;
                debug!(breaker = %self.breaker.name, "Half-open trial abandoned");
            }
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                opened_at_wall: None,
                trial_in_flight: false,
                rejected_calls: 0,
                generation: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    /// Get the current state.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.check_state_transition(&mut inner);
        inner.state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Check if the circuit would admit a call right now.
    pub fn is_allowed(&self) -> bool {
        let mut inner = self.inner.lock();
        self.check_state_transition(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !inner.trial_in_flight,
            CircuitState::Open => false,
        }
    }

    /// Run a synchronous call through the breaker.
    ///
    /// The wrapped call's result is returned unmodified. While open the call
    /// is not invoked and `Error::CircuitOpen` is returned instead.
    pub fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let admission = self.admit()?;
        match f() {
            Ok(value) => {
                admission.success();
                Ok(value)
            }
            Err(e) => {
                admission.failure();
                Err(e)
            }
        }
    }

    /// Async variant of [`CircuitBreaker::call`].
    pub async fn call_async<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = self.admit()?;
        match f().await {
            Ok(value) => {
                admission.success();
                Ok(value)
            }
            Err(e) => {
                admission.failure();
                Err(e)
            }
        }
    }

    fn admit(&self) -> Result<Admission<'_>> {
        let mut inner = self.inner.lock();
        self.check_state_transition(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(Admission {
                breaker: self,
                generation: inner.generation,
                trial: false,
                settled: false,
            }),
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                debug!(breaker = %self.name, "Admitting half-open trial call");
                Ok(Admission {
                    breaker: self,
                    generation: inner.generation,
                    trial: true,
                    settled: false,
                })
            }
            CircuitState::HalfOpen => {
                inner.rejected_calls += 1;
                Err(Error::CircuitOpen {
                    name: self.name.clone(),
                    retry_after: Duration::ZERO,
                })
            }
            CircuitState::Open => {
                inner.rejected_calls += 1;
                Err(Error::CircuitOpen {
                    name: self.name.clone(),
                    retry_after: self.remaining_cooldown(&inner),
                })
            }
        }
    }

    /// Record a successful operation made outside [`CircuitBreaker::call`].
    ///
    /// Only the admitted trial call can decide a half-open circuit, so this
    /// has no effect while half-open.
    pub fn record_success(&self) {
        let generation = self.inner.lock().generation;
        self.settle(generation, false, true);
    }

    /// Record a failed operation made outside [`CircuitBreaker::call`].
    pub fn record_failure(&self) {
        let generation = self.inner.lock().generation;
        self.settle(generation, false, false);
    }

    fn settle(&self, generation: u64, trial: bool, success: bool) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            if !success {
                inner.failure_count = inner.failure_count.saturating_add(1);
            }
            debug!(
                breaker = %self.name,
                state = %inner.state,
                success,
                "Ignoring outcome of a call admitted before the last state change"
            );
            return;
        }

        match (inner.state, success) {
            (CircuitState::Closed, true) => {
                inner.failure_count = 0;
            }
            (CircuitState::Closed, false) => {
                inner.failure_count = inner.failure_count.saturating_add(1);
                if inner.failure_count >= self.config.failure_threshold {
                    Self::open(&mut inner);
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        recovery_timeout_ms = self.config.recovery_timeout_ms,
                        "Circuit breaker opened"
                    );
                }
            }
            (CircuitState::HalfOpen, true) if trial => {
                Self::close(&mut inner);
                info!(breaker = %self.name, "Circuit breaker closed after successful trial");
            }
            (CircuitState::HalfOpen, false) if trial => {
                inner.failure_count = inner.failure_count.saturating_add(1);
                Self::open(&mut inner);
                warn!(breaker = %self.name, "Circuit breaker reopened after failed trial");
            }
            (CircuitState::HalfOpen, _) => {}
            (CircuitState::Open, success) => {
                if !success {
                    inner.failure_count = inner.failure_count.saturating_add(1);
                }
            }
        }
    }

    /// Reset the circuit breaker to closed state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        Self::close(&mut inner);
        info!(breaker = %self.name, "Circuit breaker manually reset");
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        let mut inner = self.inner.lock();
        self.check_state_transition(&mut inner);
        let retry_after_ms = (inner.state == CircuitState::Open)
            .then(|| self.remaining_cooldown(&inner).as_millis() as u64);

        CircuitBreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout_ms: self.config.recovery_timeout_ms,
            retry_after_ms,
            opened_at: inner.opened_at_wall,
            rejected_calls: inner.rejected_calls,
        }
    }

    fn open(inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.opened_at_wall = Some(Utc::now());
        inner.trial_in_flight = false;
        inner.generation += 1;
    }

    fn close(inner: &mut BreakerInner) {
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.opened_at_wall = None;
        inner.trial_in_flight = false;
        inner.generation += 1;
    }

    fn remaining_cooldown(&self, inner: &BreakerInner) -> Duration {
        inner
            .opened_at
            .map(|opened| self.config.recovery_timeout().saturating_sub(opened.elapsed()))
            .unwrap_or(Duration::ZERO)
    }

    /// Open -> half-open once the recovery timeout has elapsed.
    fn check_state_transition(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= self.config.recovery_timeout()
        {
            inner.state = CircuitState::HalfOpen;
            inner.trial_in_flight = false;
            inner.generation += 1;
            debug!(breaker = %self.name, "Circuit breaker transitioned to half-open state");
        }
    }
}
