//! # Circuit Breaker Implementation
//!
//! Classic three-state breaker: Closed (normal operation), Open (failing
//! fast) and Half-Open (a single trial call decides the next state).
//!
//! Access is granted as a [`CircuitPermit`]. The permit must be resolved with
//! [`CircuitPermit::succeed`] or [`CircuitPermit::fail`]; a permit dropped
//! unresolved counts as a failure, so a half-open trial can never leak.
//! All deadlines use `tokio::time::Instant` and follow a paused test clock.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::resilience::{CircuitBreakerConfig, CircuitBreakerMetrics};

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed,
    /// Failure mode - all calls fail fast without executing
    Open,
    /// Testing recovery - exactly one trial call is in flight
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Open => f.write_str("open"),
            Self::HalfOpen => f.write_str("half_open"),
        }
    }
}

/// Errors that can occur during circuit breaker operation
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, rejecting all calls
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    /// Operation failed and was recorded
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

#[derive(Debug)]
struct BreakerInner {
    phase: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    metrics: CircuitBreakerMetrics,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    /// Component name for logging and metrics
    name: String,

    config: CircuitBreakerConfig,

    /// Short-held; never locked across an await
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: String, config: CircuitBreakerConfig) -> Self {
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            cooldown_seconds = config.cooldown.as_secs(),
            "🛡️ Circuit breaker initialized"
        );

        Self {
            name,
            config,
            inner: Mutex::new(BreakerInner {
                phase: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
                metrics: CircuitBreakerMetrics::new(),
            }),
        }
    }

    /// Current phase. An open breaker whose cooldown has elapsed still
    /// reports `Open` until the next permission check.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().phase
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Ask for permission to run the protected operation
    pub fn try_acquire(&self) -> Option<CircuitPermit<'_>> {
        let mut inner = self.inner.lock();
        let trial = match inner.phase {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map_or(true, |opened| opened.elapsed() >= self.config.cooldown);
                if !cooled_down {
                    inner.metrics.rejected_calls += 1;
                    debug!(component = %self.name, "⛔ Call rejected, circuit open");
                    return None;
                }
                inner.phase = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                info!(
                    component = %self.name,
                    "🟡 Circuit breaker half-open (allowing one trial call)"
                );
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.metrics.rejected_calls += 1;
                    debug!(component = %self.name, "⛔ Call rejected, trial already in flight");
                    return None;
                }
                inner.trial_in_flight = true;
                true
            }
        };

        Some(CircuitPermit {
            breaker: self,
            trial,
            started_at: Instant::now(),
            resolved: false,
        })
    }

    /// Execute an operation with circuit breaker protection
    pub async fn call<F, T, E, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self
            .try_acquire()
            .ok_or_else(|| CircuitBreakerError::CircuitOpen {
                component: self.name.clone(),
            })?;

        match operation().await {
            Ok(value) => {
                permit.succeed();
                Ok(value)
            }
            Err(e) => {
                permit.fail();
                Err(CircuitBreakerError::OperationFailed(e))
            }
        }
    }

    fn record_success(&self, trial: bool, started_at: Instant) {
        let duration = started_at.elapsed();
        let mut inner = self.inner.lock();
        inner.metrics.total_calls += 1;
        inner.metrics.success_count += 1;
        inner.metrics.total_duration += duration;
        inner.consecutive_failures = 0;

        debug!(
            component = %self.name,
            duration_ms = duration.as_millis(),
            "🟢 Operation succeeded"
        );

        if trial {
            inner.trial_in_flight = false;
            if inner.phase == CircuitState::HalfOpen {
                inner.phase = CircuitState::Closed;
                inner.opened_at = None;
                info!(
                    component = %self.name,
                    total_calls = inner.metrics.total_calls,
                    "🟢 Circuit breaker closed (recovered)"
                );
            }
        }
    }

    fn record_failure(&self, trial: bool, started_at: Instant) {
        let duration = started_at.elapsed();
        let mut inner = self.inner.lock();
        inner.metrics.total_calls += 1;
        inner.metrics.failure_count += 1;
        inner.metrics.total_duration += duration;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        warn!(
            component = %self.name,
            duration_ms = duration.as_millis(),
            consecutive_failures = inner.consecutive_failures,
            "🔴 Operation failed"
        );

        let should_open = match inner.phase {
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::HalfOpen => trial,
            CircuitState::Open => false,
        };
        if trial {
            inner.trial_in_flight = false;
        }
        if should_open {
            self.open(&mut inner);
        }
    }

    fn open(&self, inner: &mut BreakerInner) {
        inner.phase = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.trial_in_flight = false;
        inner.metrics.times_opened += 1;

        error!(
            component = %self.name,
            consecutive_failures = inner.consecutive_failures,
            failure_threshold = self.config.failure_threshold,
            cooldown_seconds = self.config.cooldown.as_secs(),
            "🔴 Circuit breaker opened (failing fast)"
        );
    }

    /// Force circuit to open state (for emergency situations)
    pub fn force_open(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced open");
        let mut inner = self.inner.lock();
        self.open(&mut inner);
    }

    /// Force circuit to closed state (for emergency recovery)
    pub fn force_closed(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced closed");
        let mut inner = self.inner.lock();
        inner.phase = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    /// Get current metrics snapshot
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        inner
            .metrics
            .clone()
            .with_derived(inner.phase, inner.consecutive_failures)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Closed and not currently accumulating failures
    pub fn is_healthy(&self) -> bool {
        let inner = self.inner.lock();
        inner.phase == CircuitState::Closed && inner.consecutive_failures == 0
    }
}

/// Permission to run one call through a [`CircuitBreaker`]
#[must_use = "a permit must be resolved with succeed() or fail()"]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    started_at: Instant,
    resolved: bool,
}

impl CircuitPermit<'_> {
    /// Whether this permit is the single half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeed(mut self) {
        self.resolved = true;
        self.breaker.record_success(self.trial, self.started_at);
    }

    pub fn fail(mut self) {
        self.resolved = true;
        self.breaker.record_failure(self.trial, self.started_at);
    }

    /// Give the permit back without recording an outcome. A half-open
    /// trial slot becomes available to the next caller.
    pub fn abandon(mut self) {
        self.resolved = true;
        if self.trial {
            self.breaker.inner.lock().trial_in_flight = false;
        }
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.record_failure(self.trial, self.started_at);
        }
    }
}

impl fmt::Debug for CircuitPermit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitPermit")
            .field("breaker", &self.breaker.name)
            .field("trial", &self.trial)
            .finish()
    }
}
