//! # Circuit Breaker Metrics
//!
//! Counters collected by each breaker, exposed as snapshots for diagnostics.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::resilience::CircuitState;

/// Metrics for a single circuit breaker instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Calls that were allowed through and resolved
    pub total_calls: u64,

    pub success_count: u64,

    pub failure_count: u64,

    /// Permission checks denied while open or while a trial was in flight
    pub rejected_calls: u64,

    pub consecutive_failures: u32,

    /// Number of closed/half-open -> open transitions
    pub times_opened: u64,

    pub total_duration: Duration,

    pub current_state: CircuitState,

    /// Calculated failure rate (0.0 to 1.0)
    pub failure_rate: f64,

    /// Calculated success rate (0.0 to 1.0)
    pub success_rate: f64,

    pub average_duration: Duration,
}

impl CircuitBreakerMetrics {
    pub fn new() -> Self {
        Self {
            total_calls: 0,
            success_count: 0,
            failure_count: 0,
            rejected_calls: 0,
            consecutive_failures: 0,
            times_opened: 0,
            total_duration: Duration::ZERO,
            current_state: CircuitState::Closed,
            failure_rate: 0.0,
            success_rate: 0.0,
            average_duration: Duration::ZERO,
        }
    }

    /// Fill in rates and averages from the raw counters
    pub(crate) fn with_derived(mut self, state: CircuitState, consecutive_failures: u32) -> Self {
        self.current_state = state;
        self.consecutive_failures = consecutive_failures;
        if self.total_calls > 0 {
            self.failure_rate = self.failure_count as f64 / self.total_calls as f64;
            self.success_rate = self.success_count as f64 / self.total_calls as f64;
            self.average_duration = self.total_duration / self.total_calls as u32;
        }
        self
    }

    /// Get human-readable state description
    pub fn state_description(&self) -> &'static str {
        match self.current_state {
            CircuitState::Closed => "Healthy - Normal operation",
            CircuitState::Open => "Failing - Rejecting all calls",
            CircuitState::HalfOpen => "Recovering - Testing with a single trial",
        }
    }

    /// Format metrics for logging
    pub fn format_summary(&self) -> String {
        format!(
            "State: {} | Calls: {} | Success: {:.1}% | Failures: {} | Rejected: {} | Avg Duration: {}ms",
            self.state_description(),
            self.total_calls,
            self.success_rate * 100.0,
            self.failure_count,
            self.rejected_calls,
            self.average_duration.as_millis()
        )
    }
}

impl Default for CircuitBreakerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
