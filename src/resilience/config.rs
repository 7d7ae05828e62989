//! # Circuit Breaker Configuration
//!
//! Runtime form of one breaker's thresholds. Built from the validated
//! `circuit_breakers.*` configuration sections.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a single circuit breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,

    /// Time to stay open before allowing a single trial call
    pub cooldown: Duration,
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}
