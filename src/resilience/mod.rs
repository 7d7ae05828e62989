//! # Resilience Module
//!
//! Circuit breakers that stop invoking a persistently failing operation and
//! test for recovery with a single trial call after a cooldown. Polling and
//! task processing each own an independent breaker.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use nomad_core::resilience::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let breaker = CircuitBreaker::new(
//!     "polling".to_string(),
//!     CircuitBreakerConfig::new(5, Duration::from_secs(60)),
//! );
//!
//! if let Some(permit) = breaker.try_acquire() {
//!     // ... run the protected operation ...
//!     permit.succeed();
//! };
//! # }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod metrics;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitPermit, CircuitState};
pub use config::CircuitBreakerConfig;
pub use metrics::CircuitBreakerMetrics;
