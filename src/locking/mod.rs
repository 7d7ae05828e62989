//! # Locking
//!
//! The single "one task in flight" permit. This is an in-process primitive:
//! exclusivity holds only within one running engine instance.

pub mod lock_manager;

pub use lock_manager::{LockGuard, LockManager, LockMetrics, LockToken};
