//! # State Machine
//!
//! Task lifecycle statuses, the allowed-edge table, the bounded retry policy
//! and the [`TransitionEngine`] that commits status changes to the store.

pub mod engine;
pub mod errors;
pub mod keyed_lock;
pub mod states;
pub mod transitions;

pub use engine::{TransitionEngine, TransitionStatistics};
pub use errors::{StateMachineError, StateMachineResult};
pub use keyed_lock::KeyedMutex;
pub use states::TaskStatus;
pub use transitions::{is_valid_transition, valid_targets, RetryPolicy};
