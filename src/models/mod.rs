//! # Models
//!
//! Plain data types shared by every component: tasks as read from the
//! store, and the audit records produced by status transitions.

pub mod task;
pub mod transition;

pub use task::{FeedbackEntry, Task, TaskId, TaskMetadata};
pub use transition::{StatusTransition, TransitionResult};
pub(crate) use transition::PendingTransition;
