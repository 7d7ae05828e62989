use thiserror::Error;

use super::states::TaskStatus;

/// Reasons a transition is rejected before or instead of a store write.
/// Rendered into the `error` text of a failed `StatusTransition`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateMachineError {
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Status mismatch: expected {expected}, found {actual}")]
    StatusMismatch {
        expected: TaskStatus,
        actual: TaskStatus,
    },

    #[error("Retry limit exceeded: {used} of {max_retries} retries used")]
    RetryLimitExceeded { used: u32, max_retries: u32 },

    #[error("Cannot resume into {to}: task failed from {origin:?}")]
    ResumeTargetNotOrigin {
        to: TaskStatus,
        origin: Option<TaskStatus>,
    },
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;
