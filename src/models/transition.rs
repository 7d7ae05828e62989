//! # Status Transition Model
//!
//! Audit record for one attempted status change. A record is created when
//! the attempt starts and is immutable once finalized.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::task::TaskId;
use crate::state_machine::TaskStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionResult {
    Success,
    /// Rejected before any write reached the store
    Failed,
    /// The store write failed; the caller must re-read the true status
    RolledBack,
}

impl TransitionResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for TransitionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub task_id: TaskId,
    pub from_status: TaskStatus,
    pub to_status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub result: TransitionResult,
    pub error: Option<String>,
    /// Retry counter for the task at the time of this attempt
    pub attempt: u32,
    /// True when the call was detected as already applied and no write occurred
    pub idempotent: bool,
    /// For rolled-back attempts: whether the compensating write was confirmed
    pub rollback_confirmed: Option<bool>,
}

impl StatusTransition {
    pub fn is_success(&self) -> bool {
        self.result == TransitionResult::Success
    }

    pub fn is_rolled_back(&self) -> bool {
        self.result == TransitionResult::RolledBack
    }
}

/// Builder for the in-flight attempt; consumed when the outcome is known
#[derive(Debug)]
pub(crate) struct PendingTransition {
    task_id: TaskId,
    from_status: TaskStatus,
    to_status: TaskStatus,
    started_at: DateTime<Utc>,
    attempt: u32,
}

impl PendingTransition {
    pub(crate) fn begin(task_id: TaskId, from: TaskStatus, to: TaskStatus, attempt: u32) -> Self {
        Self {
            task_id,
            from_status: from,
            to_status: to,
            started_at: Utc::now(),
            attempt,
        }
    }

    pub(crate) fn succeeded(self) -> StatusTransition {
        self.finish(TransitionResult::Success, None, false, None)
    }

    pub(crate) fn already_applied(self) -> StatusTransition {
        self.finish(TransitionResult::Success, None, true, None)
    }

    pub(crate) fn failed(self, error: impl Into<String>) -> StatusTransition {
        self.finish(TransitionResult::Failed, Some(error.into()), false, None)
    }

    pub(crate) fn rolled_back(self, error: impl Into<String>, confirmed: bool) -> StatusTransition {
        self.finish(
            TransitionResult::RolledBack,
            Some(error.into()),
            false,
            Some(confirmed),
        )
    }

    fn finish(
        self,
        result: TransitionResult,
        error: Option<String>,
        idempotent: bool,
        rollback_confirmed: Option<bool>,
    ) -> StatusTransition {
        StatusTransition {
            task_id: self.task_id,
            from_status: self.from_status,
            to_status: self.to_status,
            started_at: self.started_at,
            result,
            error,
            attempt: self.attempt,
            idempotent,
            rollback_confirmed,
        }
    }
}
