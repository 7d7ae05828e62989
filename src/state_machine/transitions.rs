//! Allowed-edge table and retry policy for task status changes.
//!
//! The table is the single source of truth for which moves are legal. The
//! retry policy only narrows edges leaving `Failed`; it never widens the table.

use serde::{Deserialize, Serialize};

use super::errors::{StateMachineError, StateMachineResult};
use super::states::TaskStatus;
use crate::config::TransitionConfig;

/// Pure check against the allowed-edge table
pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;

    matches!(
        (from, to),
        // Forward workflow
        (Ideas, ToRefine)
            | (ToRefine, Refined)
            | (Refined, PrepareTasks)
            | (PrepareTasks, PreparingTasks)
            | (PreparingTasks, ReadyToRun)
            | (ReadyToRun, QueuedToRun)
            | (QueuedToRun, InProgress)
            | (InProgress, Done)
            // Failure from active-processing states
            | (PreparingTasks, Failed)
            | (QueuedToRun, Failed)
            | (InProgress, Failed)
            // Retry: requeue, or resume where it failed
            | (Failed, QueuedToRun)
            | (Failed, PreparingTasks)
            | (Failed, InProgress)
    )
}

/// All targets reachable from `from` in one step
pub fn valid_targets(from: TaskStatus) -> Vec<TaskStatus> {
    TaskStatus::ALL
        .into_iter()
        .filter(|to| is_valid_transition(from, *to))
        .collect()
}

/// Bounded retry policy for edges leaving `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub allow_resume_from_origin: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            allow_resume_from_origin: true,
        }
    }
}

impl From<&TransitionConfig> for RetryPolicy {
    fn from(config: &TransitionConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            allow_resume_from_origin: config.allow_resume_from_origin,
        }
    }
}

impl RetryPolicy {
    /// Check a `Failed -> to` retry given how many retries the task has used
    /// and which status it failed from. Non-retry edges always pass.
    pub fn check(
        &self,
        from: TaskStatus,
        to: TaskStatus,
        failed_from: Option<TaskStatus>,
        retries_used: u32,
    ) -> StateMachineResult<()> {
        if from != TaskStatus::Failed {
            return Ok(());
        }

        if retries_used >= self.max_retries {
            return Err(StateMachineError::RetryLimitExceeded {
                used: retries_used,
                max_retries: self.max_retries,
            });
        }

        if to == TaskStatus::QueuedToRun {
            return Ok(());
        }

        if self.allow_resume_from_origin && failed_from == Some(to) {
            Ok(())
        } else {
            Err(StateMachineError::ResumeTargetNotOrigin {
                to,
                origin: failed_from,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_forward_workflow_is_a_chain() {
        let order = [
            TaskStatus::Ideas,
            TaskStatus::ToRefine,
            TaskStatus::Refined,
            TaskStatus::PrepareTasks,
            TaskStatus::PreparingTasks,
            TaskStatus::ReadyToRun,
            TaskStatus::QueuedToRun,
            TaskStatus::InProgress,
            TaskStatus::Done,
        ];
        for pair in order.windows(2) {
            assert!(is_valid_transition(pair[0], pair[1]), "{:?}", pair);
            assert!(!is_valid_transition(pair[1], pair[0]), "{:?}", pair);
        }
    }

    #[test]
    fn test_failed_reachable_only_from_active_states() {
        for from in TaskStatus::ALL {
            assert_eq!(
                is_valid_transition(from, TaskStatus::Failed),
                from.is_active_processing(),
                "{from}"
            );
        }
    }

    #[test]
    fn test_done_is_terminal() {
        assert!(valid_targets(TaskStatus::Done).is_empty());
    }

    #[test]
    fn test_retry_policy_limits_retries() {
        let policy = RetryPolicy {
            max_retries: 2,
            allow_resume_from_origin: true,
        };
        assert!(policy
            .check(TaskStatus::Failed, TaskStatus::QueuedToRun, None, 1)
            .is_ok());
        assert_eq!(
            policy.check(TaskStatus::Failed, TaskStatus::QueuedToRun, None, 2),
            Err(StateMachineError::RetryLimitExceeded {
                used: 2,
                max_retries: 2
            })
        );
    }

    #[test]
    fn test_retry_policy_resume_requires_origin() {
        let policy = RetryPolicy::default();
        assert!(policy
            .check(
                TaskStatus::Failed,
                TaskStatus::InProgress,
                Some(TaskStatus::InProgress),
                0
            )
            .is_ok());
        assert!(policy
            .check(
                TaskStatus::Failed,
                TaskStatus::InProgress,
                Some(TaskStatus::PreparingTasks),
                0
            )
            .is_err());

        let strict = RetryPolicy {
            allow_resume_from_origin: false,
            ..RetryPolicy::default()
        };
        assert!(strict
            .check(
                TaskStatus::Failed,
                TaskStatus::InProgress,
                Some(TaskStatus::InProgress),
                0
            )
            .is_err());
    }

    #[test]
    fn test_retry_policy_ignores_non_retry_edges() {
        let policy = RetryPolicy {
            max_retries: 0,
            allow_resume_from_origin: false,
        };
        assert!(policy
            .check(TaskStatus::InProgress, TaskStatus::Done, None, 10)
            .is_ok());
    }

    fn any_status() -> impl Strategy<Value = TaskStatus> {
        (0..TaskStatus::ALL.len()).prop_map(|i| TaskStatus::ALL[i])
    }

    proptest! {
        #[test]
        fn prop_valid_targets_agree_with_table(from in any_status(), to in any_status()) {
            prop_assert_eq!(valid_targets(from).contains(&to), is_valid_transition(from, to));
        }

        #[test]
        fn prop_no_self_transitions(status in any_status()) {
            prop_assert!(!is_valid_transition(status, status));
        }
    }
}
