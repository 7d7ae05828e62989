use serde::{Deserialize, Serialize};
use std::fmt;

/// Task lifecycle states, in workflow order, plus the parallel `Failed` state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Ideas,
    ToRefine,
    Refined,
    PrepareTasks,
    PreparingTasks,
    ReadyToRun,
    QueuedToRun,
    InProgress,
    Done,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 10] = [
        Self::Ideas,
        Self::ToRefine,
        Self::Refined,
        Self::PrepareTasks,
        Self::PreparingTasks,
        Self::ReadyToRun,
        Self::QueuedToRun,
        Self::InProgress,
        Self::Done,
        Self::Failed,
    ];

    /// Stable snake_case identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ideas => "ideas",
            Self::ToRefine => "to_refine",
            Self::Refined => "refined",
            Self::PrepareTasks => "prepare_tasks",
            Self::PreparingTasks => "preparing_tasks",
            Self::ReadyToRun => "ready_to_run",
            Self::QueuedToRun => "queued_to_run",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Name as shown on the task tracker board
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Ideas => "Ideas",
            Self::ToRefine => "To Refine",
            Self::Refined => "Refined",
            Self::PrepareTasks => "Prepare Tasks",
            Self::PreparingTasks => "Preparing Tasks",
            Self::ReadyToRun => "Ready to run",
            Self::QueuedToRun => "Queued to run",
            Self::InProgress => "In progress",
            Self::Done => "Done",
            Self::Failed => "Failed",
        }
    }

    /// Terminal: no further transitions allowed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Failed)
    }

    /// States in which work is actively being done and from which `Failed` is reachable
    pub fn is_active_processing(&self) -> bool {
        matches!(
            self,
            Self::PreparingTasks | Self::QueuedToRun | Self::InProgress
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    /// Accepts either the snake_case identifier or the board display name
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Self::ALL
            .into_iter()
            .find(|status| {
                status.as_str() == trimmed || status.display_name().eq_ignore_ascii_case(trimmed)
            })
            .ok_or_else(|| format!("Invalid task status: {s}"))
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Ideas
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_and_active_checks() {
        assert!(TaskStatus::Done.is_terminal());
        assert!(!TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Failed.is_error());

        let active: Vec<_> = TaskStatus::ALL
            .into_iter()
            .filter(TaskStatus::is_active_processing)
            .collect();
        assert_eq!(
            active,
            vec![
                TaskStatus::PreparingTasks,
                TaskStatus::QueuedToRun,
                TaskStatus::InProgress
            ]
        );
    }

    #[test]
    fn test_status_string_conversion() {
        assert_eq!(TaskStatus::QueuedToRun.to_string(), "queued_to_run");
        assert_eq!("in_progress".parse::<TaskStatus>().unwrap(), TaskStatus::InProgress);
        assert_eq!("Queued to run".parse::<TaskStatus>().unwrap(), TaskStatus::QueuedToRun);
        assert_eq!("to refine".parse::<TaskStatus>().unwrap(), TaskStatus::ToRefine);
        assert!("archived".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&TaskStatus::PrepareTasks).unwrap();
        assert_eq!(json, "\"prepare_tasks\"");
        let parsed: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, TaskStatus::PrepareTasks);
    }
}
