//! # Task Model
//!
//! One unit of schedulable work as seen by the orchestration engine. Tasks
//! are created and owned by the external store; the engine only mutates
//! their status (through the transition engine) and appends feedback.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::state_machine::TaskStatus;

/// Opaque, externally assigned task identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Descriptive data handed to processing handlers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub title: String,
    /// Reference into the external ticket tracker
    pub ticket_ref: Option<String>,
    #[serde(default)]
    pub context: HashMap<String, String>,
}

/// A single timestamped processing milestone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub recorded_at: DateTime<Utc>,
    pub message: String,
}

impl FeedbackEntry {
    pub fn now(message: impl Into<String>) -> Self {
        Self {
            recorded_at: Utc::now(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FeedbackEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.recorded_at.to_rfc3339(), self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    pub metadata: TaskMetadata,
    /// Append-only; entries are never edited or removed
    #[serde(default)]
    feedback_log: Vec<FeedbackEntry>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, status: TaskStatus, metadata: TaskMetadata) -> Self {
        Self {
            id: id.into(),
            status,
            metadata,
            feedback_log: Vec::new(),
        }
    }

    /// Convenience constructor used by stores and tests
    pub fn with_title(id: impl Into<TaskId>, status: TaskStatus, title: impl Into<String>) -> Self {
        Self::new(
            id,
            status,
            TaskMetadata {
                title: title.into(),
                ..TaskMetadata::default()
            },
        )
    }

    pub fn feedback_log(&self) -> &[FeedbackEntry] {
        &self.feedback_log
    }

    pub fn append_feedback(&mut self, entry: FeedbackEntry) {
        self.feedback_log.push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feedback_log_is_append_only() {
        let mut task = Task::with_title("t-1", TaskStatus::QueuedToRun, "Write docs");
        assert!(task.feedback_log().is_empty());

        task.append_feedback(FeedbackEntry::now("started"));
        task.append_feedback(FeedbackEntry::now("completed"));

        let messages: Vec<_> = task.feedback_log().iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["started", "completed"]);
        assert!(task.feedback_log()[0].recorded_at <= task.feedback_log()[1].recorded_at);
    }

    #[test]
    fn test_task_id_is_transparent_in_json() {
        let task = Task::with_title("abc", TaskStatus::Ideas, "Idea");
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["id"], "abc");
        assert_eq!(json["status"], "ideas");
    }
}
