//! # Processing Handlers
//!
//! Handlers are registered once at startup against a typed
//! [`ProcessingStage`]. The stage, not the handler, decides which statuses a
//! task passes through while it is processed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::error::{NomadError, Result};
use crate::models::Task;
use crate::state_machine::TaskStatus;

/// Kinds of work the engine knows how to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    /// to_refine -> refined
    Refine,
    /// prepare_tasks -> preparing_tasks -> ready_to_run
    PrepareTasks,
    /// queued_to_run -> in_progress -> done, one task at a time
    Execute,
}

impl ProcessingStage {
    pub const ALL: [ProcessingStage; 3] = [Self::Refine, Self::PrepareTasks, Self::Execute];

    /// Status a task must be in to be picked up for this stage
    pub fn entry_status(&self) -> TaskStatus {
        match self {
            Self::Refine => TaskStatus::ToRefine,
            Self::PrepareTasks => TaskStatus::PrepareTasks,
            Self::Execute => TaskStatus::QueuedToRun,
        }
    }

    /// Status held while the handler runs. `None` when the stage moves
    /// straight from entry to success.
    pub fn working_status(&self) -> Option<TaskStatus> {
        match self {
            Self::Refine => None,
            Self::PrepareTasks => Some(TaskStatus::PreparingTasks),
            Self::Execute => Some(TaskStatus::InProgress),
        }
    }

    pub fn success_status(&self) -> TaskStatus {
        match self {
            Self::Refine => TaskStatus::Refined,
            Self::PrepareTasks => TaskStatus::ReadyToRun,
            Self::Execute => TaskStatus::Done,
        }
    }

    /// Exclusive stages require the single lock token
    pub fn is_exclusive(&self) -> bool {
        matches!(self, Self::Execute)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Refine => "refine",
            Self::PrepareTasks => "prepare_tasks",
            Self::Execute => "execute",
        }
    }
}

impl fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied unit of work. Errors are arbitrary business failures.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn name(&self) -> &str;

    fn stage(&self) -> ProcessingStage;

    async fn handle(&self, task: &Task) -> anyhow::Result<()>;
}

/// One handler per stage, resolved at startup
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<ProcessingStage, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) -> Result<()> {
        let stage = handler.stage();
        if let Some(existing) = self.handlers.get(&stage) {
            return Err(NomadError::InvalidState(format!(
                "stage {stage} already handled by {}",
                existing.name()
            )));
        }

        info!(stage = %stage, handler = %handler.name(), "📝 Registered task handler");
        self.handlers.insert(stage, handler);
        Ok(())
    }

    /// Builder-style registration
    pub fn with_handler(mut self, handler: Arc<dyn TaskHandler>) -> Result<Self> {
        self.register(handler)?;
        Ok(self)
    }

    pub fn handler(&self, stage: ProcessingStage) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&stage).cloned()
    }

    /// Registered stages in workflow order
    pub fn stages(&self) -> Vec<ProcessingStage> {
        ProcessingStage::ALL
            .into_iter()
            .filter(|stage| self.handlers.contains_key(stage))
            .collect()
    }

    /// Entry statuses of every registered stage
    pub fn eligible_statuses(&self) -> Vec<TaskStatus> {
        self.stages().iter().map(ProcessingStage::entry_status).collect()
    }

    /// Registered stage picking up tasks in `status`
    pub fn stage_for_status(&self, status: TaskStatus) -> Option<ProcessingStage> {
        self.stages()
            .into_iter()
            .find(|stage| stage.entry_status() == status)
    }

    /// Registered stage whose working status is `status`
    pub fn stage_for_working_status(&self, status: TaskStatus) -> Option<ProcessingStage> {
        self.stages()
            .into_iter()
            .find(|stage| stage.working_status() == Some(status))
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: HashMap<ProcessingStage, &str> = self
            .handlers
            .iter()
            .map(|(stage, handler)| (*stage, handler.name()))
            .collect();
        f.debug_struct("HandlerRegistry").field("handlers", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::is_valid_transition;

    struct NoopHandler(ProcessingStage);

    #[async_trait]
    impl TaskHandler for NoopHandler {
        fn name(&self) -> &str {
            "noop"
        }

        fn stage(&self) -> ProcessingStage {
            self.0
        }

        async fn handle(&self, _task: &Task) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_stage_paths_follow_allowed_edges() {
        for stage in ProcessingStage::ALL {
            match stage.working_status() {
                Some(working) => {
                    assert!(is_valid_transition(stage.entry_status(), working));
                    assert!(is_valid_transition(working, stage.success_status()));
                    assert!(is_valid_transition(working, TaskStatus::Failed));
                }
                None => assert!(is_valid_transition(stage.entry_status(), stage.success_status())),
            }
        }
    }

    #[test]
    fn test_registry_resolves_by_status() {
        let registry = HandlerRegistry::new()
            .with_handler(Arc::new(NoopHandler(ProcessingStage::Execute)))
            .unwrap()
            .with_handler(Arc::new(NoopHandler(ProcessingStage::Refine)))
            .unwrap();

        assert_eq!(
            registry.stages(),
            vec![ProcessingStage::Refine, ProcessingStage::Execute]
        );
        assert_eq!(
            registry.eligible_statuses(),
            vec![TaskStatus::ToRefine, TaskStatus::QueuedToRun]
        );
        assert_eq!(
            registry.stage_for_status(TaskStatus::QueuedToRun),
            Some(ProcessingStage::Execute)
        );
        assert_eq!(
            registry.stage_for_working_status(TaskStatus::InProgress),
            Some(ProcessingStage::Execute)
        );
        assert!(registry.stage_for_status(TaskStatus::PrepareTasks).is_none());
    }

    #[test]
    fn test_duplicate_stage_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(Arc::new(NoopHandler(ProcessingStage::Execute)))
            .unwrap();
        let err = registry
            .register(Arc::new(NoopHandler(ProcessingStage::Execute)))
            .unwrap_err();
        assert!(matches!(err, NomadError::InvalidState(_)));
    }
}
