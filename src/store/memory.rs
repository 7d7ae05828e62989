use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

use super::{StoreError, StoreResult, TaskStore};
use crate::models::{FeedbackEntry, Task, TaskId};
use crate::state_machine::TaskStatus;

/// One recorded interaction with the store, in call order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    FetchEligible(Vec<TaskStatus>),
    FetchTask(TaskId),
    UpdateStarted {
        task_id: TaskId,
        status: TaskStatus,
    },
    UpdateFinished {
        task_id: TaskId,
        status: TaskStatus,
        applied: bool,
    },
    AppendFeedback(TaskId),
}

/// Fault returned by the next matching call instead of the normal result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFault {
    Unavailable,
    Rejected,
    /// Times out without applying the write
    Timeout,
    /// Applies the write, then reports a timeout
    TimeoutAfterApply,
}

impl InjectedFault {
    fn to_error(self, operation: &str) -> StoreError {
        match self {
            Self::Unavailable => StoreError::Unavailable(format!("injected fault in {operation}")),
            Self::Rejected => StoreError::Rejected(format!("injected fault in {operation}")),
            Self::Timeout | Self::TimeoutAfterApply => {
                StoreError::Timeout(format!("injected fault in {operation}"))
            }
        }
    }
}

/// In-process task store with fault injection and call recording
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: DashMap<TaskId, Task>,
    update_faults: Mutex<VecDeque<InjectedFault>>,
    fetch_faults: Mutex<VecDeque<InjectedFault>>,
    update_delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<StoreCall>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        let store = Self::new();
        for task in tasks {
            store.insert(task);
        }
        store
    }

    pub fn insert(&self, task: Task) {
        self.tasks.insert(task.id.clone(), task);
    }

    /// Snapshot of a task, without recording a call
    pub fn task(&self, task_id: &TaskId) -> Option<Task> {
        self.tasks.get(task_id).map(|t| t.clone())
    }

    pub fn status_of(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.tasks.get(task_id).map(|t| t.status)
    }

    /// Queue faults for the next `update_status` calls, consumed in order
    pub fn inject_update_faults(&self, faults: impl IntoIterator<Item = InjectedFault>) {
        self.update_faults.lock().extend(faults);
    }

    /// Queue faults for the next `fetch_eligible_tasks` calls
    pub fn inject_fetch_faults(&self, faults: impl IntoIterator<Item = InjectedFault>) {
        self.fetch_faults.lock().extend(faults);
    }

    /// Delay applied inside every `update_status`, between start and finish
    pub fn set_update_delay(&self, delay: Option<Duration>) {
        *self.update_delay.lock() = delay;
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Number of `update_status` calls that reached the store
    pub fn update_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, StoreCall::UpdateStarted { .. }))
            .count()
    }

    fn record(&self, call: StoreCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn fetch_eligible_tasks(&self, statuses: &[TaskStatus]) -> StoreResult<Vec<Task>> {
        self.record(StoreCall::FetchEligible(statuses.to_vec()));

        let fault = self.fetch_faults.lock().pop_front();
        if let Some(fault) = fault {
            return Err(fault.to_error("fetch_eligible_tasks"));
        }

        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|entry| statuses.contains(&entry.status))
            .map(|entry| entry.value().clone())
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    async fn fetch_task(&self, task_id: &TaskId) -> StoreResult<Task> {
        self.record(StoreCall::FetchTask(task_id.clone()));
        self.task(task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.clone()))
    }

    async fn update_status(&self, task_id: &TaskId, status: TaskStatus) -> StoreResult<()> {
        self.record(StoreCall::UpdateStarted {
            task_id: task_id.clone(),
            status,
        });

        let delay = *self.update_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let fault = self.update_faults.lock().pop_front();
        let applied = match fault {
            None | Some(InjectedFault::TimeoutAfterApply) => {
                match self.tasks.get_mut(task_id) {
                    Some(mut task) => {
                        task.status = status;
                        true
                    }
                    None => {
                        self.record(StoreCall::UpdateFinished {
                            task_id: task_id.clone(),
                            status,
                            applied: false,
                        });
                        return Err(StoreError::NotFound(task_id.clone()));
                    }
                }
            }
            Some(_) => false,
        };

        self.record(StoreCall::UpdateFinished {
            task_id: task_id.clone(),
            status,
            applied,
        });
        debug!(task_id = %task_id, status = %status, applied = applied, "In-memory status update");

        match fault {
            Some(fault) => Err(fault.to_error("update_status")),
            None => Ok(()),
        }
    }

    async fn append_feedback(&self, task_id: &TaskId, message: &str) -> StoreResult<()> {
        self.record(StoreCall::AppendFeedback(task_id.clone()));
        let mut task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.clone()))?;
        task.append_feedback(FeedbackEntry::now(message));
        Ok(())
    }
}
