//! # Task Store
//!
//! Collaborator interface to the external task tracker. The orchestration
//! core only reads tasks, writes statuses and appends feedback; everything
//! else about the tracker is out of its hands.
//!
//! [`InMemoryTaskStore`] is a complete in-process implementation used by
//! tests and local runs. It can inject faults and records every call.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Task, TaskId};
use crate::state_machine::TaskStatus;

pub mod memory;

pub use memory::{InMemoryTaskStore, InjectedFault, StoreCall};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Task not found: {0}")]
    NotFound(TaskId),

    /// The request timed out; the write may or may not have been applied
    #[error("Store request timed out: {0}")]
    Timeout(String),

    #[error("Store rejected the request: {0}")]
    Rejected(String),
}

impl StoreError {
    /// Whether the outcome of a write is unknown
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Tasks whose current status is in `statuses`
    async fn fetch_eligible_tasks(&self, statuses: &[TaskStatus]) -> StoreResult<Vec<Task>>;

    async fn fetch_task(&self, task_id: &TaskId) -> StoreResult<Task>;

    /// Atomic boundary of a transition
    async fn update_status(&self, task_id: &TaskId, status: TaskStatus) -> StoreResult<()>;

    async fn append_feedback(&self, task_id: &TaskId, message: &str) -> StoreResult<()>;
}
