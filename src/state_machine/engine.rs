//! # Transition Engine
//!
//! Validates and commits task status changes against the external store.
//!
//! Every call produces exactly one finalized [`StatusTransition`], which is
//! appended to a bounded in-memory history, logged and broadcast. Calls for
//! the same task id are serialized through a re-entrant per-key lock; calls
//! for different tasks run concurrently.
//!
//! Order of checks for a single call:
//! 1. the edge must exist in the allowed-edge table (no store access otherwise)
//! 2. the current status is re-read from the store; if it already equals the
//!    target the call is an idempotent success, if it differs from `from`
//!    the call fails with a status mismatch
//! 3. the retry policy is applied to edges leaving `failed`
//! 4. the store write; a failed write reports `rolled_back`, and an
//!    ambiguous one additionally gets a compensating write back to `from`
//!
//! Handler failures in statuses with no edge to `failed` (`to_refine`) are
//! counted as stalled attempts instead, against the same `max_retries`.

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::errors::StateMachineError;
use super::keyed_lock::KeyedMutex;
use super::states::TaskStatus;
use super::transitions::{self, RetryPolicy};
use crate::config::TransitionConfig;
use crate::error::Result;
use crate::events::EventPublisher;
use crate::logging::log_transition;
use crate::models::{PendingTransition, StatusTransition, TaskId, TransitionResult};
use crate::store::TaskStore;

/// Aggregate counters over every transition attempted by this engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransitionStatistics {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rolled_back: u64,
    /// Successes that were detected as already applied
    pub idempotent: u64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct RetryRecord {
    retries_used: u32,
    failed_from: Option<TaskStatus>,
    /// Handler failures that could not be recorded as a move to `failed`
    stalled_attempts: u32,
}

pub struct TransitionEngine {
    store: Arc<dyn TaskStore>,
    events: EventPublisher,
    policy: RetryPolicy,
    task_locks: KeyedMutex,
    history: Mutex<VecDeque<StatusTransition>>,
    history_limit: usize,
    retries: Mutex<HashMap<TaskId, RetryRecord>>,
    stats: Mutex<TransitionStatistics>,
}

impl std::fmt::Debug for TransitionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionEngine")
            .field("policy", &self.policy)
            .field("history_limit", &self.history_limit)
            .finish()
    }
}

impl TransitionEngine {
    pub fn new(
        store: Arc<dyn TaskStore>,
        events: EventPublisher,
        config: &TransitionConfig,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            store,
            events,
            policy: RetryPolicy::from(config),
            task_locks: KeyedMutex::new(),
            history: Mutex::new(VecDeque::new()),
            history_limit: config.history_limit,
            retries: Mutex::new(HashMap::new()),
            stats: Mutex::new(TransitionStatistics::default()),
        })
    }

    /// Pure allowed-edge check
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        transitions::is_valid_transition(from, to)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    /// Move `task_id` from `from` to `to`. `reason` is recorded as the error
    /// text when the target is `failed`.
    #[instrument(skip(self, reason), fields(task_id = %task_id))]
    pub async fn transition_status(
        &self,
        task_id: &TaskId,
        from: TaskStatus,
        to: TaskStatus,
        reason: Option<String>,
    ) -> StatusTransition {
        let record = if !transitions::is_valid_transition(from, to) {
            let attempt = self.retry_record(task_id).retries_used;
            PendingTransition::begin(task_id.clone(), from, to, attempt)
                .failed(StateMachineError::InvalidTransition { from, to }.to_string())
        } else {
            self.task_locks
                .run_exclusive(task_id.as_str(), self.apply(task_id, from, to, reason))
                .await
        };

        self.finalize(record)
    }

    /// Apply `to` to each task individually, reading each task's current
    /// status as `from`. One task's failure never affects the others.
    #[instrument(skip(self, task_ids), fields(count = task_ids.len(), to = %to))]
    pub async fn batch_transition(&self, task_ids: &[TaskId], to: TaskStatus) -> Vec<StatusTransition> {
        join_all(task_ids.iter().map(|task_id| self.transition_one(task_id, to))).await
    }

    async fn transition_one(&self, task_id: &TaskId, to: TaskStatus) -> StatusTransition {
        let current = match self.store.fetch_task(task_id).await {
            Ok(task) => task.status,
            Err(e) => {
                let attempt = self.retry_record(task_id).retries_used;
                let record = PendingTransition::begin(task_id.clone(), to, to, attempt)
                    .failed(format!("Failed to read current status: {e}"));
                return self.finalize(record);
            }
        };

        if current == to {
            let attempt = self.retry_record(task_id).retries_used;
            let record = PendingTransition::begin(task_id.clone(), current, to, attempt).already_applied();
            return self.finalize(record);
        }

        self.transition_status(task_id, current, to, None).await
    }

    async fn apply(
        &self,
        task_id: &TaskId,
        from: TaskStatus,
        to: TaskStatus,
        reason: Option<String>,
    ) -> StatusTransition {
        let retry = self.retry_record(task_id);
        let pending = PendingTransition::begin(task_id.clone(), from, to, retry.retries_used);

        let current = match self.store.fetch_task(task_id).await {
            Ok(task) => task.status,
            Err(e) => return pending.failed(format!("Failed to read current status: {e}")),
        };

        if current == to {
            debug!(task_id = %task_id, status = %to, "Transition already applied");
            return pending.already_applied();
        }
        if current != from {
            return pending.failed(
                StateMachineError::StatusMismatch {
                    expected: from,
                    actual: current,
                }
                .to_string(),
            );
        }

        if let Err(e) = self
            .policy
            .check(from, to, retry.failed_from, retry.retries_used)
        {
            return pending.failed(e.to_string());
        }

        match self.store.update_status(task_id, to).await {
            Ok(()) => {
                self.record_retry_progress(task_id, from, to);
                let mut record = pending.succeeded();
                if to == TaskStatus::Failed {
                    record.error = reason;
                }
                record
            }
            Err(e) if e.is_ambiguous() => {
                warn!(
                    task_id = %task_id,
                    from = %from,
                    to = %to,
                    error = %e,
                    "Ambiguous store write, attempting compensating write"
                );
                let confirmed = match self.store.update_status(task_id, from).await {
                    Ok(()) => true,
                    Err(rollback_error) => {
                        warn!(
                            task_id = %task_id,
                            error = %rollback_error,
                            "Compensating write failed; true status unknown"
                        );
                        false
                    }
                };
                pending.rolled_back(e.to_string(), confirmed)
            }
            // Definite failure: nothing was applied
            Err(e) => pending.rolled_back(e.to_string(), true),
        }
    }

    fn retry_record(&self, task_id: &TaskId) -> RetryRecord {
        self.retries
            .lock()
            .get(task_id)
            .copied()
            .unwrap_or_default()
    }

    fn record_retry_progress(&self, task_id: &TaskId, from: TaskStatus, to: TaskStatus) {
        let mut retries = self.retries.lock();
        if to == TaskStatus::Done {
            retries.remove(task_id);
            return;
        }

        let record = retries.entry(task_id.clone()).or_default();
        record.stalled_attempts = 0;
        if from == TaskStatus::Failed {
            record.retries_used += 1;
        }
        if to == TaskStatus::Failed {
            record.failed_from = Some(from);
        }
    }

    fn finalize(&self, record: StatusTransition) -> StatusTransition {
        {
            let mut stats = self.stats.lock();
            stats.total += 1;
            match record.result {
                TransitionResult::Success => {
                    stats.succeeded += 1;
                    if record.idempotent {
                        stats.idempotent += 1;
                    }
                }
                TransitionResult::Failed => stats.failed += 1,
                TransitionResult::RolledBack => stats.rolled_back += 1,
            }
            stats.success_rate = stats.succeeded as f64 / stats.total as f64;
        }

        {
            let mut history = self.history.lock();
            if history.len() >= self.history_limit {
                history.pop_front();
            }
            history.push_back(record.clone());
        }

        log_transition(
            record.task_id.as_str(),
            record.from_status,
            record.to_status,
            record.result,
            record.error.as_deref(),
        );
        self.events.publish_transition(&record);

        record
    }

    /// Most recent `limit` records, oldest first, optionally for one task
    pub fn transition_history(&self, task_id: Option<&TaskId>, limit: usize) -> Vec<StatusTransition> {
        let history = self.history.lock();
        let mut matching: Vec<StatusTransition> = history
            .iter()
            .rev()
            .filter(|t| task_id.map_or(true, |id| &t.task_id == id))
            .take(limit)
            .cloned()
            .collect();
        matching.reverse();
        matching
    }

    pub fn statistics(&self) -> TransitionStatistics {
        self.stats.lock().clone()
    }

    /// Retries consumed by `task_id` since it last reached `done`
    pub fn retries_used(&self, task_id: &TaskId) -> u32 {
        self.retry_record(task_id).retries_used
    }

    /// Status the task was in when it last moved to `failed`, if seen by this engine
    pub fn failure_origin(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.retry_record(task_id).failed_from
    }

    /// Whether a `failed` task still has retry budget left
    pub fn can_retry(&self, task_id: &TaskId) -> bool {
        self.retries_used(task_id) < self.policy.max_retries
    }

    /// Count a handler failure for a task left in `status` because that
    /// status has no edge to `failed`. Returns the attempts used so far.
    /// Any later successful transition of the task resets the count.
    pub fn record_stalled_attempt(&self, task_id: &TaskId, status: TaskStatus) -> u32 {
        let attempts = {
            let mut retries = self.retries.lock();
            let record = retries.entry(task_id.clone()).or_default();
            record.stalled_attempts = record.stalled_attempts.saturating_add(1);
            record.stalled_attempts
        };

        if attempts > self.policy.max_retries {
            warn!(
                task_id = %task_id,
                status = %status,
                attempts = attempts,
                max_retries = self.policy.max_retries,
                "Retry limit exceeded, task will not be dispatched again"
            );
        } else {
            debug!(task_id = %task_id, status = %status, attempts = attempts, "Stalled attempt recorded");
        }
        attempts
    }

    pub fn stalled_attempts(&self, task_id: &TaskId) -> u32 {
        self.retry_record(task_id).stalled_attempts
    }

    /// Whether a task that is not in `failed` may be handed to a handler
    /// again: the first attempt plus `max_retries` retries
    pub fn can_attempt(&self, task_id: &TaskId) -> bool {
        self.stalled_attempts(task_id) <= self.policy.max_retries
    }
}
