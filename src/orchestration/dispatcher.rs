//! # Dispatcher
//!
//! Bounded worker pool that runs task handlers and commits their outcome.
//!
//! ```text
//! submit() → [bounded queue] → worker → lock? → breaker permit
//!          → entry → working → handler → success | failed → reply
//! ```
//!
//! Handler errors, panics and timeouts are all converted into a failed
//! outcome. The lock guard for exclusive stages is dropped on every path.

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::handler::{ProcessingStage, TaskHandler};
use crate::config::DispatcherConfig;
use crate::error::{NomadError, Result};
use crate::locking::{LockGuard, LockManager};
use crate::logging::log_task_operation;
use crate::models::{FeedbackEntry, StatusTransition, Task, TaskId};
use crate::resilience::CircuitBreaker;
use crate::state_machine::{is_valid_transition, TaskStatus, TransitionEngine};
use crate::store::TaskStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Handler succeeded and the success status was committed
    Completed,
    Failed,
    /// Not processed: lock contention, open circuit, stale status or shutdown
    Skipped,
}

/// Result of one dispatched job
#[derive(Debug, Clone)]
pub struct Outcome {
    /// Snapshot including the status and feedback written during processing
    pub task: Task,
    pub stage: ProcessingStage,
    pub handler: String,
    pub status: OutcomeStatus,
    pub error: Option<String>,
    pub transitions: Vec<StatusTransition>,
    pub duration: Duration,
}

impl Outcome {
    fn new(task: Task, stage: ProcessingStage, handler: &str) -> Self {
        Self {
            task,
            stage,
            handler: handler.to_string(),
            status: OutcomeStatus::Skipped,
            error: None,
            transitions: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    fn finish(mut self, status: OutcomeStatus, error: Option<String>, started: Instant) -> Self {
        self.status = status;
        self.error = error;
        self.duration = started.elapsed();
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == OutcomeStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status == OutcomeStatus::Failed
    }

    pub fn is_skipped(&self) -> bool {
        self.status == OutcomeStatus::Skipped
    }
}

/// Resolves to the [`Outcome`] of a submitted job
#[derive(Debug)]
pub struct DispatchHandle {
    task_id: TaskId,
    receiver: oneshot::Receiver<Outcome>,
}

impl DispatchHandle {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }
}

impl Future for DispatchHandle {
    type Output = Result<Outcome>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.receiver)
            .poll(cx)
            .map(|reply| reply.map_err(|_| NomadError::DispatcherClosed))
    }
}

struct Job {
    task: Task,
    stage: ProcessingStage,
    handler: Arc<dyn TaskHandler>,
    lock: Option<LockGuard>,
    reply: oneshot::Sender<Outcome>,
}

struct DispatchContext {
    engine: Arc<TransitionEngine>,
    store: Arc<dyn TaskStore>,
    locks: Arc<LockManager>,
    breaker: Arc<CircuitBreaker>,
    handler_timeout: Duration,
    draining: AtomicBool,
    in_flight: DashMap<TaskId, ProcessingStage>,
}

/// Removes the in-flight marker even if the worker is aborted mid-job
struct InFlightMarker<'a> {
    in_flight: &'a DashMap<TaskId, ProcessingStage>,
    task_id: TaskId,
}

impl Drop for InFlightMarker<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.task_id);
    }
}

pub struct Dispatcher {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    context: Arc<DispatchContext>,
    worker_count: usize,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("worker_count", &self.worker_count)
            .field("handler_timeout", &self.context.handler_timeout)
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

impl Dispatcher {
    /// Spawn the worker pool. Must be called from within a tokio runtime.
    /// Fails on a zero worker count, queue capacity or handler timeout.
    pub fn start(
        config: &DispatcherConfig,
        engine: Arc<TransitionEngine>,
        store: Arc<dyn TaskStore>,
        locks: Arc<LockManager>,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self> {
        config.validate()?;

        let worker_count = config.worker_count;
        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let context = Arc::new(DispatchContext {
            engine,
            store,
            locks,
            breaker,
            handler_timeout: config.handler_timeout(),
            draining: AtomicBool::new(false),
            in_flight: DashMap::new(),
        });

        let workers = (0..worker_count)
            .map(|worker_id| tokio::spawn(worker_loop(worker_id, receiver.clone(), context.clone())))
            .collect();

        info!(
            worker_count = worker_count,
            queue_capacity = config.queue_capacity,
            handler_timeout_seconds = config.handler_timeout_seconds,
            "🚀 Dispatcher started"
        );

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            context,
            worker_count,
        })
    }

    /// Enqueue a job. Waits only while the bounded queue is full; dropping
    /// the returned future while it waits leaves no trace of the job.
    #[instrument(skip(self, task, handler), fields(task_id = %task.id, handler = %handler.name()))]
    pub async fn submit(&self, task: Task, handler: Arc<dyn TaskHandler>) -> Result<DispatchHandle> {
        self.enqueue(task, handler, None).await
    }

    /// Enqueue a job that already holds the processing lock
    #[instrument(skip(self, task, handler, lock), fields(task_id = %task.id, handler = %handler.name()))]
    pub async fn submit_with_lock(
        &self,
        task: Task,
        handler: Arc<dyn TaskHandler>,
        lock: Option<LockGuard>,
    ) -> Result<DispatchHandle> {
        self.enqueue(task, handler, lock).await
    }

    async fn enqueue(
        &self,
        task: Task,
        handler: Arc<dyn TaskHandler>,
        lock: Option<LockGuard>,
    ) -> Result<DispatchHandle> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or(NomadError::DispatcherClosed)?;

        // Only the wait for a queue slot can be cancelled; the marker is
        // inserted after it, together with the send
        let slot = sender
            .reserve()
            .await
            .map_err(|_| NomadError::DispatcherClosed)?;

        let task_id = task.id.clone();
        let stage = handler.stage();
        let (reply, receiver) = oneshot::channel();
        self.context.in_flight.insert(task_id.clone(), stage);
        slot.send(Job {
            task,
            stage,
            handler,
            lock,
            reply,
        });

        debug!(task_id = %task_id, stage = %stage, "📥 Job queued");
        Ok(DispatchHandle { task_id, receiver })
    }

    /// Whether a job for `task_id` is queued or running
    pub fn is_in_flight(&self, task_id: &TaskId) -> bool {
        self.context.in_flight.contains_key(task_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.context.in_flight.len()
    }

    pub fn is_accepting(&self) -> bool {
        self.sender.lock().is_some()
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Stop accepting submissions immediately. Running handlers get `grace`
    /// to finish; queued jobs that have not started are skipped. Workers
    /// still busy after `grace` are aborted.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, grace: Duration) {
        self.context.draining.store(true, Ordering::Release);
        drop(self.sender.lock().take());

        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }

        let abort_handles: Vec<_> = workers.iter().map(JoinHandle::abort_handle).collect();
        match tokio::time::timeout(grace, futures::future::join_all(workers)).await {
            Ok(_) => info!("🛑 Dispatcher stopped cleanly"),
            Err(_) => {
                warn!(
                    grace_seconds = grace.as_secs(),
                    "⚠️ Dispatcher grace period elapsed, cancelling running handlers"
                );
                for handle in abort_handles {
                    handle.abort();
                }
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    context: Arc<DispatchContext>,
) {
    debug!(worker_id = worker_id, "Dispatcher worker started");

    loop {
        let job = {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        };
        let Some(job) = job else { break };

        let Job {
            task,
            stage,
            handler,
            lock,
            reply,
        } = job;
        let outcome = context.process(task, stage, handler, lock).await;

        // The submitter may have dropped its handle
        let _ = reply.send(outcome);
    }

    debug!(worker_id = worker_id, "Dispatcher worker stopped");
}

impl DispatchContext {
    async fn process(
        &self,
        task: Task,
        stage: ProcessingStage,
        handler: Arc<dyn TaskHandler>,
        lock: Option<LockGuard>,
    ) -> Outcome {
        let started = Instant::now();
        let task_id = task.id.clone();
        let _in_flight = InFlightMarker {
            in_flight: &self.in_flight,
            task_id: task_id.clone(),
        };
        let mut outcome = Outcome::new(task, stage, handler.name());

        if self.draining.load(Ordering::Acquire) {
            return outcome.finish(
                OutcomeStatus::Skipped,
                Some("dispatcher shutting down".to_string()),
                started,
            );
        }

        let _lock = match lock {
            Some(guard) => Some(guard),
            None if stage.is_exclusive() => match self.locks.try_acquire_guard(&task_id) {
                Some(guard) => Some(guard),
                None => {
                    return outcome.finish(
                        OutcomeStatus::Skipped,
                        Some("processing lock held by another task".to_string()),
                        started,
                    )
                }
            },
            None => None,
        };

        let Some(permit) = self.breaker.try_acquire() else {
            return outcome.finish(
                OutcomeStatus::Skipped,
                Some("processing circuit open".to_string()),
                started,
            );
        };

        let mut current = outcome.task.status;
        if let Some(working) = stage.working_status() {
            let start = self
                .engine
                .transition_status(&task_id, current, working, None)
                .await;
            let (succeeded, rolled_back, error) =
                (start.is_success(), start.is_rolled_back(), start.error.clone());
            outcome.transitions.push(start);

            if !succeeded {
                // A failed write counts against the breaker; a stale snapshot does not
                if rolled_back {
                    permit.fail();
                    return outcome.finish(OutcomeStatus::Failed, error, started);
                }
                permit.abandon();
                return outcome.finish(OutcomeStatus::Skipped, error, started);
            }
            current = working;
            outcome.task.status = working;
        }

        self.feedback(
            &mut outcome.task,
            format!("Processing started by {}", handler.name()),
        )
        .await;
        log_task_operation("processing_started", task_id.as_str(), Some(current), Some(handler.name()));

        let execution = tokio::time::timeout(
            self.handler_timeout,
            AssertUnwindSafe(handler.handle(&outcome.task)).catch_unwind(),
        )
        .await;

        let failure = match execution {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(handler_error))) => Some(format!("{handler_error:#}")),
            Ok(Err(panic_error)) => Some(format!("handler panicked: {}", panic_message(&*panic_error))),
            Err(_) => Some(format!(
                "handler timed out after {}s",
                self.handler_timeout.as_secs()
            )),
        };

        match failure {
            None => {
                permit.succeed();
                let success_status = stage.success_status();
                let commit = self
                    .engine
                    .transition_status(&task_id, current, success_status, None)
                    .await;
                let committed = commit.is_success();
                let commit_error = commit.error.clone();
                outcome.transitions.push(commit);

                if committed {
                    outcome.task.status = success_status;
                    self.feedback(&mut outcome.task, "Processing completed".to_string())
                        .await;
                    log_task_operation(
                        "processing_completed",
                        task_id.as_str(),
                        Some(success_status),
                        None,
                    );
                    outcome.finish(OutcomeStatus::Completed, None, started)
                } else {
                    let error = format!(
                        "could not record completion: {}",
                        commit_error.as_deref().unwrap_or("unknown error")
                    );
                    self.feedback(&mut outcome.task, format!("Processing failed: {error}"))
                        .await;
                    outcome.finish(OutcomeStatus::Failed, Some(error), started)
                }
            }
            Some(error) => {
                permit.fail();
                error!(
                    task_id = %task_id,
                    handler = %handler.name(),
                    error = %error,
                    "❌ Handler failed"
                );

                if is_valid_transition(current, TaskStatus::Failed) {
                    let failed = self
                        .engine
                        .transition_status(&task_id, current, TaskStatus::Failed, Some(error.clone()))
                        .await;
                    if failed.is_success() {
                        outcome.task.status = TaskStatus::Failed;
                    }
                    outcome.transitions.push(failed);
                    self.feedback(&mut outcome.task, format!("Processing failed: {error}"))
                        .await;
                } else {
                    let attempts = self.engine.record_stalled_attempt(&task_id, current);
                    let max_retries = self.engine.retry_policy().max_retries;
                    let message = if attempts > max_retries {
                        format!(
                            "Processing failed: {error} (retry limit exceeded after {attempts} attempts, left in {current})"
                        )
                    } else {
                        format!("Processing failed: {error}")
                    };
                    self.feedback(&mut outcome.task, message).await;
                }
                outcome.finish(OutcomeStatus::Failed, Some(error), started)
            }
        }
    }

    /// Append to the store and to the snapshot. Store failures are logged only.
    async fn feedback(&self, task: &mut Task, message: String) {
        if let Err(e) = self.store.append_feedback(&task.id, &message).await {
            warn!(task_id = %task.id, error = %e, "Failed to append feedback to store");
        }
        task.append_feedback(FeedbackEntry::now(message));
    }
}

pub(crate) fn panic_message(panic_error: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic_error.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic_error.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
