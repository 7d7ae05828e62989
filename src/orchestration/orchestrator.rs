//! # Task Orchestrator
//!
//! Wires configuration, the task store, both circuit breakers, the lock
//! manager, the transition engine, the handler registry, the dispatcher and
//! the scheduler into one running system.
//!
//! Each scheduler tick runs [`PollAndDispatch`]:
//!
//! 1. Fetch tasks whose status is the entry status of a registered stage,
//!    plus `failed` tasks.
//! 2. Skip tasks the dispatcher is already working on.
//! 3. Retry `failed` tasks with budget left: resume a registered stage from
//!    the status the task failed in, or requeue to `queued_to_run`.
//! 4. Leave tasks whose stage handler already failed more than
//!    `max_retries` times in place (see [`TransitionEngine::can_attempt`]).
//! 5. For exclusive stages, take the processing lock first and leave the
//!    task for a later tick on contention.
//! 6. Submit to the dispatcher without waiting for the outcome.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::dispatcher::Dispatcher;
use super::handler::{HandlerRegistry, ProcessingStage};
use super::scheduler::{PollCallback, PollSummary, Scheduler, SchedulerState};
use crate::config::NomadConfig;
use crate::error::{NomadError, Result};
use crate::events::{spawn_sink_forwarder, EventPublisher, NotificationSink};
use crate::locking::LockManager;
use crate::models::{Task, TaskId};
use crate::resilience::{CircuitBreaker, CircuitState};
use crate::state_machine::{TaskStatus, TransitionEngine, TransitionStatistics};
use crate::store::TaskStore;

const EVENT_CAPACITY: usize = 1000;

/// Point-in-time view of the whole system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    pub scheduler_state: SchedulerState,
    pub polling_circuit: CircuitState,
    pub processing_circuit: CircuitState,
    pub in_flight: usize,
    pub lock_holder: Option<TaskId>,
    pub transitions: TransitionStatistics,
}

/// What happened to one `failed` task during a poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryAction {
    Resumed,
    Requeued,
    Skipped,
}

/// The poll-and-dispatch callback run on every scheduler tick
pub struct PollAndDispatch {
    store: Arc<dyn TaskStore>,
    engine: Arc<TransitionEngine>,
    registry: Arc<HandlerRegistry>,
    dispatcher: Arc<Dispatcher>,
    locks: Arc<LockManager>,
}

impl PollAndDispatch {
    pub fn new(
        store: Arc<dyn TaskStore>,
        engine: Arc<TransitionEngine>,
        registry: Arc<HandlerRegistry>,
        dispatcher: Arc<Dispatcher>,
        locks: Arc<LockManager>,
    ) -> Self {
        Self {
            store,
            engine,
            registry,
            dispatcher,
            locks,
        }
    }

    /// Submit `task` to `stage`'s handler. Returns false when the task was
    /// left for a later tick.
    async fn dispatch(&self, task: Task, stage: ProcessingStage) -> Result<bool> {
        let Some(handler) = self.registry.handler(stage) else {
            return Ok(false);
        };

        let lock = if stage.is_exclusive() {
            match self.locks.try_acquire_guard(&task.id) {
                Some(guard) => Some(guard),
                None => {
                    debug!(task_id = %task.id, stage = %stage, "🔒 Processing lock busy, task left for next poll");
                    return Ok(false);
                }
            }
        } else {
            None
        };

        // The outcome is reported through the transition engine; nobody waits on the handle
        let _handle = self.dispatcher.submit_with_lock(task, handler, lock).await?;
        Ok(true)
    }

    async fn retry_failed(&self, task: Task) -> Result<RetryAction> {
        if !self.engine.can_retry(&task.id) {
            debug!(
                task_id = %task.id,
                retries_used = self.engine.retries_used(&task.id),
                "Retry budget exhausted, leaving task failed"
            );
            return Ok(RetryAction::Skipped);
        }

        let resume_stage = self
            .engine
            .failure_origin(&task.id)
            .filter(|origin| {
                self.engine.retry_policy().allow_resume_from_origin
                    && *origin != TaskStatus::QueuedToRun
            })
            .and_then(|origin| self.registry.stage_for_working_status(origin));

        if let Some(stage) = resume_stage {
            info!(task_id = %task.id, stage = %stage, "🔁 Resuming failed task");
            return Ok(if self.dispatch(task, stage).await? {
                RetryAction::Resumed
            } else {
                RetryAction::Skipped
            });
        }

        let requeue = self
            .engine
            .transition_status(&task.id, TaskStatus::Failed, TaskStatus::QueuedToRun, None)
            .await;
        if requeue.is_success() {
            info!(task_id = %task.id, "🔁 Failed task requeued");
            Ok(RetryAction::Requeued)
        } else {
            warn!(
                task_id = %task.id,
                error = requeue.error.as_deref().unwrap_or("unknown"),
                "Could not requeue failed task"
            );
            Ok(RetryAction::Skipped)
        }
    }
}

#[async_trait]
impl PollCallback for PollAndDispatch {
    async fn poll(&self) -> Result<PollSummary> {
        let mut statuses = self.registry.eligible_statuses();
        statuses.push(TaskStatus::Failed);

        let tasks = self.store.fetch_eligible_tasks(&statuses).await?;
        let mut summary = PollSummary {
            tasks_found: tasks.len(),
            ..PollSummary::default()
        };

        for task in tasks {
            if self.dispatcher.is_in_flight(&task.id) {
                summary.tasks_skipped += 1;
                continue;
            }

            if task.status == TaskStatus::Failed {
                match self.retry_failed(task).await? {
                    RetryAction::Resumed => summary.tasks_dispatched += 1,
                    RetryAction::Requeued => summary.tasks_requeued += 1,
                    RetryAction::Skipped => summary.tasks_skipped += 1,
                }
                continue;
            }

            let Some(stage) = self.registry.stage_for_status(task.status) else {
                summary.tasks_skipped += 1;
                continue;
            };
            if !self.engine.can_attempt(&task.id) {
                debug!(
                    task_id = %task.id,
                    attempts = self.engine.stalled_attempts(&task.id),
                    "Retry budget exhausted, leaving task in place"
                );
                summary.tasks_skipped += 1;
                continue;
            }
            if self.dispatch(task, stage).await? {
                summary.tasks_dispatched += 1;
            } else {
                summary.tasks_skipped += 1;
            }
        }

        Ok(summary)
    }
}

pub struct TaskOrchestrator {
    config: NomadConfig,
    store: Arc<dyn TaskStore>,
    events: EventPublisher,
    engine: Arc<TransitionEngine>,
    locks: Arc<LockManager>,
    processing_breaker: Arc<CircuitBreaker>,
    registry: Arc<HandlerRegistry>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Scheduler,
    poller: Arc<PollAndDispatch>,
}

impl std::fmt::Debug for TaskOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskOrchestrator")
            .field("registry", &self.registry)
            .field("dispatcher", &self.dispatcher)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl TaskOrchestrator {
    /// Validate `config` and build every component. The dispatcher's workers
    /// start immediately; polling starts with [`TaskOrchestrator::start`].
    pub async fn bootstrap(
        config: NomadConfig,
        store: Arc<dyn TaskStore>,
        registry: HandlerRegistry,
    ) -> Result<Self> {
        info!("🚀 BOOTSTRAP: Starting task orchestrator bootstrap");

        config.validate()?;
        if registry.is_empty() {
            return Err(NomadError::InvalidState(
                "at least one task handler must be registered".to_string(),
            ));
        }

        let events = EventPublisher::new(EVENT_CAPACITY);
        let engine = Arc::new(TransitionEngine::new(
            store.clone(),
            events.clone(),
            &config.transitions,
        )?);
        let locks = Arc::new(LockManager::new(config.locking.ttl()));
        let polling_breaker = Arc::new(CircuitBreaker::new(
            "polling".to_string(),
            config.circuit_breakers.polling.to_breaker_config(),
        ));
        let processing_breaker = Arc::new(CircuitBreaker::new(
            "processing".to_string(),
            config.circuit_breakers.processing.to_breaker_config(),
        ));

        let dispatcher = Arc::new(Dispatcher::start(
            &config.dispatcher,
            engine.clone(),
            store.clone(),
            locks.clone(),
            processing_breaker.clone(),
        )?);
        let scheduler = Scheduler::new("task-poller", polling_breaker, &config.scheduler);

        let registry = Arc::new(registry);
        let poller = Arc::new(PollAndDispatch::new(
            store.clone(),
            engine.clone(),
            registry.clone(),
            dispatcher.clone(),
            locks.clone(),
        ));

        info!(
            stages = ?registry.stages(),
            worker_count = dispatcher.worker_count(),
            "✅ BOOTSTRAP: Task orchestrator ready"
        );

        Ok(Self {
            config,
            store,
            events,
            engine,
            locks,
            processing_breaker,
            registry,
            dispatcher,
            scheduler,
            poller,
        })
    }

    /// Start continuous polling. A no-op when `scheduler.enabled` is false.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        if !self.config.scheduler.enabled {
            info!("📋 Continuous polling disabled, use poll_once for manual control");
            return Ok(());
        }
        self.scheduler
            .start(self.config.scheduler.poll_interval(), self.poller.clone())
            .await
    }

    /// Stop polling, then drain the dispatcher
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        info!("🛑 Shutting down task orchestrator");
        self.scheduler
            .stop(self.config.scheduler.drain_timeout())
            .await?;
        self.dispatcher
            .shutdown(self.config.dispatcher.shutdown_grace())
            .await;
        Ok(())
    }

    /// Run one poll-and-dispatch pass directly, outside the scheduler and
    /// its circuit breaker
    pub async fn poll_once(&self) -> Result<PollSummary> {
        self.poller.poll().await
    }

    /// Forward transition events to `sink` until the orchestrator is dropped
    pub fn attach_sink(&self, sink: Arc<dyn NotificationSink>) -> JoinHandle<()> {
        spawn_sink_forwarder(&self.events, sink)
    }

    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            scheduler_state: self.scheduler.state(),
            polling_circuit: self.scheduler.breaker().state(),
            processing_circuit: self.processing_breaker.state(),
            in_flight: self.dispatcher.in_flight_count(),
            lock_holder: self.locks.current_holder().map(|token| token.holder_task_id),
            transitions: self.engine.statistics(),
        }
    }

    pub fn config(&self) -> &NomadConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    pub fn engine(&self) -> &Arc<TransitionEngine> {
        &self.engine
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DispatcherConfig, TransitionConfig};
    use crate::orchestration::handler::TaskHandler;
    use crate::store::{InMemoryTaskStore, InjectedFault};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct StageHandler {
        stage: ProcessingStage,
        delay: Duration,
    }

    #[async_trait]
    impl TaskHandler for StageHandler {
        fn name(&self) -> &str {
            "stage-handler"
        }

        fn stage(&self) -> ProcessingStage {
            self.stage
        }

        async fn handle(&self, _task: &Task) -> anyhow::Result<()> {
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    fn registry(delay: Duration) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        for stage in ProcessingStage::ALL {
            registry
                .register(Arc::new(StageHandler { stage, delay }))
                .unwrap();
        }
        registry
    }

    fn test_config() -> NomadConfig {
        let mut config = NomadConfig::default();
        config.scheduler.enabled = false;
        config.dispatcher = DispatcherConfig {
            worker_count: 4,
            ..DispatcherConfig::default()
        };
        config
    }

    async fn orchestrator(
        tasks: Vec<Task>,
        config: NomadConfig,
        delay: Duration,
    ) -> (Arc<InMemoryTaskStore>, TaskOrchestrator) {
        let store = Arc::new(InMemoryTaskStore::with_tasks(tasks));
        let orchestrator = TaskOrchestrator::bootstrap(config, store.clone(), registry(delay))
            .await
            .unwrap();
        (store, orchestrator)
    }

    async fn settle(orchestrator: &TaskOrchestrator) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while orchestrator.dispatcher().in_flight_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("dispatcher did not settle");
    }

    fn task(id: &str, status: TaskStatus) -> Task {
        Task::with_title(id, status, format!("task {id}"))
    }

    #[tokio::test]
    async fn test_bootstrap_rejects_invalid_config() {
        let mut config = test_config();
        config.dispatcher.worker_count = 0;
        let store = Arc::new(InMemoryTaskStore::new());

        let err = TaskOrchestrator::bootstrap(config, store, registry(Duration::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(err, NomadError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_bootstrap_requires_a_handler() {
        let store = Arc::new(InMemoryTaskStore::new());
        let err = TaskOrchestrator::bootstrap(test_config(), store, HandlerRegistry::new())
            .await
            .unwrap_err();
        assert!(matches!(err, NomadError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_poll_dispatches_every_registered_stage() {
        let (store, orchestrator) = orchestrator(
            vec![
                task("idea", TaskStatus::Ideas),
                task("refine", TaskStatus::ToRefine),
                task("prepare", TaskStatus::PrepareTasks),
                task("run", TaskStatus::QueuedToRun),
            ],
            test_config(),
            Duration::ZERO,
        )
        .await;

        let summary = orchestrator.poll_once().await.unwrap();
        assert_eq!(summary.tasks_found, 3);
        assert_eq!(summary.tasks_dispatched, 3);
        settle(&orchestrator).await;

        assert_eq!(store.status_of(&"idea".into()), Some(TaskStatus::Ideas));
        assert_eq!(store.status_of(&"refine".into()), Some(TaskStatus::Refined));
        assert_eq!(store.status_of(&"prepare".into()), Some(TaskStatus::ReadyToRun));
        assert_eq!(store.status_of(&"run".into()), Some(TaskStatus::Done));
        assert!(orchestrator.status().lock_holder.is_none());

        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_only_one_exclusive_task_per_poll() {
        let (store, orchestrator) = orchestrator(
            vec![
                task("a", TaskStatus::QueuedToRun),
                task("b", TaskStatus::QueuedToRun),
            ],
            test_config(),
            Duration::from_millis(100),
        )
        .await;

        let summary = orchestrator.poll_once().await.unwrap();
        assert_eq!(summary.tasks_dispatched, 1);
        assert_eq!(summary.tasks_skipped, 1);
        assert_eq!(
            orchestrator.status().lock_holder,
            Some(TaskId::from("a"))
        );

        // Neither the in-flight task nor the locked-out one is dispatched
        let summary = orchestrator.poll_once().await.unwrap();
        assert_eq!(summary.tasks_dispatched, 0);

        settle(&orchestrator).await;
        orchestrator.poll_once().await.unwrap();
        settle(&orchestrator).await;

        assert_eq!(store.status_of(&"a".into()), Some(TaskStatus::Done));
        assert_eq!(store.status_of(&"b".into()), Some(TaskStatus::Done));
        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_task_with_unknown_origin_is_requeued() {
        let (store, orchestrator) = orchestrator(
            vec![task("t", TaskStatus::Failed)],
            test_config(),
            Duration::ZERO,
        )
        .await;

        let summary = orchestrator.poll_once().await.unwrap();
        assert_eq!(summary.tasks_requeued, 1);
        assert_eq!(store.status_of(&"t".into()), Some(TaskStatus::QueuedToRun));
        assert_eq!(orchestrator.engine().retries_used(&"t".into()), 1);

        orchestrator.poll_once().await.unwrap();
        settle(&orchestrator).await;
        assert_eq!(store.status_of(&"t".into()), Some(TaskStatus::Done));
        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_task_resumes_from_origin() {
        let (store, orchestrator) = orchestrator(
            vec![task("t", TaskStatus::PreparingTasks)],
            test_config(),
            Duration::ZERO,
        )
        .await;
        let id = TaskId::from("t");

        let failed = orchestrator
            .engine()
            .transition_status(
                &id,
                TaskStatus::PreparingTasks,
                TaskStatus::Failed,
                Some("generator crashed".to_string()),
            )
            .await;
        assert!(failed.is_success());

        let summary = orchestrator.poll_once().await.unwrap();
        assert_eq!(summary.tasks_dispatched, 1);
        settle(&orchestrator).await;

        assert_eq!(store.status_of(&id), Some(TaskStatus::ReadyToRun));
        let history = orchestrator.engine().transition_history(Some(&id), 10);
        assert!(history
            .iter()
            .any(|t| t.from_status == TaskStatus::Failed && t.to_status == TaskStatus::PreparingTasks));
        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_retry_budget_leaves_task_failed() {
        let mut config = test_config();
        config.transitions = TransitionConfig {
            max_retries: 0,
            ..TransitionConfig::default()
        };
        let (store, orchestrator) =
            orchestrator(vec![task("t", TaskStatus::Failed)], config, Duration::ZERO).await;

        let summary = orchestrator.poll_once().await.unwrap();
        assert_eq!(summary.tasks_skipped, 1);
        assert_eq!(store.status_of(&"t".into()), Some(TaskStatus::Failed));
        assert_eq!(store.update_count(), 0);
        orchestrator.shutdown().await.unwrap();
    }

    struct BrokenRefiner {
        invocations: AtomicUsize,
    }

    #[async_trait]
    impl TaskHandler for BrokenRefiner {
        fn name(&self) -> &str {
            "broken-refiner"
        }

        fn stage(&self) -> ProcessingStage {
            ProcessingStage::Refine
        }

        async fn handle(&self, _task: &Task) -> anyhow::Result<()> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("model returned no refinement"))
        }
    }

    #[tokio::test]
    async fn test_failing_refine_stops_after_retry_budget() {
        let mut config = test_config();
        config.circuit_breakers.processing.failure_threshold = 1000;
        config.transitions.max_retries = 3;
        let store = Arc::new(InMemoryTaskStore::with_tasks([task("r", TaskStatus::ToRefine)]));
        let refiner = Arc::new(BrokenRefiner {
            invocations: AtomicUsize::new(0),
        });
        let registry = HandlerRegistry::new().with_handler(refiner.clone()).unwrap();
        let orchestrator = TaskOrchestrator::bootstrap(config, store.clone(), registry)
            .await
            .unwrap();
        let id = TaskId::from("r");

        for _ in 0..10 {
            orchestrator.poll_once().await.unwrap();
            settle(&orchestrator).await;
        }

        // First attempt plus three retries, then the task is left alone
        assert_eq!(refiner.invocations.load(Ordering::SeqCst), 4);
        assert_eq!(orchestrator.engine().stalled_attempts(&id), 4);
        assert!(!orchestrator.engine().can_attempt(&id));
        assert_eq!(store.status_of(&id), Some(TaskStatus::ToRefine));

        let summary = orchestrator.poll_once().await.unwrap();
        assert_eq!(summary.tasks_found, 1);
        assert_eq!(summary.tasks_skipped, 1);
        assert_eq!(summary.tasks_dispatched, 0);
        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_store_outage_fails_the_poll() {
        let (store, orchestrator) = orchestrator(
            vec![task("t", TaskStatus::QueuedToRun)],
            test_config(),
            Duration::ZERO,
        )
        .await;
        store.inject_fetch_faults([InjectedFault::Unavailable]);

        let err = orchestrator.poll_once().await.unwrap_err();
        assert!(matches!(err, NomadError::Store(_)));
        assert!(!err.is_unrecoverable());
        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_is_noop_when_polling_disabled() {
        let (_store, orchestrator) = orchestrator(Vec::new(), test_config(), Duration::ZERO).await;

        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.status().scheduler_state, SchedulerState::Stopped);

        orchestrator.shutdown().await.unwrap();
        assert!(!orchestrator.dispatcher().is_accepting());
    }
}
