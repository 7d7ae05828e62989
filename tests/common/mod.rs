#![allow(dead_code)]

pub mod strategies;

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nomad_core::config::{DispatcherConfig, TransitionConfig};
use nomad_core::events::EventPublisher;
use nomad_core::locking::LockManager;
use nomad_core::models::Task;
use nomad_core::orchestration::{Dispatcher, ProcessingStage, TaskHandler};
use nomad_core::resilience::{CircuitBreaker, CircuitBreakerConfig};
use nomad_core::state_machine::{TaskStatus, TransitionEngine};
use nomad_core::store::InMemoryTaskStore;

pub fn task(id: &str, status: TaskStatus) -> Task {
    Task::with_title(id, status, format!("Task {id}"))
}

/// What a [`ScriptedHandler`] does when invoked
#[derive(Debug, Clone, Copy)]
pub enum Script {
    Succeed,
    Fail,
    Sleep(Duration),
}

pub struct ScriptedHandler {
    pub stage: ProcessingStage,
    pub script: Script,
    pub invocations: AtomicUsize,
}

impl ScriptedHandler {
    pub fn new(stage: ProcessingStage, script: Script) -> Arc<Self> {
        Arc::new(Self {
            stage,
            script,
            invocations: AtomicUsize::new(0),
        })
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for ScriptedHandler {
    fn name(&self) -> &str {
        "scripted"
    }

    fn stage(&self) -> ProcessingStage {
        self.stage
    }

    async fn handle(&self, task: &Task) -> anyhow::Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        match self.script {
            Script::Succeed => Ok(()),
            Script::Fail => anyhow::bail!("command for {} exited with status 1", task.id),
            Script::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
        }
    }
}

/// Every component below the scheduler, wired against an in-memory store
pub struct Harness {
    pub store: Arc<InMemoryTaskStore>,
    pub events: EventPublisher,
    pub engine: Arc<TransitionEngine>,
    pub locks: Arc<LockManager>,
    pub breaker: Arc<CircuitBreaker>,
    pub dispatcher: Dispatcher,
}

impl Harness {
    pub fn new(tasks: Vec<Task>) -> Self {
        let store = Arc::new(InMemoryTaskStore::with_tasks(tasks));
        let events = EventPublisher::new(256);
        let engine = Arc::new(
            TransitionEngine::new(store.clone(), events.clone(), &TransitionConfig::default())
                .expect("default transition config is valid"),
        );
        let locks = Arc::new(LockManager::new(Duration::from_secs(3600)));
        let breaker = Arc::new(CircuitBreaker::new(
            "processing".to_string(),
            CircuitBreakerConfig::new(3, Duration::from_secs(120)),
        ));
        let dispatcher = Dispatcher::start(
            &DispatcherConfig::default(),
            engine.clone(),
            store.clone(),
            locks.clone(),
            breaker.clone(),
        )
        .expect("default dispatcher config is valid");

        Self {
            store,
            events,
            engine,
            locks,
            breaker,
            dispatcher,
        }
    }
}
