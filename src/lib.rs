#![allow(clippy::doc_markdown)] // Allow technical terms in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Nomad Core
//!
//! Orchestration engine for a low-volume task tracker: it polls a task
//! store on a timer, moves tasks through a guarded status workflow, and
//! runs caller-supplied processing handlers on a bounded worker pool.
//!
//! ## Architecture
//!
//! ```text
//! Scheduler ──tick──▶ CircuitBreaker("polling") ──▶ poll-and-dispatch
//!                                                        │
//!                      LockManager (exclusive stages) ◀──┤
//!                                                        ▼
//!                     Dispatcher ──▶ CircuitBreaker("processing") ──▶ TaskHandler
//!                         │
//!                         ▼
//!                  TransitionEngine ──▶ TaskStore
//!                         │
//!                         ▼
//!                  EventPublisher ──▶ NotificationSink
//! ```
//!
//! ## Module Organization
//!
//! - [`config`] - Typed configuration, validation and file/env loading
//! - [`error`] - Crate-wide error type
//! - [`events`] - Transition events and notification sinks
//! - [`locking`] - Single-slot processing lock with TTL
//! - [`logging`] - Structured logging setup and helpers
//! - [`models`] - Tasks, feedback and transition records
//! - [`orchestration`] - Scheduler, dispatcher, handlers and wiring
//! - [`resilience`] - Circuit breakers
//! - [`state_machine`] - Task statuses, allowed edges and the transition engine
//! - [`store`] - Task store collaborator trait and an in-memory store
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use nomad_core::config::NomadConfig;
//! use nomad_core::models::Task;
//! use nomad_core::orchestration::{HandlerRegistry, ProcessingStage, TaskHandler, TaskOrchestrator};
//! use nomad_core::store::InMemoryTaskStore;
//!
//! struct RunCommand;
//!
//! #[async_trait]
//! impl TaskHandler for RunCommand {
//!     fn name(&self) -> &str { "run-command" }
//!     fn stage(&self) -> ProcessingStage { ProcessingStage::Execute }
//!     async fn handle(&self, task: &Task) -> anyhow::Result<()> {
//!         println!("running {}", task.metadata.title);
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> nomad_core::Result<()> {
//! let registry = HandlerRegistry::new().with_handler(Arc::new(RunCommand))?;
//! let store = Arc::new(InMemoryTaskStore::new());
//! let orchestrator = TaskOrchestrator::bootstrap(NomadConfig::default(), store, registry).await?;
//!
//! orchestrator.start().await?;
//! // ...
//! orchestrator.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod locking;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod resilience;
pub mod state_machine;
pub mod store;

pub use config::{ConfigManager, ConfigurationError, NomadConfig};
pub use error::{NomadError, Result};
pub use events::{EventPublisher, NotificationSink, TransitionEvent};
pub use locking::{LockGuard, LockManager, LockToken};
pub use models::{StatusTransition, Task, TaskId, TransitionResult};
pub use orchestration::{
    Dispatcher, HandlerRegistry, Outcome, ProcessingStage, Scheduler, SchedulerState,
    TaskHandler, TaskOrchestrator,
};
pub use resilience::{CircuitBreaker, CircuitState};
pub use state_machine::{TaskStatus, TransitionEngine};
pub use store::{InMemoryTaskStore, TaskStore};
