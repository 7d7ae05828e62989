//! # Orchestration
//!
//! The moving parts that turn stored tasks into processed ones.
//!
//! ## Core Components
//!
//! - **Scheduler**: timer loop gated by the polling circuit breaker
//! - **Dispatcher**: bounded worker pool running task handlers
//! - **HandlerRegistry**: one typed handler per processing stage
//! - **PollingStrategy**: fixed or backoff delay between ticks
//! - **TaskOrchestrator**: bootstrap and poll-and-dispatch wiring

pub mod dispatcher;
pub mod handler;
pub mod orchestrator;
pub mod polling;
pub mod scheduler;

pub use dispatcher::{DispatchHandle, Dispatcher, Outcome, OutcomeStatus};
pub use handler::{HandlerRegistry, ProcessingStage, TaskHandler};
pub use orchestrator::{OrchestratorStatus, PollAndDispatch, TaskOrchestrator};
pub use polling::{PollContext, PollingStrategy};
pub use scheduler::{
    poll_fn, FnPollCallback, PollCallback, PollOutcome, PollSummary, PollingMetrics, Scheduler,
    SchedulerState,
};
