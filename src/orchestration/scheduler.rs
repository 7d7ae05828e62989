//! # Scheduler
//!
//! Owns the polling timer. Each tick asks the polling circuit breaker for a
//! permit, runs the poll-and-dispatch callback under a timeout, and records
//! the result back to the breaker.
//!
//! ## Lifecycle
//!
//! ```text
//! stopped → starting → running → stopping → stopped
//!                         ↓
//!                       failed   (unrecoverable error, no auto-restart)
//! ```
//!
//! Ticks never overlap: tick N+1 starts only after tick N's callback
//! returned or timed out. `stop()` may be called from any task; the loop
//! observes it at the latest when the current tick ends. Windowed polling
//! strategies can turn a tick into a no-op without touching the breaker.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::dispatcher::panic_message;
use super::polling::{PollContext, PollingStrategy};
use crate::config::{ConfigurationError, SchedulerConfig, MIN_POLL_INTERVAL};
use crate::error::{NomadError, Result};
use crate::logging::log_error;
use crate::resilience::{CircuitBreaker, CircuitState};

/// Polls considered when computing the recent failure rate
const RECENT_POLL_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What one poll found and did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSummary {
    pub tasks_found: usize,
    pub tasks_dispatched: usize,
    /// Failed tasks moved back to queued_to_run
    pub tasks_requeued: usize,
    /// Tasks left for a later tick (lock contention, already in flight)
    pub tasks_skipped: usize,
}

/// Result of a single tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Completed(PollSummary),
    /// Business failure or timeout; recorded by the circuit breaker
    Failed(String),
    /// Circuit open; the callback was not invoked
    Skipped,
}

/// Poll-and-dispatch callback run on every tick. Return
/// `NomadError::Internal` only for corrupted internal state; any other
/// error is a business failure that the circuit breaker absorbs.
#[async_trait]
pub trait PollCallback: Send + Sync {
    async fn poll(&self) -> Result<PollSummary>;
}

/// Adapter turning an async closure into a [`PollCallback`]
pub struct FnPollCallback<F>(F);

#[async_trait]
impl<F, Fut> PollCallback for FnPollCallback<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<PollSummary>> + Send,
{
    async fn poll(&self) -> Result<PollSummary> {
        (self.0)().await
    }
}

pub fn poll_fn<F, Fut>(f: F) -> Arc<dyn PollCallback>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<PollSummary>> + Send + 'static,
{
    Arc::new(FnPollCallback(f))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingMetrics {
    /// Polls where the callback was invoked
    pub total_polls: u64,
    pub successful_polls: u64,
    pub failed_polls: u64,
    /// Ticks skipped because the circuit was open
    pub skipped_polls: u64,
    /// Ticks that fell outside every polling window
    pub outside_window_ticks: u64,
    pub tasks_found: u64,
    /// Tasks found by the most recent successful poll
    pub last_tasks_found: Option<usize>,
    pub tasks_dispatched: u64,
    pub consecutive_unsuccessful: u32,
    pub average_duration: Duration,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub circuit_state: CircuitState,
    pub current_delay: Duration,
    #[serde(skip)]
    total_duration: Duration,
    /// Outcome of the most recent polls, `true` for failures
    #[serde(skip)]
    recent: VecDeque<bool>,
}

impl Default for PollingMetrics {
    fn default() -> Self {
        Self {
            total_polls: 0,
            successful_polls: 0,
            failed_polls: 0,
            skipped_polls: 0,
            outside_window_ticks: 0,
            tasks_found: 0,
            last_tasks_found: None,
            tasks_dispatched: 0,
            consecutive_unsuccessful: 0,
            average_duration: Duration::ZERO,
            last_poll_at: None,
            last_success_at: None,
            last_failure_at: None,
            circuit_state: CircuitState::Closed,
            current_delay: Duration::ZERO,
            total_duration: Duration::ZERO,
            recent: VecDeque::with_capacity(RECENT_POLL_WINDOW),
        }
    }
}

impl PollingMetrics {
    fn record_poll(&mut self, duration: Duration, failed: bool) {
        let now = Utc::now();
        if self.recent.len() == RECENT_POLL_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(failed);
        self.total_polls += 1;
        self.total_duration += duration;
        self.average_duration = self.total_duration / self.total_polls as u32;
        self.last_poll_at = Some(now);
    }

    fn record_success(&mut self, duration: Duration, summary: &PollSummary) {
        self.record_poll(duration, false);
        self.successful_polls += 1;
        self.tasks_found += summary.tasks_found as u64;
        self.last_tasks_found = Some(summary.tasks_found);
        self.tasks_dispatched += summary.tasks_dispatched as u64;
        self.consecutive_unsuccessful = 0;
        self.last_success_at = self.last_poll_at;
    }

    fn record_failure(&mut self, duration: Duration) {
        self.record_poll(duration, true);
        self.failed_polls += 1;
        self.consecutive_unsuccessful = self.consecutive_unsuccessful.saturating_add(1);
        self.last_failure_at = self.last_poll_at;
    }

    fn record_skipped(&mut self) {
        self.skipped_polls += 1;
        self.consecutive_unsuccessful = self.consecutive_unsuccessful.saturating_add(1);
    }

    fn record_outside_window(&mut self) {
        self.outside_window_ticks += 1;
    }

    /// Share of failures among the last polls that invoked the callback
    pub fn recent_failure_rate(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        let failures = self.recent.iter().filter(|failed| **failed).count();
        failures as f64 / self.recent.len() as f64
    }

    pub fn poll_context(&self) -> PollContext {
        PollContext {
            consecutive_unsuccessful: self.consecutive_unsuccessful,
            queue_depth: self.last_tasks_found,
            recent_failure_rate: self.recent_failure_rate(),
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_polls == 0 {
            return 0.0;
        }
        self.successful_polls as f64 / self.total_polls as f64
    }
}

struct SchedulerShared {
    name: String,
    breaker: Arc<CircuitBreaker>,
    tick_timeout: Duration,
    strategy: PollingStrategy,
    state: Mutex<SchedulerState>,
    metrics: Mutex<PollingMetrics>,
    callback: Mutex<Option<Arc<dyn PollCallback>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    /// Serializes loop ticks with `force_poll`
    tick_lock: tokio::sync::Mutex<()>,
    /// Woken when a stop in progress reaches `stopped`
    stopped: Notify,
}

impl SchedulerShared {
    async fn tick(&self, callback: &Arc<dyn PollCallback>) -> Result<PollOutcome> {
        let _tick = self.tick_lock.lock().await;

        let Some(permit) = self.breaker.try_acquire() else {
            self.metrics.lock().record_skipped();
            info!(scheduler = %self.name, "⚠️ Circuit breaker is open, skipping poll");
            return Ok(PollOutcome::Skipped);
        };

        debug!(scheduler = %self.name, trial = permit.is_trial(), "🔍 Starting poll");
        let started = Instant::now();
        let result = tokio::time::timeout(
            self.tick_timeout,
            AssertUnwindSafe(callback.poll()).catch_unwind(),
        )
        .await;
        let duration = started.elapsed();

        match result {
            Ok(Ok(Ok(summary))) => {
                permit.succeed();
                self.metrics.lock().record_success(duration, &summary);
                info!(
                    scheduler = %self.name,
                    duration_ms = duration.as_millis(),
                    tasks_found = summary.tasks_found,
                    tasks_dispatched = summary.tasks_dispatched,
                    "✅ Poll completed"
                );
                Ok(PollOutcome::Completed(summary))
            }
            Ok(Ok(Err(e))) if e.is_unrecoverable() => {
                permit.fail();
                self.metrics.lock().record_failure(duration);
                Err(e)
            }
            Ok(Ok(Err(e))) => {
                permit.fail();
                self.metrics.lock().record_failure(duration);
                error!(
                    scheduler = %self.name,
                    duration_ms = duration.as_millis(),
                    error = %e,
                    "❌ Poll failed"
                );
                Ok(PollOutcome::Failed(e.to_string()))
            }
            Ok(Err(panic_error)) => {
                permit.fail();
                self.metrics.lock().record_failure(duration);
                Err(NomadError::Internal(format!(
                    "poll callback panicked: {}",
                    panic_message(&*panic_error)
                )))
            }
            Err(_) => {
                permit.fail();
                self.metrics.lock().record_failure(duration);
                warn!(
                    scheduler = %self.name,
                    timeout_seconds = self.tick_timeout.as_secs(),
                    "⏰ Poll timed out"
                );
                Ok(PollOutcome::Failed(format!(
                    "poll timed out after {}s",
                    self.tick_timeout.as_secs()
                )))
            }
        }
    }

    /// Move to `failed` and stop the loop. Never auto-restarts.
    fn fail(&self, error: &NomadError) {
        {
            let mut state = self.state.lock();
            if matches!(*state, SchedulerState::Running | SchedulerState::Starting) {
                *state = SchedulerState::Failed;
            }
        }
        if let Some(shutdown) = self.shutdown.lock().as_ref() {
            let _ = shutdown.send(true);
        }
        log_error("scheduler", "poll", &error.to_string(), Some(self.name.as_str()));
    }
}

async fn run_loop(
    shared: Arc<SchedulerShared>,
    callback: Arc<dyn PollCallback>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(scheduler = %shared.name, interval_seconds = interval.as_secs(), "🔄 Polling loop started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        if shared.strategy.should_poll(Utc::now()) {
            if let Err(e) = shared.tick(&callback).await {
                shared.fail(&e);
                break;
            }
        } else {
            shared.metrics.lock().record_outside_window();
            debug!(scheduler = %shared.name, "🌙 Outside polling windows, tick skipped");
        }

        let delay = {
            let mut metrics = shared.metrics.lock();
            let context = metrics.poll_context();
            metrics.current_delay = shared.strategy.next_delay(interval, &context);
            metrics.current_delay
        };
        debug!(scheduler = %shared.name, delay_ms = delay.as_millis(), "⏱️ Waiting for next poll");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!(scheduler = %shared.name, "🏁 Polling loop finished");
}

pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("strategy", &self.shared.strategy)
            .finish()
    }
}

impl Scheduler {
    pub fn new(name: impl Into<String>, breaker: Arc<CircuitBreaker>, config: &SchedulerConfig) -> Self {
        Self::with_strategy(
            name,
            breaker,
            config.tick_timeout(),
            PollingStrategy::from_config(config),
        )
    }

    pub fn with_strategy(
        name: impl Into<String>,
        breaker: Arc<CircuitBreaker>,
        tick_timeout: Duration,
        strategy: PollingStrategy,
    ) -> Self {
        Self {
            shared: Arc::new(SchedulerShared {
                name: name.into(),
                breaker,
                tick_timeout,
                strategy,
                state: Mutex::new(SchedulerState::Stopped),
                metrics: Mutex::new(PollingMetrics::default()),
                callback: Mutex::new(None),
                shutdown: Mutex::new(None),
                tick_lock: tokio::sync::Mutex::new(()),
                stopped: Notify::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.shared.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == SchedulerState::Running
    }

    /// Start ticking every `interval`; the first tick runs immediately
    #[instrument(skip(self, callback), fields(scheduler = %self.shared.name))]
    pub async fn start(&self, interval: Duration, callback: Arc<dyn PollCallback>) -> Result<()> {
        if interval < MIN_POLL_INTERVAL {
            return Err(ConfigurationError::invalid_value(
                "scheduler.poll_interval_seconds",
                interval.as_secs_f64(),
                format!(
                    "polling interval must be at least {}s",
                    MIN_POLL_INTERVAL.as_secs()
                ),
            )
            .into());
        }

        {
            let mut state = self.shared.state.lock();
            if *state != SchedulerState::Stopped {
                return Err(NomadError::AlreadyRunning);
            }
            *state = SchedulerState::Starting;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shared.shutdown.lock() = Some(shutdown_tx);
        *self.shared.callback.lock() = Some(callback.clone());
        *self.shared.state.lock() = SchedulerState::Running;

        let handle = tokio::spawn(run_loop(
            self.shared.clone(),
            callback,
            interval,
            shutdown_rx,
        ));
        *self.handle.lock() = Some(handle);

        info!(
            scheduler = %self.shared.name,
            interval_seconds = interval.as_secs(),
            "🚀 Scheduler started"
        );
        Ok(())
    }

    /// Stop ticking. Waits up to `drain_timeout` for an in-flight tick, then
    /// cancels it. Idempotent when already stopped; resets a failed scheduler.
    /// A call made while another stop is draining returns once that stop
    /// has finished.
    #[instrument(skip(self), fields(scheduler = %self.shared.name))]
    pub async fn stop(&self, drain_timeout: Duration) -> Result<()> {
        let in_progress = {
            let mut state = self.shared.state.lock();
            match *state {
                SchedulerState::Stopped => return Ok(()),
                // Registered under the state lock so the final notify cannot be missed
                SchedulerState::Stopping => Some(self.shared.stopped.notified()),
                _ => {
                    *state = SchedulerState::Stopping;
                    None
                }
            }
        };
        if let Some(stopped) = in_progress {
            debug!(scheduler = %self.shared.name, "Stop already in progress, waiting for it");
            stopped.await;
            return Ok(());
        }

        if let Some(shutdown) = self.shared.shutdown.lock().take() {
            let _ = shutdown.send(true);
        }

        let handle = self.handle.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(drain_timeout, &mut handle).await.is_err() {
                handle.abort();
                warn!(
                    scheduler = %self.shared.name,
                    drain_timeout_seconds = drain_timeout.as_secs(),
                    "⚠️ Unclean shutdown: in-flight poll cancelled after drain timeout"
                );
            }
        }

        *self.shared.callback.lock() = None;
        *self.shared.state.lock() = SchedulerState::Stopped;
        self.shared.stopped.notify_waiters();
        info!(scheduler = %self.shared.name, "🛑 Scheduler stopped");
        Ok(())
    }

    /// Run one tick now, through the same circuit breaker gate. Polling
    /// windows do not apply to forced polls.
    #[instrument(skip(self), fields(scheduler = %self.shared.name))]
    pub async fn force_poll(&self) -> Result<PollOutcome> {
        if !self.is_running() {
            return Err(NomadError::InvalidState(format!(
                "cannot force a poll while scheduler is {}",
                self.state()
            )));
        }
        let callback = self
            .shared
            .callback
            .lock()
            .clone()
            .ok_or_else(|| NomadError::InvalidState("no poll callback installed".to_string()))?;

        info!(scheduler = %self.shared.name, "🔧 Forcing immediate poll");
        match self.shared.tick(&callback).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.shared.fail(&e);
                Err(e)
            }
        }
    }

    pub fn metrics(&self) -> PollingMetrics {
        let mut snapshot = self.shared.metrics.lock().clone();
        snapshot.circuit_state = self.shared.breaker.state();
        snapshot
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.shared.breaker
    }
}
