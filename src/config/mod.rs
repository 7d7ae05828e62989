//! # Nomad Configuration System
//!
//! Typed configuration for the orchestration engine. Every section has
//! conservative defaults suited to a low-volume task tracker, and the whole
//! tree is validated before any component starts.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use nomad_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load_from_file("config/nomad.toml")?;
//! let interval = manager.config().scheduler.poll_interval();
//! let workers = manager.config().dispatcher.worker_count;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use chrono::Weekday;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::resilience::CircuitBreakerConfig;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Lowest polling interval the scheduler accepts
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Root configuration for the orchestration engine
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NomadConfig {
    pub scheduler: SchedulerConfig,
    pub circuit_breakers: CircuitBreakersConfig,
    pub dispatcher: DispatcherConfig,
    pub locking: LockingConfig,
    pub transitions: TransitionConfig,
    pub logging: LoggingConfig,
}

/// How the delay between scheduler ticks is computed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollingStrategyKind {
    /// Constant interval between ticks
    #[default]
    Fixed,
    /// Interval doubles after each failed or skipped tick, resets on success
    ExponentialBackoff,
    /// Interval shrinks with queue depth and grows with the recent failure rate
    Adaptive,
    /// Fixed interval, but ticks outside the configured windows are skipped
    ScheduledWindows,
}

/// Bounds for the adaptive strategy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdaptivePollingConfig {
    pub min_interval_seconds: u64,
    pub max_interval_seconds: u64,
    /// Tasks found per poll above which polling speeds up
    pub queue_threshold: usize,
}

impl Default for AdaptivePollingConfig {
    fn default() -> Self {
        Self {
            min_interval_seconds: 15,
            max_interval_seconds: 3600,
            queue_threshold: 5,
        }
    }
}

impl AdaptivePollingConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_seconds)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_interval_seconds)
    }
}

/// Hours `[start_hour, end_hour)` on the listed days during which polling is allowed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollingWindow {
    pub start_hour: u32,
    pub end_hour: u32,
    pub days: Vec<Weekday>,
}

impl PollingWindow {
    pub fn new(start_hour: u32, end_hour: u32, days: impl IntoIterator<Item = Weekday>) -> Self {
        Self {
            start_hour,
            end_hour,
            days: days.into_iter().collect(),
        }
    }

    pub fn contains(&self, weekday: Weekday, hour: u32) -> bool {
        self.days.contains(&weekday) && (self.start_hour..self.end_hour).contains(&hour)
    }

    fn validate(&self, index: usize) -> ConfigResult<()> {
        let field = |name: &str| format!("scheduler.windows[{index}].{name}");
        if self.end_hour > 24 {
            return Err(ConfigurationError::invalid_value(
                field("end_hour"),
                self.end_hour,
                "end hour must be at most 24",
            ));
        }
        if self.start_hour >= self.end_hour {
            return Err(ConfigurationError::invalid_value(
                field("start_hour"),
                self.start_hour,
                format!("start hour must be before end hour {}", self.end_hour),
            ));
        }
        if self.days.is_empty() {
            return Err(ConfigurationError::missing_required_field(
                field("days"),
                "polling window",
            ));
        }
        Ok(())
    }
}

/// Weekdays 9-17 and weekends 10-14
fn default_windows() -> Vec<PollingWindow> {
    use Weekday::*;
    vec![
        PollingWindow::new(9, 17, [Mon, Tue, Wed, Thu, Fri]),
        PollingWindow::new(10, 14, [Sat, Sun]),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Whether continuous polling should be started at all
    pub enabled: bool,
    pub poll_interval_seconds: u64,
    /// Poll callbacks running longer than this count as failures
    pub tick_timeout_seconds: u64,
    pub drain_timeout_seconds: u64,
    pub strategy: PollingStrategyKind,
    pub max_backoff_seconds: u64,
    pub adaptive: AdaptivePollingConfig,
    pub windows: Vec<PollingWindow>,
    /// Offset applied to UTC before matching `windows`
    pub utc_offset_hours: i32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_seconds: 60,
            tick_timeout_seconds: 120,
            drain_timeout_seconds: 30,
            strategy: PollingStrategyKind::Fixed,
            max_backoff_seconds: 3600,
            adaptive: AdaptivePollingConfig::default(),
            windows: default_windows(),
            utc_offset_hours: 0,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn tick_timeout(&self) -> Duration {
        Duration::from_secs(self.tick_timeout_seconds)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_seconds)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_seconds)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.poll_interval() < MIN_POLL_INTERVAL {
            return Err(ConfigurationError::invalid_value(
                "scheduler.poll_interval_seconds",
                self.poll_interval_seconds,
                format!(
                    "polling interval must be at least {}s",
                    MIN_POLL_INTERVAL.as_secs()
                ),
            ));
        }
        if self.tick_timeout_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.tick_timeout_seconds",
                0,
                "tick timeout must be greater than 0",
            ));
        }
        if self.max_backoff_seconds < self.poll_interval_seconds {
            return Err(ConfigurationError::invalid_value(
                "scheduler.max_backoff_seconds",
                self.max_backoff_seconds,
                "max backoff must not be below the polling interval",
            ));
        }

        let adaptive = &self.adaptive;
        if adaptive.min_interval() < MIN_POLL_INTERVAL {
            return Err(ConfigurationError::invalid_value(
                "scheduler.adaptive.min_interval_seconds",
                adaptive.min_interval_seconds,
                format!(
                    "adaptive minimum must be at least {}s",
                    MIN_POLL_INTERVAL.as_secs()
                ),
            ));
        }
        if adaptive.max_interval_seconds < adaptive.min_interval_seconds {
            return Err(ConfigurationError::invalid_value(
                "scheduler.adaptive.max_interval_seconds",
                adaptive.max_interval_seconds,
                "adaptive maximum must not be below the minimum",
            ));
        }
        if adaptive.queue_threshold == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.adaptive.queue_threshold",
                0,
                "queue threshold must be at least 1",
            ));
        }

        for (index, window) in self.windows.iter().enumerate() {
            window.validate(index)?;
        }
        if self.strategy == PollingStrategyKind::ScheduledWindows && self.windows.is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "scheduler.windows",
                "scheduled_windows polling strategy",
            ));
        }
        if !(-12..=14).contains(&self.utc_offset_hours) {
            return Err(ConfigurationError::invalid_value(
                "scheduler.utc_offset_hours",
                self.utc_offset_hours,
                "offset must be between -12 and 14",
            ));
        }

        Ok(())
    }
}

/// Thresholds for one monitored operation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub cooldown_seconds: u64,
}

impl BreakerSettings {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_secs(self.cooldown_seconds),
        }
    }
}

/// Polling and processing breakers are configured independently
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakersConfig {
    pub polling: BreakerSettings,
    pub processing: BreakerSettings,
}

impl Default for CircuitBreakersConfig {
    fn default() -> Self {
        Self {
            polling: BreakerSettings {
                failure_threshold: 5,
                cooldown_seconds: 60,
            },
            processing: BreakerSettings {
                failure_threshold: 3,
                cooldown_seconds: 120,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatcherConfig {
    pub worker_count: usize,
    /// Submissions beyond this many queued jobs block the submitter
    pub queue_capacity: usize,
    pub handler_timeout_seconds: u64,
    pub shutdown_grace_seconds: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            queue_capacity: 16,
            handler_timeout_seconds: 1800,
            shutdown_grace_seconds: 30,
        }
    }
}

impl DispatcherConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.worker_count == 0 {
            return Err(ConfigurationError::invalid_value(
                "dispatcher.worker_count",
                0,
                "worker count must be at least 1",
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "dispatcher.queue_capacity",
                0,
                "queue capacity must be at least 1",
            ));
        }
        if self.handler_timeout_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "dispatcher.handler_timeout_seconds",
                0,
                "handler timeout must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LockingConfig {
    /// Hard ceiling on how long one task may hold the in-progress slot
    pub ttl_seconds: u64,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self { ttl_seconds: 3600 }
    }
}

impl LockingConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransitionConfig {
    /// Retries allowed out of `failed` before the task is left there
    pub max_retries: u32,
    pub history_limit: usize,
    /// Permit `failed -> <status it failed from>` in addition to `failed -> queued_to_run`
    pub allow_resume_from_origin: bool,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            history_limit: 1000,
            allow_resume_from_origin: true,
        }
    }
}

impl TransitionConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.history_limit == 0 {
            return Err(ConfigurationError::invalid_value(
                "transitions.history_limit",
                0,
                "history limit must be at least 1",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive; falls back to an environment-derived level when unset
    pub level: Option<String>,
    pub format: LogFormat,
}

impl NomadConfig {
    /// Validate every section, failing on the first invalid value
    pub fn validate(&self) -> ConfigResult<()> {
        self.scheduler.validate()?;

        for (name, settings) in [
            ("polling", &self.circuit_breakers.polling),
            ("processing", &self.circuit_breakers.processing),
        ] {
            if settings.failure_threshold == 0 {
                return Err(ConfigurationError::invalid_value(
                    format!("circuit_breakers.{name}.failure_threshold"),
                    0,
                    "failure threshold must be greater than 0",
                ));
            }
            if settings.cooldown_seconds == 0 {
                return Err(ConfigurationError::invalid_value(
                    format!("circuit_breakers.{name}.cooldown_seconds"),
                    0,
                    "cooldown must be greater than 0",
                ));
            }
        }

        self.dispatcher.validate()?;

        if self.locking.ttl_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "locking.ttl_seconds",
                0,
                "lock ttl must be greater than 0",
            ));
        }
        // A lock that expires mid-handler would let a second exclusive task start
        if self.locking.ttl_seconds < self.dispatcher.handler_timeout_seconds {
            return Err(ConfigurationError::invalid_value(
                "locking.ttl_seconds",
                self.locking.ttl_seconds,
                format!(
                    "lock ttl must cover the handler timeout of {}s",
                    self.dispatcher.handler_timeout_seconds
                ),
            ));
        }

        self.transitions.validate()?;

        if let Some(level) = &self.logging.level {
            if level.trim().is_empty() {
                return Err(ConfigurationError::invalid_value(
                    "logging.level",
                    "\"\"",
                    "log level must not be blank when set",
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(NomadConfig::default().validate().is_ok());
    }

    #[test]
    fn test_poll_interval_floor_is_enforced() {
        let mut config = NomadConfig::default();
        config.scheduler.poll_interval_seconds = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(err.field(), Some("scheduler.poll_interval_seconds"));
    }

    #[test]
    fn test_zero_workers_rejected_not_clamped() {
        let mut config = NomadConfig::default();
        config.dispatcher.worker_count = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(err.field(), Some("dispatcher.worker_count"));
        assert_eq!(config.dispatcher.worker_count, 0);
    }

    #[test]
    fn test_breakers_validated_independently() {
        let mut config = NomadConfig::default();
        config.circuit_breakers.processing.cooldown_seconds = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(err.field(), Some("circuit_breakers.processing.cooldown_seconds"));
    }

    #[test]
    fn test_breaker_settings_conversion() {
        let settings = BreakerSettings {
            failure_threshold: 3,
            cooldown_seconds: 10,
        };
        let config = settings.to_breaker_config();
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.cooldown, Duration::from_secs(10));
    }

    #[test]
    fn test_lock_ttl_must_cover_handler_timeout() {
        let mut config = NomadConfig::default();
        config.dispatcher.handler_timeout_seconds = 600;
        config.locking.ttl_seconds = 300;
        let err = config.validate().unwrap_err();
        assert_eq!(err.field(), Some("locking.ttl_seconds"));

        config.locking.ttl_seconds = 600;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_section_validators_match_root() {
        let dispatcher = DispatcherConfig {
            queue_capacity: 0,
            ..DispatcherConfig::default()
        };
        assert_eq!(
            dispatcher.validate().unwrap_err().field(),
            Some("dispatcher.queue_capacity")
        );

        let transitions = TransitionConfig {
            history_limit: 0,
            ..TransitionConfig::default()
        };
        assert_eq!(
            transitions.validate().unwrap_err().field(),
            Some("transitions.history_limit")
        );
    }

    #[test]
    fn test_adaptive_bounds_are_validated() {
        let mut config = NomadConfig::default();
        config.scheduler.adaptive.max_interval_seconds = 10;
        config.scheduler.adaptive.min_interval_seconds = 30;
        let err = config.validate().unwrap_err();
        assert_eq!(err.field(), Some("scheduler.adaptive.max_interval_seconds"));

        config.scheduler.adaptive = AdaptivePollingConfig {
            queue_threshold: 0,
            ..AdaptivePollingConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.field(), Some("scheduler.adaptive.queue_threshold"));
    }

    #[test]
    fn test_windows_are_validated() {
        let mut config = NomadConfig::default();
        config.scheduler.windows = vec![PollingWindow::new(18, 9, [Weekday::Mon])];
        let err = config.validate().unwrap_err();
        assert_eq!(err.field(), Some("scheduler.windows[0].start_hour"));

        config.scheduler.windows = vec![PollingWindow::new(9, 17, Vec::<Weekday>::new())];
        let err = config.validate().unwrap_err();
        assert_eq!(err.field(), Some("scheduler.windows[0].days"));

        config.scheduler.strategy = PollingStrategyKind::ScheduledWindows;
        config.scheduler.windows.clear();
        let err = config.validate().unwrap_err();
        assert_eq!(err.field(), Some("scheduler.windows"));
    }

    #[test]
    fn test_windows_deserialize_from_day_names() {
        let window: PollingWindow = serde_json::from_str(
            r#"{"start_hour": 9, "end_hour": 17, "days": ["Mon", "Fri"]}"#,
        )
        .unwrap();
        assert!(window.contains(Weekday::Fri, 16));
        assert!(!window.contains(Weekday::Fri, 17));
        assert!(!window.contains(Weekday::Tue, 10));
    }

    #[test]
    fn test_strategy_serde_names() {
        let json = serde_json::to_string(&PollingStrategyKind::ExponentialBackoff).unwrap();
        assert_eq!(json, "\"exponential_backoff\"");
        let kind: PollingStrategyKind = serde_json::from_str("\"scheduled_windows\"").unwrap();
        assert_eq!(kind, PollingStrategyKind::ScheduledWindows);
    }
}
