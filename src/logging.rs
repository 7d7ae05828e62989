//! # Structured Logging Module
//!
//! Environment-aware console logging using the tracing ecosystem. Output
//! goes to stdout, either human-readable or JSON depending on configuration.

use chrono::Utc;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LogFormat, LoggingConfig};
use crate::models::TransitionResult;
use crate::state_machine::TaskStatus;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging. Safe to call more than once; only the
/// first call installs a subscriber.
pub fn init_structured_logging(config: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = build_filter(config, &environment);

        let console = match config.format {
            LogFormat::Pretty => fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true)
                .boxed(),
            LogFormat::Json => fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(false)
                .json()
                .boxed(),
        };

        // A subscriber may already be installed by an embedding application
        if tracing_subscriber::registry()
            .with(console.with_filter(filter))
            .try_init()
            .is_err()
        {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            format = ?config.format,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// `RUST_LOG` wins, then the configured level, then the environment default
fn build_filter(config: &LoggingConfig, environment: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = config
        .level
        .clone()
        .unwrap_or_else(|| get_log_level(environment).to_string());
    EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new(get_log_level(environment)))
}

fn get_environment() -> String {
    std::env::var("NOMAD_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

/// Log structured data for task processing milestones
pub fn log_task_operation(
    operation: &str,
    task_id: &str,
    status: Option<TaskStatus>,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        task_id = %task_id,
        status = status.map(|s| s.as_str()),
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📋 TASK_OPERATION"
    );
}

/// Log a finalized status transition
pub fn log_transition(
    task_id: &str,
    from: TaskStatus,
    to: TaskStatus,
    result: TransitionResult,
    error: Option<&str>,
) {
    match result {
        TransitionResult::Success => tracing::info!(
            task_id = %task_id,
            from = %from,
            to = %to,
            result = %result,
            "🔄 TRANSITION"
        ),
        TransitionResult::Failed | TransitionResult::RolledBack => tracing::warn!(
            task_id = %task_id,
            from = %from,
            to = %to,
            result = %result,
            error = error,
            "🔄 TRANSITION"
        ),
    }
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}
