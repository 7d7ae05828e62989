//! # Error Types
//!
//! Crate-wide error enum. Component-specific errors (configuration, store,
//! state machine) convert into [`NomadError`] so that public entry points
//! can return a single `Result` type.

use thiserror::Error;

use crate::config::ConfigurationError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum NomadError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Dispatcher is not accepting submissions")]
    DispatcherClosed,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl NomadError {
    /// Whether this error indicates corrupted internal state rather than a
    /// business failure of a callback or collaborator.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

pub type Result<T> = std::result::Result<T, NomadError>;
