//! Configuration Error Types
//!
//! Specific, actionable errors for configuration loading and validation.
//! Invalid values are reported, never silently clamped.

use thiserror::Error;

/// Configuration-related errors with detailed context
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// Configuration file could not be read or parsed
    #[error("Failed to load configuration from '{source_name}': {error}")]
    LoadFailed { source_name: String, error: String },

    /// Missing required configuration field
    #[error("Missing required configuration field '{field}' in {context}")]
    MissingRequiredField { field: String, context: String },

    /// Invalid configuration value
    #[error("Invalid value '{value}' for field '{field}': {context}")]
    InvalidValue {
        field: String,
        value: String,
        context: String,
    },

    /// Environment variable override could not be applied
    #[error("Environment override error for key {key}: {reason}")]
    EnvironmentOverrideError { key: String, reason: String },
}

impl ConfigurationError {
    pub fn load_failed<S: Into<String>, E: std::fmt::Display>(source_name: S, error: E) -> Self {
        Self::LoadFailed {
            source_name: source_name.into(),
            error: error.to_string(),
        }
    }

    pub fn missing_required_field<F: Into<String>, C: Into<String>>(field: F, context: C) -> Self {
        Self::MissingRequiredField {
            field: field.into(),
            context: context.into(),
        }
    }

    pub fn invalid_value<F, V, C>(field: F, value: V, context: C) -> Self
    where
        F: Into<String>,
        V: std::fmt::Display,
        C: Into<String>,
    {
        Self::InvalidValue {
            field: field.into(),
            value: value.to_string(),
            context: context.into(),
        }
    }

    /// Name of the offending field, when the error is tied to one
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::MissingRequiredField { field, .. } | Self::InvalidValue { field, .. } => {
                Some(field)
            }
            Self::EnvironmentOverrideError { key, .. } => Some(key),
            Self::LoadFailed { .. } => None,
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigurationError>;
