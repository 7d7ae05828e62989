//! Configuration Loader
//!
//! Layers an optional configuration file (TOML, YAML or JSON, detected from
//! the extension) under `NOMAD_`-prefixed environment overrides, then
//! validates the merged result.

use config::{Config, Environment, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::error::{ConfigResult, ConfigurationError};
use super::NomadConfig;

/// Prefix for environment overrides, e.g. `NOMAD_DISPATCHER__WORKER_COUNT=4`
pub const ENV_PREFIX: &str = "NOMAD";
const ENV_SEPARATOR: &str = "__";

/// Owns a validated configuration tree
#[derive(Debug)]
pub struct ConfigManager {
    config: NomadConfig,
    source: Option<PathBuf>,
}

impl ConfigManager {
    /// Load from environment overrides only
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_with_sources(None)
    }

    /// Load from a file (missing files are an error) plus environment overrides
    pub fn load_from_file(path: impl AsRef<Path>) -> ConfigResult<Arc<ConfigManager>> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigurationError::load_failed(
                path.display().to_string(),
                "file does not exist",
            ));
        }
        Self::load_with_sources(Some(path.to_path_buf()))
    }

    /// Wrap an already-built configuration, validating it first
    pub fn from_config(config: NomadConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            source: None,
        }))
    }

    fn load_with_sources(path: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let mut builder = Config::builder();

        if let Some(path) = &path {
            debug!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(File::from(path.as_path()).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        let source_name = path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "environment".to_string());

        let merged = builder
            .build()
            .map_err(|e| ConfigurationError::load_failed(source_name.clone(), e))?;

        let config: NomadConfig = merged
            .try_deserialize()
            .map_err(|e| ConfigurationError::load_failed(source_name.clone(), e))?;

        config.validate()?;

        info!(
            source = %source_name,
            poll_interval_seconds = config.scheduler.poll_interval_seconds,
            worker_count = config.dispatcher.worker_count,
            lock_ttl_seconds = config.locking.ttl_seconds,
            "⚙️ Configuration loaded successfully"
        );

        Ok(Arc::new(Self {
            config,
            source: path,
        }))
    }

    pub fn config(&self) -> &NomadConfig {
        &self.config
    }

    /// File the configuration was read from, if any
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}
