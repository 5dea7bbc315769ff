//! Orchestrator configuration.
//!
//! `DirectorConfig` is loaded from a TOML document (or built in code for
//! tests). Every field has a default, so an empty document is a valid
//! configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Tunables for the Director and its background tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectorConfig {
    /// Maximum executions in the Running state at once.
    #[serde(default = "default_max_concurrent_workflows")]
    pub max_concurrent_workflows: usize,

    /// Bounded wait on the admission queue pop, in milliseconds. Keeps the
    /// dispatch loop responsive to the shutdown flag.
    #[serde(default = "default_dispatch_poll_interval_ms")]
    pub dispatch_poll_interval_ms: u64,

    /// Back-off after an unexpected dispatch-loop error, in seconds.
    #[serde(default = "default_dispatch_backoff_secs")]
    pub dispatch_backoff_secs: u64,

    /// Interval between checkpoint sweeps over running executions.
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,

    /// Maximum sessions the pool will track.
    #[serde(default = "default_session_pool_size")]
    pub session_pool_size: usize,

    /// How long an acquire may wait for a session before failing.
    #[serde(default = "default_session_acquire_timeout_secs")]
    pub session_acquire_timeout_secs: u64,

    /// Interval between health probes over all tracked sessions.
    #[serde(default = "default_health_sweep_interval_secs")]
    pub health_sweep_interval_secs: u64,

    /// Interval between sweeps closing expired/unhealthy/idle sessions.
    #[serde(default = "default_cleanup_sweep_interval_secs")]
    pub cleanup_sweep_interval_secs: u64,

    /// Session age past which it is considered expired, in seconds.
    #[serde(default = "default_session_max_age_secs")]
    pub session_max_age_secs: u64,

    /// Idle time past which an Idle session is closed, in seconds.
    #[serde(default = "default_session_idle_timeout_secs")]
    pub session_idle_timeout_secs: u64,

    /// Terminal executions retained in the history buffer.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

fn default_max_concurrent_workflows() -> usize {
    5
}

fn default_dispatch_poll_interval_ms() -> u64 {
    1000
}

fn default_dispatch_backoff_secs() -> u64 {
    5
}

fn default_checkpoint_interval_secs() -> u64 {
    60
}

fn default_session_pool_size() -> usize {
    5
}

fn default_session_acquire_timeout_secs() -> u64 {
    30
}

fn default_health_sweep_interval_secs() -> u64 {
    60
}

fn default_cleanup_sweep_interval_secs() -> u64 {
    300
}

fn default_session_max_age_secs() -> u64 {
    1800
}

fn default_session_idle_timeout_secs() -> u64 {
    1800
}

fn default_history_capacity() -> usize {
    100
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: default_max_concurrent_workflows(),
            dispatch_poll_interval_ms: default_dispatch_poll_interval_ms(),
            dispatch_backoff_secs: default_dispatch_backoff_secs(),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            session_pool_size: default_session_pool_size(),
            session_acquire_timeout_secs: default_session_acquire_timeout_secs(),
            health_sweep_interval_secs: default_health_sweep_interval_secs(),
            cleanup_sweep_interval_secs: default_cleanup_sweep_interval_secs(),
            session_max_age_secs: default_session_max_age_secs(),
            session_idle_timeout_secs: default_session_idle_timeout_secs(),
            history_capacity: default_history_capacity(),
        }
    }
}

impl DirectorConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Load from a TOML file on disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_yields_defaults() {
        let config = DirectorConfig::from_toml_str("").unwrap();
        assert_eq!(config.max_concurrent_workflows, 5);
        assert_eq!(config.checkpoint_interval_secs, 60);
        assert_eq!(config.session_pool_size, 5);
        assert_eq!(config.session_acquire_timeout_secs, 30);
        assert_eq!(config.history_capacity, 100);
    }

    #[test]
    fn partial_document_overrides_only_named_fields() {
        let config = DirectorConfig::from_toml_str(
            "max_concurrent_workflows = 2\nsession_pool_size = 8\n",
        )
        .unwrap();
        assert_eq!(config.max_concurrent_workflows, 2);
        assert_eq!(config.session_pool_size, 8);
        assert_eq!(config.cleanup_sweep_interval_secs, 300);
    }

    #[test]
    fn load_reads_a_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "history_capacity = 10").unwrap();
        let config = DirectorConfig::load(file.path()).unwrap();
        assert_eq!(config.history_capacity, 10);
    }

    #[test]
    fn parse_error_is_reported() {
        let err = DirectorConfig::from_toml_str("max_concurrent_workflows = \"many\"");
        assert!(err.is_err());
    }
}
