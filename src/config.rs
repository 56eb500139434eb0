//! Layered runtime configuration.
//!
//! Layered the conventional way for this stack: defaults, then an
//! optional TOML file, then `SENTRYFLOW__`-prefixed environment variables,
//! via the `config` crate. `.env` is loaded once at process start with
//! `dotenv` so local development doesn't need exported shell variables.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Object-storage externalization and bucket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    /// Payloads serializing larger than this many bytes are externalized.
    pub externalize_threshold_bytes: usize,
    pub bucket: String,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            externalize_threshold_bytes: 256 * 1024,
            bucket: "sentryflow-objects".to_string(),
        }
    }
}

/// Worker pool sizing and recycling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// `None` means derive from CPU affinity at startup.
    pub size: Option<usize>,
    pub max_concurrent_per_worker: usize,
    pub max_tasks_per_worker: u64,
    pub acquire_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: None,
            max_concurrent_per_worker: 4,
            max_tasks_per_worker: 500,
            acquire_timeout_secs: 30,
        }
    }
}

/// Action-runner sandbox settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub tarball_cache_dir: String,
    pub default_timeout_secs: u64,
    pub max_do_while_iterations: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tarball_cache_dir: "/tmp/sentryflow/tarballs".to_string(),
            default_timeout_secs: 300,
            max_do_while_iterations: 100,
        }
    }
}

/// Scheduler-level limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub max_pending_tasks: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_pending_tasks: 64,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Loads configuration from (in increasing precedence) built-in
    /// defaults, `./sentryflow.toml` if present, and `SENTRYFLOW__`-prefixed
    /// environment variables (double underscore separates nesting, e.g.
    /// `SENTRYFLOW__POOL__SIZE=8`).
    pub fn load() -> Result<Self> {
        let _ = dotenv::dotenv();

        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default()).map_err(|e| {
                CoreError::Config(format!("failed to serialize config defaults: {e}"))
            })?)
            .add_source(config::File::with_name("sentryflow").required(false))
            .add_source(
                config::Environment::with_prefix("SENTRYFLOW")
                    .separator("__")
                    .try_parsing(true),
            );

        builder
            .build()
            .map_err(|e| CoreError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| CoreError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert!(cfg.object_store.externalize_threshold_bytes > 0);
        assert!(cfg.pool.max_concurrent_per_worker > 0);
        assert_eq!(cfg.runner.max_do_while_iterations, 100);
    }
}
