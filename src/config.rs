//! Task runtime configuration.
//!
//! Configuration can be loaded from:
//! 1. TOML file (`tasks.toml`)
//! 2. Environment variables (with `TASKS_` prefix)
//!
//! Environment variables override TOML configuration.
//!
//! # Example TOML Configuration
//!
//! ```toml
//! [tasks.storage]
//! backend = "redis"
//! redis_url = "redis://127.0.0.1:6379"
//! key_prefix = "my-app"
//!
//! [tasks.queue]
//! backend = "redis"
//! redis_url = "redis://127.0.0.1:6379"
//! queue_name = "my-app:queue"
//!
//! [tasks.worker]
//! concurrency = 8
//! idle_backoff_ms = 250
//!
//! [tasks.sweep]
//! requeue_after_secs = 60
//! processing_timeout_secs = 900
//! interval_secs = 30
//!
//! [tasks.retry]
//! max_attempts = 5
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{DEFAULT_KEY_PREFIX, DEFAULT_QUEUE_NAME};
use crate::retry::RetryPolicy;

const CONFIG_FILE: &str = "tasks.toml";
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Main task runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TasksConfig {
    /// Where task records and idempotency keys live.
    pub storage: StorageConfig,

    /// The broker carrying delivery notices.
    pub queue: QueueConfig,

    /// Worker pool settings.
    pub worker: WorkerConfig,

    /// Reconciliation sweep thresholds.
    pub sweep: SweepConfig,

    /// Retry policy for transient storage failures.
    pub retry: RetryPolicy,
}

/// Storage backend configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend selection: "memory" or "redis".
    pub backend: String,

    /// Redis connection URL, used when `backend = "redis"`.
    pub redis_url: String,

    /// Prefix for every Redis key.
    pub key_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            redis_url: DEFAULT_REDIS_URL.to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

/// Work queue configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Backend selection: "memory" or "redis".
    pub backend: String,

    /// Redis connection URL, used when `backend = "redis"`.
    pub redis_url: String,

    /// Name of the Redis list.
    pub queue_name: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            redis_url: DEFAULT_REDIS_URL.to_string(),
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of workers spawned by the runtime.
    pub concurrency: usize,

    /// How long an idle worker waits on the queue per poll.
    pub idle_backoff_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            idle_backoff_ms: 500,
        }
    }
}

impl WorkerConfig {
    /// Idle wait as a [`Duration`].
    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }
}

/// Reconciliation sweep configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// `PENDING` tasks older than this are re-published.
    pub requeue_after_secs: u64,

    /// `PROCESSING` tasks claimed longer ago than this are recovered.
    pub processing_timeout_secs: u64,

    /// How often the runtime's background sweeper runs.
    pub interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            requeue_after_secs: 60,
            processing_timeout_secs: 15 * 60,
            interval_secs: 30,
        }
    }
}

impl SweepConfig {
    /// Requeue threshold as a [`Duration`].
    pub fn requeue_after(&self) -> Duration {
        Duration::from_secs(self.requeue_after_secs)
    }

    /// Processing timeout as a [`Duration`].
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }

    /// Sweeper period as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl TasksConfig {
    /// Load configuration from file and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. `tasks.toml` in the working directory
    /// 3. Default values
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = if let Ok(contents) = std::fs::read_to_string(CONFIG_FILE) {
            Self::from_toml(&contents)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            error: e.to_string(),
        })?;
        let mut config = Self::from_toml(&contents)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML content with a `[tasks]` table.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        #[derive(Deserialize)]
        struct FullConfig {
            #[serde(default)]
            tasks: TasksConfig,
        }

        let full: FullConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        Ok(full.tasks)
    }

    /// Apply `TASKS_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    fn apply_overrides_from(&mut self, var: impl Fn(&str) -> Option<String>) {
        // One URL for both brokers
        if let Some(url) = var("TASKS_REDIS_URL") {
            self.storage.redis_url.clone_from(&url);
            self.queue.redis_url = url;
        }

        if let Some(backend) = var("TASKS_STORAGE_BACKEND") {
            self.storage.backend = backend;
        }
        if let Some(prefix) = var("TASKS_KEY_PREFIX") {
            self.storage.key_prefix = prefix;
        }
        if let Some(backend) = var("TASKS_QUEUE_BACKEND") {
            self.queue.backend = backend;
        }
        if let Some(name) = var("TASKS_QUEUE_NAME") {
            self.queue.queue_name = name;
        }

        if let Some(v) = var("TASKS_WORKER_CONCURRENCY") {
            if let Ok(n) = v.parse() {
                self.worker.concurrency = n;
            }
        }
        if let Some(v) = var("TASKS_WORKER_IDLE_BACKOFF_MS") {
            if let Ok(ms) = v.parse() {
                self.worker.idle_backoff_ms = ms;
            }
        }

        if let Some(v) = var("TASKS_REQUEUE_AFTER_SECS") {
            if let Ok(secs) = v.parse() {
                self.sweep.requeue_after_secs = secs;
            }
        }
        if let Some(v) = var("TASKS_PROCESSING_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                self.sweep.processing_timeout_secs = secs;
            }
        }

        if let Some(v) = var("TASKS_RETRY_MAX_ATTEMPTS") {
            if let Ok(n) = v.parse() {
                self.retry.max_attempts = n;
            }
        }
    }

    /// Rejects settings the runtime cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (section, backend) in [("storage", &self.storage.backend), ("queue", &self.queue.backend)] {
            if backend != "memory" && backend != "redis" {
                return Err(ConfigError::Invalid(format!(
                    "unknown {section} backend '{backend}' (expected \"memory\" or \"redis\")"
                )));
            }
        }
        if self.worker.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "worker.concurrency must be at least 1".to_string(),
            ));
        }
        if self.sweep.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sweep.interval_secs must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading configuration file.
    #[error("failed to read config file '{path}': {error}")]
    Io {
        /// Path to the configuration file.
        path: String,
        /// Error message.
        error: String,
    },

    /// Parse error in configuration.
    #[error("failed to parse config: {0}")]
    Parse(String),

    /// A value is out of range or names an unknown backend.
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_in_memory() {
        let config = TasksConfig::default();
        assert_eq!(config.storage.backend, "memory");
        assert_eq!(config.queue.backend, "memory");
        assert_eq!(config.queue.queue_name, DEFAULT_QUEUE_NAME);
        assert_eq!(config.worker.concurrency, 4);
        assert_eq!(config.sweep.processing_timeout(), Duration::from_secs(900));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_partial_toml() {
        let config = TasksConfig::from_toml(
            r#"
            [tasks.storage]
            backend = "redis"
            key_prefix = "svc"

            [tasks.worker]
            concurrency = 16

            [tasks.retry]
            max_attempts = 7
            "#,
        )
        .unwrap();

        assert_eq!(config.storage.backend, "redis");
        assert_eq!(config.storage.key_prefix, "svc");
        assert_eq!(config.storage.redis_url, DEFAULT_REDIS_URL);
        assert_eq!(config.worker.concurrency, 16);
        assert_eq!(config.worker.idle_backoff_ms, 500);
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.retry.initial_backoff_ms, 50);
        assert_eq!(config.queue, QueueConfig::default());
    }

    #[test]
    fn empty_toml_is_default() {
        assert_eq!(TasksConfig::from_toml("").unwrap(), TasksConfig::default());
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = TasksConfig::from_toml("[tasks.worker]\nconcurrency = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = TasksConfig::from_file("/nonexistent/tasks.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/tasks.toml"));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("TASKS_REDIS_URL", "redis://cache:6380"),
            ("TASKS_QUEUE_BACKEND", "redis"),
            ("TASKS_WORKER_CONCURRENCY", "2"),
            ("TASKS_PROCESSING_TIMEOUT_SECS", "30"),
            ("TASKS_RETRY_MAX_ATTEMPTS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = TasksConfig::default();
        config.apply_overrides_from(|name| vars.get(name).map(|v| (*v).to_string()));

        assert_eq!(config.storage.redis_url, "redis://cache:6380");
        assert_eq!(config.queue.redis_url, "redis://cache:6380");
        assert_eq!(config.queue.backend, "redis");
        assert_eq!(config.storage.backend, "memory");
        assert_eq!(config.worker.concurrency, 2);
        assert_eq!(config.sweep.processing_timeout_secs, 30);
        // Unparseable values are ignored.
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn validate_rejects_unknown_backend() {
        let mut config = TasksConfig::default();
        config.queue.backend = "kafka".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("kafka"));
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let mut config = TasksConfig::default();
        config.worker.concurrency = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
