//! Fleet configuration.
//!
//! Values are layered, lowest priority first: built-in defaults, an optional
//! YAML file, then environment variables. Every process (dispatcher, worker,
//! scaler, CLI) reads the same structure and uses the sections it needs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runner::HarnessCommand;
use crate::scheduler::job::Harness;
use crate::scheduler::worker_pool::WorkerPoolConfig;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The YAML file could not be parsed.
    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Work queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Redis connection URL.
    pub redis_url: String,
    /// Queue name; Redis keys are derived from it.
    pub name: String,
    /// Seconds a fetched message stays invisible.
    pub visibility_timeout_secs: u64,
    /// Milliseconds between polls while a fetch waits.
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            name: "trialforge:trials".to_string(),
            visibility_timeout_secs: 2 * 60 * 60,
            poll_interval_ms: 500,
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Job and trial store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Connection pool size.
    pub max_connections: u32,
    /// Root of the shared artifact store.
    pub artifact_root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/trialforge".to_string(),
            max_connections: 10,
            artifact_root: PathBuf::from("./jobs"),
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker identifier; generated when unset.
    pub worker_id: Option<String>,
    /// Concurrent trials per worker.
    pub capacity: usize,
    /// Attempts allowed per trial.
    pub max_attempts: u32,
    /// Seconds one fetch waits for a message.
    pub fetch_wait_secs: u64,
    /// Consecutive queue errors before the worker turns unhealthy.
    pub queue_error_budget: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            capacity: 60,
            max_attempts: 3,
            fetch_wait_secs: 5,
            queue_error_budget: 10,
        }
    }
}

/// Drain settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainConfig {
    /// Seconds a drain waits for in-flight trials.
    pub deadline_secs: u64,
    /// Seconds between termination-notice polls.
    pub poll_interval_secs: u64,
    /// Instance metadata endpoint answering 200 when termination is scheduled.
    pub metadata_url: Option<String>,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            deadline_secs: 40 * 60,
            poll_interval_secs: 5,
            metadata_url: None,
        }
    }
}

impl DrainConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Capacity controller settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalerConfig {
    /// Seconds between samples.
    pub interval_secs: u64,
    /// Desired queued trials per worker.
    pub target_per_worker: usize,
    /// Fleet floor.
    pub min_workers: u32,
    /// Fleet ceiling.
    pub max_workers: u32,
    /// Consecutive scale-out samples before acting.
    pub scale_out_samples: u32,
    /// Consecutive scale-in samples before acting.
    pub scale_in_samples: u32,
    /// Fleet control plane base URL.
    pub control_plane_url: Option<String>,
    /// Bearer token for the control plane.
    pub control_plane_token: Option<String>,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            target_per_worker: 60,
            min_workers: 0,
            max_workers: 20,
            scale_out_samples: 1,
            scale_in_samples: 3,
            control_plane_url: None,
            control_plane_token: None,
        }
    }
}

impl ScalerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Sandbox runner settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Harness command template.
    pub command: HarnessCommand,
    /// Base limit for Harbor trials, in seconds.
    pub harbor_timeout_secs: u64,
    /// Base limit for Terminus trials, in seconds.
    pub terminus_timeout_secs: u64,
    /// Multiplier applied to the base limits.
    pub timeout_multiplier: f64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: HarnessCommand::default(),
            harbor_timeout_secs: 60 * 60,
            terminus_timeout_secs: 60 * 60,
            timeout_multiplier: 1.0,
        }
    }
}

impl RunnerConfig {
    /// Hard execution limit for a harness.
    pub fn trial_timeout(&self, harness: Harness) -> Duration {
        let base = match harness {
            Harness::Harbor => self.harbor_timeout_secs,
            Harness::Terminus => self.terminus_timeout_secs,
        };
        Duration::from_secs(base).mul_f64(self.timeout_multiplier.max(0.0))
    }

    /// Longest hard execution limit across harnesses.
    pub fn max_trial_timeout(&self) -> Duration {
        self.trial_timeout(Harness::Harbor)
            .max(self.trial_timeout(Harness::Terminus))
    }
}

/// Dispatcher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Seconds between reconciliation passes.
    pub reconcile_interval_secs: u64,
    /// Seconds a job is left alone before reconciliation touches it.
    pub grace_period_secs: u64,
    /// Failed-trial fraction above which a job is marked Failed.
    pub max_failed_fraction: Option<f64>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 60,
            grace_period_secs: 120,
            max_failed_fraction: None,
        }
    }
}

impl DispatchConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Configuration shared by every trialforge process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub queue: QueueConfig,
    pub store: StoreConfig,
    pub worker: WorkerConfig,
    pub drain: DrainConfig,
    pub scaler: ScalerConfig,
    pub runner: RunnerConfig,
    pub dispatch: DispatchConfig,
}

impl FleetConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads defaults, then `path` if given, then the environment, and validates.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a YAML file. Missing sections and fields keep their defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parses YAML text.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Overrides values from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REDIS_URL`, `TRIALFORGE_QUEUE_NAME`, `TRIALFORGE_VISIBILITY_TIMEOUT_SECS`
    /// - `DATABASE_URL`, `TRIALFORGE_DB_MAX_CONNECTIONS`, `TRIALFORGE_ARTIFACT_ROOT`
    /// - `TRIALFORGE_WORKER_ID`, `TRIALFORGE_CAPACITY`, `TRIALFORGE_MAX_ATTEMPTS`
    /// - `TRIALFORGE_DRAIN_DEADLINE_SECS`, `TRIALFORGE_METADATA_URL`
    /// - `TRIALFORGE_MIN_WORKERS`, `TRIALFORGE_MAX_WORKERS`, `TRIALFORGE_TARGET_PER_WORKER`
    /// - `TRIALFORGE_CONTROL_PLANE_URL`, `TRIALFORGE_CONTROL_PLANE_TOKEN`
    /// - `TRIALFORGE_HARNESS_PROGRAM`, `TRIALFORGE_TIMEOUT_MULTIPLIER`
    /// - `TRIALFORGE_MAX_FAILED_FRACTION`
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        // Queue
        if let Some(val) = var("REDIS_URL") {
            self.queue.redis_url = val;
        }
        if let Some(val) = var("TRIALFORGE_QUEUE_NAME") {
            self.queue.name = val;
        }
        if let Some(val) = var("TRIALFORGE_VISIBILITY_TIMEOUT_SECS") {
            self.queue.visibility_timeout_secs =
                parse_env_value(&val, "TRIALFORGE_VISIBILITY_TIMEOUT_SECS")?;
        }

        // Store
        if let Some(val) = var("DATABASE_URL") {
            self.store.database_url = val;
        }
        if let Some(val) = var("TRIALFORGE_DB_MAX_CONNECTIONS") {
            self.store.max_connections = parse_env_value(&val, "TRIALFORGE_DB_MAX_CONNECTIONS")?;
        }
        if let Some(val) = var("TRIALFORGE_ARTIFACT_ROOT") {
            self.store.artifact_root = PathBuf::from(val);
        }

        // Worker
        if let Some(val) = var("TRIALFORGE_WORKER_ID") {
            self.worker.worker_id = Some(val);
        }
        if let Some(val) = var("TRIALFORGE_CAPACITY") {
            self.worker.capacity = parse_env_value(&val, "TRIALFORGE_CAPACITY")?;
        }
        if let Some(val) = var("TRIALFORGE_MAX_ATTEMPTS") {
            self.worker.max_attempts = parse_env_value(&val, "TRIALFORGE_MAX_ATTEMPTS")?;
        }

        // Drain
        if let Some(val) = var("TRIALFORGE_DRAIN_DEADLINE_SECS") {
            self.drain.deadline_secs = parse_env_value(&val, "TRIALFORGE_DRAIN_DEADLINE_SECS")?;
        }
        if let Some(val) = var("TRIALFORGE_METADATA_URL") {
            self.drain.metadata_url = Some(val);
        }

        // Scaler
        if let Some(val) = var("TRIALFORGE_MIN_WORKERS") {
            self.scaler.min_workers = parse_env_value(&val, "TRIALFORGE_MIN_WORKERS")?;
        }
        if let Some(val) = var("TRIALFORGE_MAX_WORKERS") {
            self.scaler.max_workers = parse_env_value(&val, "TRIALFORGE_MAX_WORKERS")?;
        }
        if let Some(val) = var("TRIALFORGE_TARGET_PER_WORKER") {
            self.scaler.target_per_worker = parse_env_value(&val, "TRIALFORGE_TARGET_PER_WORKER")?;
        }
        if let Some(val) = var("TRIALFORGE_CONTROL_PLANE_URL") {
            self.scaler.control_plane_url = Some(val);
        }
        if let Some(val) = var("TRIALFORGE_CONTROL_PLANE_TOKEN") {
            self.scaler.control_plane_token = Some(val);
        }

        // Runner
        if let Some(val) = var("TRIALFORGE_HARNESS_PROGRAM") {
            self.runner.command.program = val;
        }
        if let Some(val) = var("TRIALFORGE_TIMEOUT_MULTIPLIER") {
            self.runner.timeout_multiplier = parse_env_value(&val, "TRIALFORGE_TIMEOUT_MULTIPLIER")?;
        }

        // Dispatch
        if let Some(val) = var("TRIALFORGE_MAX_FAILED_FRACTION") {
            self.dispatch.max_failed_fraction =
                Some(parse_env_value(&val, "TRIALFORGE_MAX_FAILED_FRACTION")?);
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "worker.capacity must be greater than 0".to_string(),
            ));
        }

        if self.worker.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "worker.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.scaler.min_workers > self.scaler.max_workers {
            return Err(ConfigError::ValidationFailed(
                "scaler.min_workers cannot exceed scaler.max_workers".to_string(),
            ));
        }

        if self.scaler.target_per_worker == 0 {
            return Err(ConfigError::ValidationFailed(
                "scaler.target_per_worker must be greater than 0".to_string(),
            ));
        }

        if self.runner.timeout_multiplier <= 0.0 {
            return Err(ConfigError::ValidationFailed(
                "runner.timeout_multiplier must be greater than 0".to_string(),
            ));
        }

        let max_trial = self.runner.max_trial_timeout();
        if self.queue.visibility_timeout() <= max_trial {
            return Err(ConfigError::ValidationFailed(format!(
                "queue.visibility_timeout_secs ({}) must exceed the longest trial timeout ({}s)",
                self.queue.visibility_timeout_secs,
                max_trial.as_secs()
            )));
        }

        if let Some(fraction) = self.dispatch.max_failed_fraction {
            if !(0.0..=1.0).contains(&fraction) {
                return Err(ConfigError::ValidationFailed(
                    "dispatch.max_failed_fraction must be between 0.0 and 1.0".to_string(),
                ));
            }
        }

        if self.queue.name.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue.name cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Worker pool settings derived from the worker and runner sections.
    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        let mut pool = match self.worker.worker_id {
            Some(ref id) => WorkerPoolConfig::new(id.clone()),
            None => WorkerPoolConfig::default(),
        };
        pool.capacity = self.worker.capacity;
        pool.max_attempts = self.worker.max_attempts;
        pool.fetch_wait = Duration::from_secs(self.worker.fetch_wait_secs);
        pool.queue_error_budget = self.worker.queue_error_budget;
        pool.harbor_timeout = Duration::from_secs(self.runner.harbor_timeout_secs);
        pool.terminus_timeout = Duration::from_secs(self.runner.terminus_timeout_secs);
        pool.timeout_multiplier = self.runner.timeout_multiplier;
        pool
    }

    /// Harness command with the configured timeout multiplier.
    pub fn harness_command(&self) -> HarnessCommand {
        self.runner
            .command
            .clone()
            .with_timeout_multiplier(self.runner.timeout_multiplier)
    }
}

/// Parse an environment variable value.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
