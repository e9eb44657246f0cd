//! # Job Manager Configuration
//!
//! Tunables for the orchestration core. Values are loaded in three layers:
//! compiled defaults, an optional TOML file, and `BORGITORY_`-prefixed
//! environment variables, later layers winning.
//!
//! ## Example
//!
//! ```toml
//! max_concurrent_backups = 5
//! max_concurrent_operations = 10
//! max_output_lines_per_job = 1000
//! queue_poll_interval_ms = 100
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::errors::{BorgitoryError, BorgitoryResult};

/// Configuration for the job manager and its subsystems
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct JobManagerConfig {
    /// Capacity of the backup pool
    #[validate(range(min = 1))]
    pub max_concurrent_backups: usize,
    /// Capacity of the generic operation pool
    #[validate(range(min = 1))]
    pub max_concurrent_operations: usize,
    /// Ring size for per-job output buffers
    #[validate(range(min = 1))]
    pub max_output_lines_per_job: usize,
    /// Pool wake interval when no admit/complete signal arrives
    pub queue_poll_interval_ms: u64,
    /// Bound of each subscriber's event queue
    #[validate(range(min = 1))]
    pub sse_max_queue_size: usize,
    /// Idle period after which a keep-alive event is emitted
    pub sse_keepalive_timeout_secs: u64,
    /// Parallel cloud-sync executions across all jobs
    #[validate(range(min = 1))]
    pub max_concurrent_cloud_uploads: usize,
    /// Absolute backlog cap across both admission queues
    #[validate(range(min = 1))]
    pub max_queued_jobs: usize,
    /// Grace between soft-terminate and kill during cancellation
    pub termination_grace_secs: u64,
    /// Events kept for replay to new subscribers
    pub event_replay_size: usize,
    /// Scheduler tick interval
    pub scheduler_tick_secs: u64,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_backups: 5,
            max_concurrent_operations: 10,
            max_output_lines_per_job: 1000,
            queue_poll_interval_ms: 100,
            sse_max_queue_size: 100,
            sse_keepalive_timeout_secs: 30,
            max_concurrent_cloud_uploads: 3,
            max_queued_jobs: 256,
            termination_grace_secs: 5,
            event_replay_size: 20,
            scheduler_tick_secs: 30,
        }
    }
}

impl JobManagerConfig {
    /// Load configuration from an optional TOML file plus `BORGITORY_`
    /// environment overrides (e.g. `BORGITORY_MAX_CONCURRENT_BACKUPS=2`).
    pub fn load(path: Option<&Path>) -> BorgitoryResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(false));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("BORGITORY"))
            .build()
            .map_err(|e| BorgitoryError::Configuration(e.to_string()))?;

        let loaded: Self = settings
            .try_deserialize()
            .map_err(|e| BorgitoryError::Configuration(e.to_string()))?;
        loaded
            .validate()
            .map_err(|e| BorgitoryError::Configuration(e.to_string()))?;
        Ok(loaded)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    pub fn sse_keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.sse_keepalive_timeout_secs)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_secs(self.termination_grace_secs)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs)
    }
}
