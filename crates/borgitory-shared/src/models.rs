//! # Persisted Records
//!
//! Row types for the stable schema contract. Configuration tables
//! (repositories, schedules, policy stores) are owned by the configuration
//! subsystem and read-only to the core; `jobs` and `job_tasks` are written
//! by the database manager. Encrypted columns hold opaque blobs that only
//! the injected [`crate::secrets::Encryptor`] can open.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A registered backup repository
#[derive(Debug, Clone, FromRow)]
pub struct RepositoryRow {
    pub id: i64,
    pub name: String,
    pub path: String,
    /// Symmetrically encrypted passphrase blob
    pub enc_passphrase: Vec<u8>,
    /// Encrypted key material, when the repository uses a keyfile
    pub enc_keyfile: Option<Vec<u8>>,
}

/// A persisted schedule record consumed by the scheduler
#[derive(Debug, Clone, FromRow)]
pub struct ScheduleRow {
    pub id: i64,
    pub repository_id: i64,
    pub name: String,
    pub cron_expr: String,
    pub enabled: bool,
    /// Template task-list specification, deserialized by the builder
    pub spec_json: String,
}

/// Template task-list specification stored on a schedule
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub source_paths: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub compression: Option<String>,
    #[serde(default)]
    pub archive_name_template: Option<String>,
    #[serde(default)]
    pub prune_config_id: Option<i64>,
    #[serde(default)]
    pub check_config_id: Option<i64>,
    #[serde(default)]
    pub cloud_sync_config_id: Option<i64>,
    #[serde(default)]
    pub notification_config_id: Option<i64>,
    #[serde(default)]
    pub pre_hooks: Vec<HookDefinition>,
    #[serde(default)]
    pub post_hooks: Vec<HookDefinition>,
}

/// One hook entry inside a schedule spec
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookDefinition {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub continue_on_failure: bool,
}

/// A persisted job row
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    /// 32 hex chars, no separators; legacy dash-separated ids are
    /// normalized on read
    pub id: String,
    pub repository_id: Option<i64>,
    pub kind: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// A persisted task row
#[derive(Debug, Clone, FromRow)]
pub struct JobTaskRow {
    pub id: i64,
    pub job_id: String,
    pub task_order: i64,
    pub kind: String,
    pub name: String,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
    pub output: String,
    pub parameters_json: String,
}

/// Cloud-sync provider configuration record
#[derive(Debug, Clone, FromRow)]
pub struct CloudSyncConfigRow {
    pub id: i64,
    pub name: String,
    pub provider: String,
    /// Encrypted blob; sensitive fields are enumerated per provider
    pub provider_config_json: Vec<u8>,
    pub enabled: bool,
}

/// Notification provider configuration record
#[derive(Debug, Clone, FromRow)]
pub struct NotificationConfigRow {
    pub id: i64,
    pub name: String,
    pub provider: String,
    pub provider_config_json: Vec<u8>,
    pub enabled: bool,
}

/// Prune retention policy record
#[derive(Debug, Clone, FromRow)]
pub struct PruneConfigRow {
    pub id: i64,
    pub name: String,
    pub keep_within_days: Option<i64>,
    pub keep_daily: Option<i64>,
    pub keep_weekly: Option<i64>,
    pub keep_monthly: Option<i64>,
    pub keep_yearly: Option<i64>,
    pub show_list: bool,
    pub show_stats: bool,
    pub save_space: bool,
    pub enabled: bool,
}

/// Consistency-check policy record
#[derive(Debug, Clone, FromRow)]
pub struct CheckConfigRow {
    pub id: i64,
    pub name: String,
    pub check_type: String,
    pub verify_data: bool,
    pub repair_mode: bool,
    pub save_space: bool,
    pub max_duration: Option<i64>,
    pub archive_prefix: Option<String>,
    pub archive_glob: Option<String>,
    pub first_n_archives: Option<i64>,
    pub last_n_archives: Option<i64>,
    pub enabled: bool,
}
