//! # Task Model
//!
//! One unit of work inside a composite job. Every task kind carries its own
//! typed parameter record on the `TaskSpec` enum; dispatch over the enum is
//! exhaustive, so adding a kind forces every executor site to handle it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use super::output::OutputLine;

/// Task status. Transitions are monotonic:
/// pending -> running -> {completed, failed, skipped, stopped}; skipped and
/// stopped may also be entered straight from pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[display("pending")]
    Pending,
    #[display("running")]
    Running,
    #[display("completed")]
    Completed,
    #[display("failed")]
    Failed,
    #[display("skipped")]
    Skipped,
    #[display("stopped")]
    Stopped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::Stopped
        )
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "skipped" => Ok(TaskStatus::Skipped),
            "stopped" => Ok(TaskStatus::Stopped),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Task kind tag, stable across the database and the event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    #[display("backup")]
    Backup,
    #[display("prune")]
    Prune,
    #[display("check")]
    Check,
    #[display("cloud_sync")]
    CloudSync,
    #[display("notification")]
    Notification,
    #[display("hook")]
    Hook,
    #[display("command")]
    Command,
    #[display("info")]
    Info,
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backup" => Ok(TaskKind::Backup),
            "prune" => Ok(TaskKind::Prune),
            "check" => Ok(TaskKind::Check),
            "cloud_sync" => Ok(TaskKind::CloudSync),
            "notification" => Ok(TaskKind::Notification),
            "hook" => Ok(TaskKind::Hook),
            "command" => Ok(TaskKind::Command),
            "info" => Ok(TaskKind::Info),
            other => Err(format!("unknown task kind: {other}")),
        }
    }
}

/// Parameters for a `borg create` task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupParams {
    pub source_paths: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
    /// Borg compression spec, e.g. "zstd,3"
    #[serde(default)]
    pub compression: Option<String>,
    /// Archive name template; `{now}` expands to an UTC timestamp
    #[serde(default)]
    pub archive_name_template: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
}

/// Retention policy for a `borg prune` task. `keep_within_days` takes
/// precedence over the per-bucket keeps when set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PruneParams {
    #[serde(default)]
    pub keep_within_days: Option<u32>,
    #[serde(default)]
    pub keep_daily: Option<u32>,
    #[serde(default)]
    pub keep_weekly: Option<u32>,
    #[serde(default)]
    pub keep_monthly: Option<u32>,
    #[serde(default)]
    pub keep_yearly: Option<u32>,
    #[serde(default)]
    pub show_list: bool,
    #[serde(default)]
    pub show_stats: bool,
    #[serde(default)]
    pub save_space: bool,
}

/// Scope of a `borg check` run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    #[display("repository")]
    Repository,
    #[display("archives")]
    Archives,
    #[display("full")]
    Full,
}

/// Parameters for a `borg check` task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckParams {
    pub check_type: CheckType,
    #[serde(default)]
    pub verify_data: bool,
    /// Repair requires `confirmation_token`; without it the run is
    /// downgraded to a plain check and a warning is logged.
    #[serde(default)]
    pub repair_mode: bool,
    #[serde(default)]
    pub confirmation_token: Option<String>,
    #[serde(default)]
    pub save_space: bool,
    #[serde(default)]
    pub archive_prefix: Option<String>,
    #[serde(default)]
    pub archive_glob: Option<String>,
    #[serde(default)]
    pub first_n_archives: Option<u32>,
    #[serde(default)]
    pub last_n_archives: Option<u32>,
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
}

/// Parameters for an off-site sync task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudSyncParams {
    /// References `cloud_sync_configs.id`; provider tag and credentials are
    /// resolved (and decrypted) at task start
    pub config_id: i64,
}

/// Parameters for a notification task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationParams {
    /// References `notification_configs.id`
    pub config_id: i64,
    pub title: String,
    /// Template; `{job_status}` and `{failed_tasks}` expand from the
    /// statuses of preceding tasks
    pub message_template: String,
    #[serde(default)]
    pub continue_on_failure: bool,
}

/// Parameters for a user command hook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookParams {
    pub name: String,
    pub command: String,
    #[serde(default = "HookParams::default_shell")]
    pub shell: String,
    #[serde(default = "HookParams::default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default = "HookParams::default_log_output")]
    pub log_output: bool,
    #[serde(default)]
    pub continue_on_failure: bool,
}

impl HookParams {
    fn default_shell() -> String {
        "/bin/sh".to_string()
    }

    fn default_timeout_secs() -> u64 {
        300
    }

    fn default_log_output() -> bool {
        true
    }
}

/// Raw argv task, backing `start_borg_command`. Externally registered
/// jobs reuse this record with an empty argv: they are monitored only and
/// never dispatched to an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandParams {
    pub argv: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Metadata snapshot task; never fails the job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfoParams {
    #[serde(default)]
    pub include_archive_list: bool,
}

/// Typed parameter record per task kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskSpec {
    Backup(BackupParams),
    Prune(PruneParams),
    Check(CheckParams),
    CloudSync(CloudSyncParams),
    Notification(NotificationParams),
    Hook(HookParams),
    Command(CommandParams),
    Info(InfoParams),
}

impl TaskSpec {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskSpec::Backup(_) => TaskKind::Backup,
            TaskSpec::Prune(_) => TaskKind::Prune,
            TaskSpec::Check(_) => TaskKind::Check,
            TaskSpec::CloudSync(_) => TaskKind::CloudSync,
            TaskSpec::Notification(_) => TaskKind::Notification,
            TaskSpec::Hook(_) => TaskKind::Hook,
            TaskSpec::Command(_) => TaskKind::Command,
            TaskSpec::Info(_) => TaskKind::Info,
        }
    }

    /// Whether a failure of this task lets the job keep walking later tasks
    pub fn continue_on_failure(&self) -> bool {
        match self {
            TaskSpec::Hook(p) => p.continue_on_failure,
            TaskSpec::Notification(p) => p.continue_on_failure,
            // Info tasks never fail the job at all
            TaskSpec::Info(_) => true,
            _ => false,
        }
    }
}

/// Individual task within a composite job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BorgJobTask {
    pub task_name: String,
    pub status: TaskStatus,
    pub spec: TaskSpec,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub return_code: Option<i32>,
    pub error: Option<String>,
    /// Output accumulated for persistence; the live ring buffer is owned by
    /// the output manager
    pub output_lines: Vec<OutputLine>,
}

impl BorgJobTask {
    pub fn new(task_name: impl Into<String>, spec: TaskSpec) -> Self {
        Self {
            task_name: task_name.into(),
            status: TaskStatus::Pending,
            spec,
            started_at: None,
            completed_at: None,
            return_code: None,
            error: None,
            output_lines: Vec::new(),
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.spec.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminality() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Skipped.is_terminal());
        assert!(TaskStatus::Stopped.is_terminal());
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            TaskKind::Backup,
            TaskKind::Prune,
            TaskKind::Check,
            TaskKind::CloudSync,
            TaskKind::Notification,
            TaskKind::Hook,
            TaskKind::Command,
            TaskKind::Info,
        ] {
            let parsed: TaskKind = kind.to_string().parse().expect("round trip");
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_spec_kind_and_continue_on_failure() {
        let hook = TaskSpec::Hook(HookParams {
            name: "pre".to_string(),
            command: "true".to_string(),
            shell: "/bin/sh".to_string(),
            timeout_secs: 10,
            environment: HashMap::new(),
            log_output: true,
            continue_on_failure: true,
        });
        assert_eq!(hook.kind(), TaskKind::Hook);
        assert!(hook.continue_on_failure());

        let backup = TaskSpec::Backup(BackupParams {
            source_paths: vec!["/tmp/data".to_string()],
            excludes: vec![],
            compression: None,
            archive_name_template: None,
            dry_run: false,
        });
        assert!(!backup.continue_on_failure());
        assert!(TaskSpec::Info(InfoParams::default()).continue_on_failure());
    }

    #[test]
    fn test_spec_serde_tagging() {
        let spec = TaskSpec::Prune(PruneParams {
            keep_daily: Some(7),
            show_stats: true,
            ..Default::default()
        });
        let json = serde_json::to_value(&spec).expect("serialize");
        assert_eq!(json["kind"], "prune");
        let back: TaskSpec = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, spec);
    }

    #[test]
    fn test_hook_params_defaults_apply() {
        let p: HookParams =
            serde_json::from_str(r#"{"name":"post","command":"echo hi"}"#).expect("defaults");
        assert_eq!(p.shell, "/bin/sh");
        assert_eq!(p.timeout_secs, 300);
        assert!(p.log_output);
        assert!(!p.continue_on_failure);
    }
}
