//! # Composite Job Model
//!
//! A job is an ordered list of tasks executed sequentially by one worker.
//! Identity is a 128-bit value whose canonical form is 32 lowercase hex
//! characters with no separators; that form is what the database stores and
//! what every event carries, so it round-trips across stores.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::{BorgJobTask, TaskKind, TaskStatus};

/// Job identity: a 128-bit value, canonically 32 hex chars without dashes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Canonical encoding: 32 hex characters, no separators
    pub fn as_hex(&self) -> String {
        self.0.as_simple().to_string()
    }

    /// Parse either the canonical form or a legacy dash-separated encoding,
    /// normalizing to the canonical form.
    pub fn parse(s: &str) -> Result<Self, String> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| format!("invalid job id {s:?}: {e}"))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_hex())
    }
}

/// Overall job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[display("pending")]
    Pending,
    #[display("queued")]
    Queued,
    #[display("running")]
    Running,
    #[display("completed")]
    Completed,
    #[display("failed")]
    Failed,
    #[display("stopped")]
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped
        )
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "stopped" => Ok(JobStatus::Stopped),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Job kind tag used for routing and history filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    #[display("manual_backup")]
    ManualBackup,
    #[display("scheduled_backup")]
    ScheduledBackup,
    #[display("prune")]
    Prune,
    #[display("check")]
    Check,
    #[display("cloud_sync")]
    CloudSync,
    #[display("command")]
    Command,
    #[display("external")]
    External,
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual_backup" => Ok(JobKind::ManualBackup),
            "scheduled_backup" => Ok(JobKind::ScheduledBackup),
            "prune" => Ok(JobKind::Prune),
            "check" => Ok(JobKind::Check),
            "cloud_sync" => Ok(JobKind::CloudSync),
            "command" => Ok(JobKind::Command),
            "external" => Ok(JobKind::External),
            other => Err(format!("unknown job kind: {other}")),
        }
    }
}

/// A composite job held in the in-memory job table.
///
/// The task list is fixed at creation and never reordered; indices are dense
/// and zero-based. `current_task_index` points at the running task or, when
/// none is running, the next task to run. It never decreases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BorgJob {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Absent for system-level jobs
    pub repository_id: Option<i64>,
    pub schedule_id: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub tasks: Vec<BorgJobTask>,
    pub current_task_index: usize,
}

impl BorgJob {
    pub fn new(
        kind: JobKind,
        repository_id: Option<i64>,
        schedule_id: Option<i64>,
        tasks: Vec<BorgJobTask>,
    ) -> Self {
        Self {
            id: JobId::new(),
            kind,
            status: JobStatus::Pending,
            repository_id,
            schedule_id,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            tasks,
            current_task_index: 0,
        }
    }

    pub fn current_task(&self) -> Option<&BorgJobTask> {
        self.tasks.get(self.current_task_index)
    }

    /// Whether this job must be admitted through the backup pool
    pub fn is_backup(&self) -> bool {
        self.tasks.iter().any(|t| t.kind() == TaskKind::Backup)
    }

    pub fn running_task_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Running)
            .count()
    }

    pub fn all_tasks_terminal(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::task::{CommandParams, TaskSpec};
    use std::collections::HashMap;

    fn command_task(name: &str) -> BorgJobTask {
        BorgJobTask::new(
            name,
            TaskSpec::Command(CommandParams {
                argv: vec!["true".to_string()],
                env: HashMap::new(),
            }),
        )
    }

    #[test]
    fn test_job_id_canonical_form() {
        let id = JobId::new();
        let hex = id.as_hex();
        assert_eq!(hex.len(), 32);
        assert!(!hex.contains('-'));
        assert_eq!(JobId::parse(&hex).expect("parse"), id);
    }

    #[test]
    fn test_job_id_normalizes_legacy_dashes() {
        let id = JobId::new();
        let dashed = id.0.hyphenated().to_string();
        let parsed = JobId::parse(&dashed).expect("legacy parse");
        assert_eq!(parsed.as_hex(), id.as_hex());
    }

    #[test]
    fn test_status_terminality() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Stopped.is_terminal());
    }

    #[test]
    fn test_new_job_starts_pending_at_task_zero() {
        let job = BorgJob::new(JobKind::Command, None, None, vec![command_task("t0")]);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.current_task_index, 0);
        assert_eq!(job.current_task().map(|t| t.task_name.as_str()), Some("t0"));
        assert!(!job.is_backup());
    }
}
