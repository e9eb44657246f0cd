//! # Database Manager
//!
//! Persists jobs, tasks, and final status over sqlx/sqlite. Crash
//! consistency contract: every status transition is an independent, short
//! transaction; no compound write spans a child-process lifetime. Recovery
//! is not attempted at reboot: [`DatabaseManager::sweep_interrupted`] marks
//! any row found in a non-terminal status as `failed` with error
//! `"interrupted"` before the manager accepts new work.
//!
//! Transient write failures are retried once; a second failure is logged
//! and tolerated, reconciliation happening on the next successful write.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, error, warn};

use crate::errors::{BorgitoryError, BorgitoryResult};
use crate::models::{
    CheckConfigRow, CloudSyncConfigRow, JobRow, JobTaskRow, NotificationConfigRow, PruneConfigRow,
    RepositoryRow, ScheduleRow,
};
use crate::types::{
    BorgJob, BorgJobTask, CommandParams, JobId, JobKind, JobStatus, TaskSpec, TaskStatus,
};

/// A job read back from the store, tasks included
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub repository_id: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub tasks: Vec<TaskRecord>,
}

/// A task read back from the store
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task_order: usize,
    pub name: String,
    pub status: TaskStatus,
    pub spec: TaskSpec,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
    pub output: String,
}

/// Aggregate counters for the history surface
#[derive(Debug, Clone, Default)]
pub struct JobStatistics {
    pub total_jobs: i64,
    pub by_status: HashMap<String, i64>,
    pub by_kind: HashMap<String, i64>,
}

/// sqlite-backed persistence for the orchestration core
#[derive(Debug, Clone)]
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if necessary) the database at `url` and run embedded
    /// migrations. `sqlite::memory:` is accepted for tests.
    pub async fn connect(url: &str) -> BorgitoryResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| BorgitoryError::database("connect", e))?
            .create_if_missing(true);
        // A pooled in-memory database is one database per connection; pin
        // the pool to a single warm connection so migrations and queries
        // see the same store.
        let in_memory = url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .min_connections(u32::from(in_memory))
            .connect_with(options)
            .await
            .map_err(|e| BorgitoryError::database("connect", e))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| BorgitoryError::Configuration(format!("migration failed: {e}")))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // =========================================================================
    // Job writes
    // =========================================================================

    /// Atomically insert the job row and all of its task rows (pending)
    pub async fn create_job(&self, job: &BorgJob) -> BorgitoryResult<JobId> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BorgitoryError::database("create_job", e))?;

        sqlx::query(
            "INSERT INTO jobs (id, repository_id, kind, status, started_at, finished_at, error) \
             VALUES (?, ?, ?, ?, ?, NULL, NULL)",
        )
        .bind(job.id.as_hex())
        .bind(job.repository_id)
        .bind(job.kind.to_string())
        .bind(job.status.to_string())
        .bind(job.started_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| BorgitoryError::database("create_job", e))?;

        for (order, task) in job.tasks.iter().enumerate() {
            Self::insert_task(&mut tx, job.id, order, task).await?;
        }

        tx.commit()
            .await
            .map_err(|e| BorgitoryError::database("create_job", e))?;
        debug!(job_id = %job.id, tasks = job.tasks.len(), "persisted new job");
        Ok(job.id)
    }

    async fn insert_task(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        job_id: JobId,
        order: usize,
        task: &BorgJobTask,
    ) -> BorgitoryResult<()> {
        let parameters_json = serde_json::to_string(&task.spec)
            .map_err(|e| BorgitoryError::Validation(format!("unserializable task spec: {e}")))?;
        let output = task
            .output_lines
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        sqlx::query(
            "INSERT INTO job_tasks \
             (job_id, task_order, kind, name, status, started_at, finished_at, exit_code, error, output, parameters_json) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job_id.as_hex())
        .bind(order as i64)
        .bind(task.kind().to_string())
        .bind(&task.task_name)
        .bind(task.status.to_string())
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.return_code)
        .bind(&task.error)
        .bind(output)
        .bind(parameters_json)
        .execute(&mut **tx)
        .await
        .map_err(|e| BorgitoryError::database("insert_task", e))?;
        Ok(())
    }

    /// Update a single job row. Returns whether a row changed. The write is
    /// retried once on failure; a second failure is logged and swallowed so
    /// execution can continue in memory.
    pub async fn update_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        finished_at: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> bool {
        for attempt in 0..2 {
            let result = sqlx::query(
                "UPDATE jobs SET status = ?, finished_at = COALESCE(?, finished_at), \
                 error = COALESCE(?, error) WHERE id = ?",
            )
            .bind(status.to_string())
            .bind(finished_at)
            .bind(error)
            .bind(id.as_hex())
            .execute(&self.pool)
            .await;

            match result {
                Ok(done) => return done.rows_affected() > 0,
                Err(e) if attempt == 0 => {
                    warn!(job_id = %id, error = %e, "job status write failed, retrying once");
                }
                Err(e) => {
                    error!(job_id = %id, error = %e, "job status write failed twice, continuing in memory");
                }
            }
        }
        false
    }

    /// Overwrite the task rows for a job with their final state, preserving
    /// order indices. Used after the job runs to persist accumulated
    /// output and timings.
    pub async fn save_tasks(&self, job_id: JobId, tasks: &[BorgJobTask]) -> BorgitoryResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BorgitoryError::database("save_tasks", e))?;
        sqlx::query("DELETE FROM job_tasks WHERE job_id = ?")
            .bind(job_id.as_hex())
            .execute(&mut *tx)
            .await
            .map_err(|e| BorgitoryError::database("save_tasks", e))?;
        for (order, task) in tasks.iter().enumerate() {
            Self::insert_task(&mut tx, job_id, order, task).await?;
        }
        tx.commit()
            .await
            .map_err(|e| BorgitoryError::database("save_tasks", e))
    }

    /// Startup sweep: mark every non-terminal row `failed`/`"interrupted"`.
    /// Task rows are left untouched. Returns the number of swept jobs.
    pub async fn sweep_interrupted(&self) -> BorgitoryResult<u64> {
        let done = sqlx::query(
            "UPDATE jobs SET status = 'failed', error = 'interrupted', finished_at = ? \
             WHERE status IN ('pending', 'queued', 'running')",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| BorgitoryError::database("sweep_interrupted", e))?;
        if done.rows_affected() > 0 {
            warn!(
                swept = done.rows_affected(),
                "marked interrupted jobs as failed"
            );
        }
        Ok(done.rows_affected())
    }

    // =========================================================================
    // Job reads
    // =========================================================================

    pub async fn get_job(&self, id: JobId) -> BorgitoryResult<Option<JobRecord>> {
        let row: Option<JobRow> = sqlx::query_as(
            "SELECT id, repository_id, kind, status, started_at, finished_at, error \
             FROM jobs WHERE id = ?",
        )
        .bind(id.as_hex())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BorgitoryError::database("get_job", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let tasks: Vec<JobTaskRow> = sqlx::query_as(
            "SELECT id, job_id, task_order, kind, name, status, started_at, finished_at, \
             exit_code, error, output, parameters_json \
             FROM job_tasks WHERE job_id = ? ORDER BY task_order",
        )
        .bind(id.as_hex())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BorgitoryError::database("get_job_tasks", e))?;

        Ok(Some(Self::record_from_rows(row, tasks)?))
    }

    pub async fn get_jobs_by_repository(
        &self,
        repository_id: i64,
        limit: i64,
        kind: Option<JobKind>,
    ) -> BorgitoryResult<Vec<JobRecord>> {
        let rows: Vec<JobRow> = match kind {
            Some(kind) => sqlx::query_as(
                "SELECT id, repository_id, kind, status, started_at, finished_at, error \
                 FROM jobs WHERE repository_id = ? AND kind = ? \
                 ORDER BY started_at DESC LIMIT ?",
            )
            .bind(repository_id)
            .bind(kind.to_string())
            .bind(limit)
            .fetch_all(&self.pool)
            .await,
            None => sqlx::query_as(
                "SELECT id, repository_id, kind, status, started_at, finished_at, error \
                 FROM jobs WHERE repository_id = ? ORDER BY started_at DESC LIMIT ?",
            )
            .bind(repository_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await,
        }
        .map_err(|e| BorgitoryError::database("get_jobs_by_repository", e))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let id = JobId::parse(&row.id)
                .map_err(BorgitoryError::Validation)?;
            let tasks: Vec<JobTaskRow> = sqlx::query_as(
                "SELECT id, job_id, task_order, kind, name, status, started_at, finished_at, \
                 exit_code, error, output, parameters_json \
                 FROM job_tasks WHERE job_id = ? ORDER BY task_order",
            )
            .bind(id.as_hex())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BorgitoryError::database("get_job_tasks", e))?;
            records.push(Self::record_from_rows(row, tasks)?);
        }
        Ok(records)
    }

    pub async fn get_statistics(&self) -> BorgitoryResult<JobStatistics> {
        let by_status: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| BorgitoryError::database("get_statistics", e))?;
        let by_kind: Vec<(String, i64)> =
            sqlx::query_as("SELECT kind, COUNT(*) FROM jobs GROUP BY kind")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| BorgitoryError::database("get_statistics", e))?;

        let mut stats = JobStatistics::default();
        for (status, count) in by_status {
            stats.total_jobs += count;
            stats.by_status.insert(status, count);
        }
        for (kind, count) in by_kind {
            stats.by_kind.insert(kind, count);
        }
        Ok(stats)
    }

    fn record_from_rows(row: JobRow, task_rows: Vec<JobTaskRow>) -> BorgitoryResult<JobRecord> {
        let id = JobId::parse(&row.id).map_err(BorgitoryError::Validation)?;
        let status: JobStatus = row
            .status
            .parse()
            .map_err(BorgitoryError::Validation)?;
        let kind: JobKind = row.kind.parse().map_err(BorgitoryError::Validation)?;

        let mut tasks = Vec::with_capacity(task_rows.len());
        for task_row in task_rows {
            let spec: TaskSpec = serde_json::from_str(&task_row.parameters_json)
                .map_err(|e| BorgitoryError::Validation(format!("bad task parameters: {e}")))?;
            tasks.push(TaskRecord {
                task_order: task_row.task_order as usize,
                name: task_row.name,
                status: task_row
                    .status
                    .parse()
                    .map_err(BorgitoryError::Validation)?,
                spec,
                started_at: task_row.started_at,
                finished_at: task_row.finished_at,
                exit_code: task_row.exit_code,
                error: task_row.error,
                output: task_row.output,
            });
        }

        // Legacy rows predating composite jobs have no task rows; surface
        // them as a one-task composite so every consumer sees one shape.
        if tasks.is_empty() {
            tasks.push(TaskRecord {
                task_order: 0,
                name: format!("{kind} (legacy)"),
                status: match status {
                    JobStatus::Completed => TaskStatus::Completed,
                    JobStatus::Failed => TaskStatus::Failed,
                    JobStatus::Stopped => TaskStatus::Stopped,
                    _ => TaskStatus::Pending,
                },
                spec: TaskSpec::Command(CommandParams {
                    argv: Vec::new(),
                    env: Default::default(),
                }),
                started_at: Some(row.started_at),
                finished_at: row.finished_at,
                exit_code: None,
                error: row.error.clone(),
                output: String::new(),
            });
        }

        Ok(JobRecord {
            id,
            kind,
            status,
            repository_id: row.repository_id,
            started_at: row.started_at,
            finished_at: row.finished_at,
            error: row.error,
            tasks,
        })
    }

    // =========================================================================
    // Configuration reads (owned by the configuration subsystem)
    // =========================================================================

    pub async fn get_repository(&self, id: i64) -> BorgitoryResult<RepositoryRow> {
        sqlx::query_as(
            "SELECT id, name, path, enc_passphrase, enc_keyfile FROM repositories WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BorgitoryError::database("get_repository", e))?
        .ok_or(BorgitoryError::NotFound {
            entity: "repository",
            id: id.to_string(),
        })
    }

    pub async fn list_enabled_schedules(&self) -> BorgitoryResult<Vec<ScheduleRow>> {
        sqlx::query_as(
            "SELECT id, repository_id, name, cron_expr, enabled, spec_json \
             FROM schedules WHERE enabled = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BorgitoryError::database("list_enabled_schedules", e))
    }

    pub async fn get_schedule(&self, id: i64) -> BorgitoryResult<ScheduleRow> {
        sqlx::query_as(
            "SELECT id, repository_id, name, cron_expr, enabled, spec_json \
             FROM schedules WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BorgitoryError::database("get_schedule", e))?
        .ok_or(BorgitoryError::NotFound {
            entity: "schedule",
            id: id.to_string(),
        })
    }

    pub async fn get_cloud_sync_config(&self, id: i64) -> BorgitoryResult<CloudSyncConfigRow> {
        sqlx::query_as(
            "SELECT id, name, provider, provider_config_json, enabled \
             FROM cloud_sync_configs WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BorgitoryError::database("get_cloud_sync_config", e))?
        .ok_or(BorgitoryError::NotFound {
            entity: "cloud_sync_config",
            id: id.to_string(),
        })
    }

    pub async fn get_notification_config(&self, id: i64) -> BorgitoryResult<NotificationConfigRow> {
        sqlx::query_as(
            "SELECT id, name, provider, provider_config_json, enabled \
             FROM notification_configs WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BorgitoryError::database("get_notification_config", e))?
        .ok_or(BorgitoryError::NotFound {
            entity: "notification_config",
            id: id.to_string(),
        })
    }

    pub async fn get_prune_config(&self, id: i64) -> BorgitoryResult<PruneConfigRow> {
        sqlx::query_as(
            "SELECT id, name, keep_within_days, keep_daily, keep_weekly, keep_monthly, \
             keep_yearly, show_list, show_stats, save_space, enabled \
             FROM prune_configs WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BorgitoryError::database("get_prune_config", e))?
        .ok_or(BorgitoryError::NotFound {
            entity: "prune_config",
            id: id.to_string(),
        })
    }

    pub async fn get_check_config(&self, id: i64) -> BorgitoryResult<CheckConfigRow> {
        sqlx::query_as(
            "SELECT id, name, check_type, verify_data, repair_mode, save_space, max_duration, \
             archive_prefix, archive_glob, first_n_archives, last_n_archives, enabled \
             FROM check_configs WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BorgitoryError::database("get_check_config", e))?
        .ok_or(BorgitoryError::NotFound {
            entity: "check_config",
            id: id.to_string(),
        })
    }
}
