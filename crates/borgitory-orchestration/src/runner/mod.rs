//! # Composite Job Runner
//!
//! Walks the ordered task list of one job: advances the state machine,
//! publishes lifecycle events, persists every task boundary, applies the
//! continue-on-failure policy, and honors cancellation at every boundary
//! (and, through the executor, between line reads).
//!
//! Within one job execution is strictly sequential; at most one task is
//! running at any instant and `current_task_index` never decreases.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use borgitory_shared::secrets::RepositoryCredentials;
use borgitory_shared::types::{
    BorgJob, EventType, JobEvent, JobId, JobStatus, TaskKind, TaskSpec, TaskStatus,
};

use crate::context::SystemContext;
use crate::events::JobEventBroadcaster;
use crate::output::JobOutputManager;
use crate::tasks::{self, OutputSink, TaskContext};

/// Shared handle to the in-memory job table. Writes go through the runner
/// and the manager; readers take short snapshot locks.
pub type JobTable = Arc<DashMap<JobId, Arc<RwLock<BorgJob>>>>;

/// Executes one composite job at a time on behalf of a pool worker
#[derive(Debug, Clone)]
pub struct CompositeJobRunner {
    jobs: JobTable,
    cancel_tokens: Arc<DashMap<JobId, CancellationToken>>,
    output: Arc<JobOutputManager>,
    events: JobEventBroadcaster,
    context: Arc<SystemContext>,
}

impl CompositeJobRunner {
    pub fn new(
        jobs: JobTable,
        cancel_tokens: Arc<DashMap<JobId, CancellationToken>>,
        output: Arc<JobOutputManager>,
        events: JobEventBroadcaster,
        context: Arc<SystemContext>,
    ) -> Self {
        Self {
            jobs,
            cancel_tokens,
            output,
            events,
            context,
        }
    }

    fn job(&self, job_id: JobId) -> Option<Arc<RwLock<BorgJob>>> {
        self.jobs.get(&job_id).map(|entry| entry.clone())
    }

    fn cancel_token(&self, job_id: JobId) -> CancellationToken {
        self.cancel_tokens
            .get(&job_id)
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    /// Run the job to a terminal status. Returns the final status, or
    /// `None` when the job is unknown (already cleaned up).
    pub async fn run_job(&self, job_id: JobId) -> Option<JobStatus> {
        let job = self.job(job_id)?;
        let cancel = self.cancel_token(job_id);

        let task_count = {
            let mut guard = job.write().expect("job lock");
            guard.status = JobStatus::Running;
            guard.tasks.len()
        };
        self.events.publish(
            JobEvent::new(EventType::JobStarted, Some(job_id))
                .with_data(serde_json::json!({ "tasks": task_count })),
        );
        self.events
            .publish(JobEvent::job_status_changed(job_id, JobStatus::Running));
        self.context
            .database()
            .update_job_status(job_id, JobStatus::Running, None, None)
            .await;
        info!(job_id = %job_id, tasks = task_count, "job running");

        for index in 0..task_count {
            if cancel.is_cancelled() {
                self.mark_remaining(&job, index, TaskStatus::Stopped);
                return Some(self.finalize(job_id, &job, JobStatus::Stopped, None).await);
            }

            let (spec, task_name, preceding) = self.begin_task(&job, index);
            self.events.publish(
                JobEvent::new(EventType::TaskStarted, Some(job_id))
                    .with_task(index)
                    .with_data(serde_json::json!({
                        "task_name": task_name,
                        "kind": spec.kind().to_string(),
                    })),
            );

            // Credentials are task-local: decrypted here, dropped at the
            // end of the iteration on every exit path.
            let credentials = match self.decrypt_for(&job, &spec).await {
                Ok(credentials) => credentials,
                Err(message) => {
                    warn!(job_id = %job_id, task = %task_name, error = %message, "task setup failed");
                    self.finish_task(
                        &job,
                        index,
                        TaskStatus::Failed,
                        None,
                        Some(message.as_str()),
                        Vec::new(),
                    );
                    self.publish_task_completed(job_id, index, TaskStatus::Failed, None);
                    self.persist_tasks(job_id, &job).await;
                    if spec.continue_on_failure() {
                        continue;
                    }
                    self.mark_remaining(&job, index + 1, TaskStatus::Skipped);
                    let status = self
                        .finalize(job_id, &job, JobStatus::Failed, Some(message))
                        .await;
                    return Some(status);
                }
            };

            let env_context = self.hook_context(&job, credentials.as_ref());
            let sink = OutputSink::new(
                self.output.clone(),
                self.events.clone(),
                job_id,
                index,
            );
            let ctx = TaskContext {
                job_id,
                task_index: index,
                system: &self.context,
                repository: credentials.as_ref(),
                cancel: &cancel,
                sink: &sink,
                preceding: &preceding,
                env_context: &env_context,
            };

            let result = tasks::execute(&spec, &ctx).await;
            drop(credentials);

            let status = if cancel.is_cancelled() {
                TaskStatus::Stopped
            } else if result.success {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            self.finish_task(
                &job,
                index,
                status,
                result.return_code,
                result.error.as_deref(),
                sink.take_collected(),
            );
            self.publish_task_completed(job_id, index, status, result.return_code);
            self.persist_tasks(job_id, &job).await;

            match status {
                TaskStatus::Stopped => {
                    self.mark_remaining(&job, index + 1, TaskStatus::Stopped);
                    return Some(self.finalize(job_id, &job, JobStatus::Stopped, None).await);
                }
                TaskStatus::Failed if !spec.continue_on_failure() => {
                    self.mark_remaining(&job, index + 1, TaskStatus::Skipped);
                    let error = result
                        .error
                        .unwrap_or_else(|| format!("task '{task_name}' failed"));
                    let status = self
                        .finalize(job_id, &job, JobStatus::Failed, Some(error))
                        .await;
                    return Some(status);
                }
                _ => {}
            }
        }

        Some(self.finalize(job_id, &job, JobStatus::Completed, None).await)
    }

    fn begin_task(
        &self,
        job: &Arc<RwLock<BorgJob>>,
        index: usize,
    ) -> (TaskSpec, String, Vec<(String, TaskStatus)>) {
        let mut guard = job.write().expect("job lock");
        guard.current_task_index = index;
        let preceding: Vec<(String, TaskStatus)> = guard.tasks[..index]
            .iter()
            .map(|t| (t.task_name.clone(), t.status))
            .collect();
        let task = &mut guard.tasks[index];
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        (task.spec.clone(), task.task_name.clone(), preceding)
    }

    fn finish_task(
        &self,
        job: &Arc<RwLock<BorgJob>>,
        index: usize,
        status: TaskStatus,
        return_code: Option<i32>,
        error: Option<&str>,
        output_lines: Vec<borgitory_shared::types::OutputLine>,
    ) {
        let mut guard = job.write().expect("job lock");
        let task = &mut guard.tasks[index];
        task.status = status;
        task.completed_at = Some(Utc::now());
        task.return_code = return_code;
        task.error = error.map(str::to_string);
        task.output_lines.extend(output_lines);
    }

    fn publish_task_completed(
        &self,
        job_id: JobId,
        index: usize,
        status: TaskStatus,
        return_code: Option<i32>,
    ) {
        self.events.publish(
            JobEvent::new(EventType::TaskCompleted, Some(job_id))
                .with_task(index)
                .with_data(serde_json::json!({
                    "status": status.to_string(),
                    "return_code": return_code,
                })),
        );
    }

    /// Mark every non-terminal task from `from` onward with `status`
    fn mark_remaining(&self, job: &Arc<RwLock<BorgJob>>, from: usize, status: TaskStatus) {
        let mut guard = job.write().expect("job lock");
        for task in guard.tasks.iter_mut().skip(from) {
            if !task.status.is_terminal() {
                task.status = status;
                task.completed_at = Some(Utc::now());
            }
        }
    }

    /// Persist the task rows, retrying a failed write once. A second
    /// failure is logged and execution continues in memory; the next
    /// successful boundary write reconciles the rows.
    async fn persist_tasks(&self, job_id: JobId, job: &Arc<RwLock<BorgJob>>) {
        let tasks = job.read().expect("job lock").tasks.clone();
        for attempt in 0..2 {
            match self.context.database().save_tasks(job_id, &tasks).await {
                Ok(()) => return,
                Err(e) if attempt == 0 => {
                    warn!(job_id = %job_id, error = %e, "task persistence failed, retrying once");
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "task persistence failed twice, continuing in memory");
                }
            }
        }
    }

    async fn finalize(
        &self,
        job_id: JobId,
        job: &Arc<RwLock<BorgJob>>,
        status: JobStatus,
        error: Option<String>,
    ) -> JobStatus {
        let finished_at = Utc::now();
        {
            let mut guard = job.write().expect("job lock");
            guard.status = status;
            guard.completed_at = Some(finished_at);
            guard.error = error.clone();
        }

        let event_type = match status {
            JobStatus::Completed => EventType::JobCompleted,
            JobStatus::Stopped => EventType::JobStopped,
            _ => EventType::JobFailed,
        };
        self.events.publish(
            JobEvent::new(event_type, Some(job_id))
                .with_data(serde_json::json!({ "error": error })),
        );
        self.events
            .publish(JobEvent::job_status_changed(job_id, status));

        self.context
            .database()
            .update_job_status(job_id, status, Some(finished_at), error.as_deref())
            .await;
        self.persist_tasks(job_id, job).await;
        self.output.close(job_id);
        info!(job_id = %job_id, status = %status, "job finished");
        status
    }

    async fn decrypt_for(
        &self,
        job: &Arc<RwLock<BorgJob>>,
        spec: &TaskSpec,
    ) -> Result<Option<RepositoryCredentials>, String> {
        let needs_repository = matches!(
            spec.kind(),
            TaskKind::Backup | TaskKind::Prune | TaskKind::Check | TaskKind::CloudSync | TaskKind::Info
        );
        if !needs_repository {
            return Ok(None);
        }
        let Some(repository_id) = job.read().expect("job lock").repository_id else {
            return Ok(None);
        };

        let row = self
            .context
            .database()
            .get_repository(repository_id)
            .await
            .map_err(|e| e.to_string())?;
        let temp_dir = self.context.paths().temp_dir().to_path_buf();
        RepositoryCredentials::decrypt(&row, self.context.encryptor(), &temp_dir)
            .map(Some)
            .map_err(|e| e.to_string())
    }

    fn hook_context(
        &self,
        job: &Arc<RwLock<BorgJob>>,
        credentials: Option<&RepositoryCredentials>,
    ) -> HashMap<String, String> {
        let guard = job.read().expect("job lock");
        let mut context = HashMap::new();
        context.insert("job_kind".to_string(), guard.kind.to_string());
        if let Some(credentials) = credentials {
            context.insert(
                "repository_path".to_string(),
                credentials.repository_path.clone(),
            );
        }
        context
    }
}
