//! # Job Manager
//!
//! Public entry point of the engine. Wires the executor, output manager,
//! broadcaster, queue, runner, and database together from one explicit
//! dependency struct, owns the in-memory job table, runs the pool worker
//! loops, and performs the startup interrupted-row sweep before accepting
//! work.
//!
//! Parallelism is across jobs only: each pool runs as many worker loops as
//! it has slots, and every worker executes one composite job at a time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use borgitory_shared::config::JobManagerConfig;
use borgitory_shared::database::{DatabaseManager, JobStatistics};
use borgitory_shared::errors::{BorgitoryError, BorgitoryResult};
use borgitory_shared::models::ScheduleRow;
use borgitory_shared::paths::PathService;
use borgitory_shared::secrets::Encryptor;
use borgitory_shared::types::{
    BorgJob, BorgJobTask, CommandParams, EventType, JobEvent, JobId, JobKind, JobPriority,
    JobStatus, TaskSpec, TaskStatus,
};

use crate::builder::TaskListBuilder;
use crate::context::SystemContext;
use crate::events::{EventSubscription, JobEventBroadcaster};
use crate::notifications::NotificationSender;
use crate::output::{JobOutputManager, OutputFollower, OutputSnapshot};
use crate::queue::{JobQueueManager, PoolKind, QueueStats};
use crate::runner::{CompositeJobRunner, JobTable};

/// Injectable dependencies for the job manager
#[derive(Debug)]
pub struct JobManagerDependencies {
    pub config: JobManagerConfig,
    pub database: Arc<DatabaseManager>,
    pub encryptor: Arc<dyn Encryptor>,
    pub notifier: Arc<dyn NotificationSender>,
    pub paths: PathService,
}

/// Point-in-time status view of a job
#[derive(Debug, Clone)]
pub struct JobStatusDto {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub current_task_index: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub tasks: Vec<TaskStatusDto>,
}

/// Per-task slice of [`JobStatusDto`]
#[derive(Debug, Clone)]
pub struct TaskStatusDto {
    pub name: String,
    pub kind: String,
    pub status: TaskStatus,
    pub return_code: Option<i32>,
}

/// Result of a cancellation request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CancelOutcome {
    /// Whether this call initiated (or the job already had) a stop
    pub cancelled: bool,
    /// Tasks that will never run because of the stop
    pub tasks_skipped: usize,
    /// Whether a running child process was terminated
    pub current_task_killed: bool,
}

/// The façade over subsystems A–G
#[derive(Debug)]
pub struct JobManager {
    context: Arc<SystemContext>,
    jobs: JobTable,
    cancel_tokens: Arc<DashMap<JobId, CancellationToken>>,
    output: Arc<JobOutputManager>,
    events: JobEventBroadcaster,
    queue: Arc<JobQueueManager>,
    runner: CompositeJobRunner,
    builder: TaskListBuilder,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl JobManager {
    /// Build the manager, sweep interrupted rows, and start the pool
    /// workers and the keep-alive loop.
    pub async fn start(deps: JobManagerDependencies) -> BorgitoryResult<Arc<Self>> {
        deps.paths.ensure_dirs()?;
        let config = deps.config.clone();

        // Recovery sweep runs before any work is accepted
        deps.database.sweep_interrupted().await?;

        let context = Arc::new(SystemContext::new(
            config.clone(),
            deps.database,
            deps.encryptor,
            deps.notifier,
            deps.paths,
        ));
        let jobs: JobTable = Arc::new(DashMap::new());
        let cancel_tokens = Arc::new(DashMap::new());
        let output = Arc::new(JobOutputManager::new(config.max_output_lines_per_job));
        let events = JobEventBroadcaster::new(config.sse_max_queue_size, config.event_replay_size);
        let queue = Arc::new(JobQueueManager::new(
            config.max_concurrent_backups,
            config.max_concurrent_operations,
            config.max_queued_jobs,
            config.queue_poll_interval(),
        ));
        let runner = CompositeJobRunner::new(
            jobs.clone(),
            cancel_tokens.clone(),
            output.clone(),
            events.clone(),
            context.clone(),
        );
        let builder = TaskListBuilder::new(context.database().clone());

        let manager = Arc::new(Self {
            context,
            jobs,
            cancel_tokens,
            output,
            events,
            queue,
            runner,
            builder,
            shutdown: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        });

        manager.spawn_workers();
        let keepalive = manager
            .events
            .spawn_keepalive(config.sse_keepalive_timeout());
        manager
            .background
            .lock()
            .expect("background lock")
            .push(keepalive);

        info!(
            backup_slots = config.max_concurrent_backups,
            operation_slots = config.max_concurrent_operations,
            "job manager started"
        );
        Ok(manager)
    }

    fn spawn_workers(self: &Arc<Self>) {
        let mut handles = self.background.lock().expect("background lock");
        for pool in [PoolKind::Backup, PoolKind::Operation] {
            for slot in 0..self.queue.capacity(pool) {
                let manager = Arc::clone(self);
                handles.push(tokio::spawn(async move {
                    manager.worker_loop(pool, slot).await;
                }));
            }
        }
    }

    async fn worker_loop(&self, pool: PoolKind, slot: usize) {
        loop {
            let queued = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                queued = self.queue.dequeue(pool) => queued,
            };
            self.events.publish(
                JobEvent::new(EventType::JobAdmitted, Some(queued.job_id)).with_data(
                    serde_json::json!({ "pool": pool.name(), "priority": queued.priority.to_string() }),
                ),
            );
            let status = self.runner.run_job(queued.job_id).await;
            self.queue.mark_complete(
                pool,
                queued.job_id,
                matches!(status, Some(JobStatus::Completed)),
            );
        }
        info!(pool = pool.name(), slot, "worker stopped");
    }

    /// Stop the workers and background loops. Running children are left to
    /// their cancellation tokens; call [`Self::cancel_job`] first for a
    /// hard stop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for handle in self.background.lock().expect("background lock").drain(..) {
            handle.abort();
        }
    }

    // =========================================================================
    // Creation and admission
    // =========================================================================

    /// Create a composite job and admit it to the right pool. `priority`
    /// defaults to normal; this typed API is the only override path.
    pub async fn create_composite_job(
        &self,
        kind: JobKind,
        tasks: Vec<BorgJobTask>,
        repository_id: Option<i64>,
        schedule_id: Option<i64>,
        priority: JobPriority,
    ) -> BorgitoryResult<JobId> {
        if tasks.is_empty() {
            return Err(BorgitoryError::Validation(
                "a composite job needs at least one task".to_string(),
            ));
        }
        if let Some(repository_id) = repository_id {
            // Unknown repository surfaces synchronously; no job is created
            self.context.database().get_repository(repository_id).await?;
        }

        let job = BorgJob::new(kind, repository_id, schedule_id, tasks);
        let pool = if job.is_backup() {
            PoolKind::Backup
        } else {
            PoolKind::Operation
        };
        self.admit(job, pool, priority).await
    }

    /// Convenience wrapper: a single-command job, still a composite with
    /// one task.
    pub async fn start_borg_command(
        &self,
        argv: Vec<String>,
        env: HashMap<String, String>,
        is_backup: bool,
    ) -> BorgitoryResult<JobId> {
        if argv.is_empty() {
            return Err(BorgitoryError::Validation("empty argv".to_string()));
        }
        let name = argv.join(" ");
        let job = BorgJob::new(
            JobKind::Command,
            None,
            None,
            vec![BorgJobTask::new(
                name,
                TaskSpec::Command(CommandParams { argv, env }),
            )],
        );
        let pool = if is_backup {
            PoolKind::Backup
        } else {
            PoolKind::Operation
        };
        self.admit(job, pool, JobPriority::Normal).await
    }

    /// Expand a schedule through the builder and admit the resulting job
    pub async fn run_schedule(&self, schedule: &ScheduleRow) -> BorgitoryResult<JobId> {
        let tasks = self.builder.build_from_schedule(schedule).await?;
        self.create_composite_job(
            JobKind::ScheduledBackup,
            tasks,
            Some(schedule.repository_id),
            Some(schedule.id),
            JobPriority::Normal,
        )
        .await
    }

    async fn admit(
        &self,
        mut job: BorgJob,
        pool: PoolKind,
        priority: JobPriority,
    ) -> BorgitoryResult<JobId> {
        let job_id = job.id;
        job.status = JobStatus::Queued;
        let kind = job.kind;

        self.output.create(job_id);
        self.cancel_tokens.insert(job_id, CancellationToken::new());
        self.context.database().create_job(&job).await?;
        self.jobs.insert(job_id, Arc::new(RwLock::new(job)));

        // Published before enqueue so subscribers always see queued before
        // admitted, regardless of how fast a worker picks the job up.
        self.events.publish(
            JobEvent::new(EventType::JobQueued, Some(job_id)).with_data(serde_json::json!({
                "pool": pool.name(),
                "priority": priority.to_string(),
            })),
        );

        if !self.queue.enqueue(pool, job_id, kind, priority) {
            // Backlog cap reached: the persisted row records the rejection
            self.context
                .database()
                .update_job_status(
                    job_id,
                    JobStatus::Failed,
                    Some(Utc::now()),
                    Some("queue backlog cap reached"),
                )
                .await;
            self.events.publish(
                JobEvent::new(EventType::JobFailed, Some(job_id))
                    .with_data(serde_json::json!({ "error": "queue backlog cap reached" })),
            );
            self.jobs.remove(&job_id);
            self.cancel_tokens.remove(&job_id);
            self.output.clear(job_id);
            return Err(BorgitoryError::QueueFull);
        }
        Ok(job_id)
    }

    /// Register work spawned by a collaborator for monitoring only. The job
    /// appears as a one-task composite already running.
    pub async fn register_external_job(
        &self,
        job_id: JobId,
        kind: JobKind,
        name: impl Into<String>,
    ) -> BorgitoryResult<()> {
        if self.jobs.contains_key(&job_id) {
            return Err(BorgitoryError::Validation(format!(
                "job {job_id} is already registered"
            )));
        }
        let mut task = BorgJobTask::new(
            name,
            TaskSpec::Command(CommandParams {
                argv: Vec::new(),
                env: HashMap::new(),
            }),
        );
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());

        let mut job = BorgJob::new(kind, None, None, vec![task]);
        job.id = job_id;
        job.status = JobStatus::Running;

        self.output.create(job_id);
        self.cancel_tokens.insert(job_id, CancellationToken::new());
        self.context.database().create_job(&job).await?;
        self.jobs.insert(job_id, Arc::new(RwLock::new(job)));
        self.events
            .publish(JobEvent::new(EventType::JobStarted, Some(job_id)));
        self.events
            .publish(JobEvent::job_status_changed(job_id, JobStatus::Running));
        Ok(())
    }

    /// Completion callback for externally registered jobs
    pub async fn complete_external_job(
        &self,
        job_id: JobId,
        success: bool,
        error: Option<String>,
    ) -> BorgitoryResult<()> {
        let job = self
            .jobs
            .get(&job_id)
            .map(|entry| entry.clone())
            .ok_or(BorgitoryError::NotFound {
                entity: "job",
                id: job_id.as_hex(),
            })?;

        let status = if success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        let finished_at = Utc::now();
        let tasks = {
            let mut guard = job.write().expect("job lock");
            guard.status = status;
            guard.completed_at = Some(finished_at);
            guard.error = error.clone();
            for task in &mut guard.tasks {
                if !task.status.is_terminal() {
                    task.status = if success {
                        TaskStatus::Completed
                    } else {
                        TaskStatus::Failed
                    };
                    task.completed_at = Some(finished_at);
                    task.error = error.clone();
                }
            }
            guard.tasks.clone()
        };

        self.context
            .database()
            .update_job_status(job_id, status, Some(finished_at), error.as_deref())
            .await;
        if let Err(e) = self.context.database().save_tasks(job_id, &tasks).await {
            warn!(job_id = %job_id, error = %e, "external job task persistence failed");
        }
        self.events.publish(
            JobEvent::new(
                if success {
                    EventType::JobCompleted
                } else {
                    EventType::JobFailed
                },
                Some(job_id),
            )
            .with_data(serde_json::json!({ "error": error })),
        );
        self.events
            .publish(JobEvent::job_status_changed(job_id, status));
        self.output.close(job_id);
        Ok(())
    }

    // =========================================================================
    // Queries and streams
    // =========================================================================

    /// Live table first, then the persisted store
    pub async fn get_job_status(&self, job_id: JobId) -> Option<JobStatusDto> {
        if let Some(entry) = self.jobs.get(&job_id) {
            let guard = entry.read().expect("job lock");
            return Some(JobStatusDto {
                id: guard.id,
                kind: guard.kind,
                status: guard.status,
                current_task_index: guard.current_task_index,
                started_at: guard.started_at,
                completed_at: guard.completed_at,
                error: guard.error.clone(),
                tasks: guard
                    .tasks
                    .iter()
                    .map(|t| TaskStatusDto {
                        name: t.task_name.clone(),
                        kind: t.kind().to_string(),
                        status: t.status,
                        return_code: t.return_code,
                    })
                    .collect(),
            });
        }

        let record = self.context.database().get_job(job_id).await.ok()??;
        Some(JobStatusDto {
            id: record.id,
            kind: record.kind,
            status: record.status,
            current_task_index: record.tasks.len().saturating_sub(1),
            started_at: record.started_at,
            completed_at: record.finished_at,
            error: record.error,
            tasks: record
                .tasks
                .iter()
                .map(|t| TaskStatusDto {
                    name: t.name.clone(),
                    kind: t.spec.kind().to_string(),
                    status: t.status,
                    return_code: t.exit_code.map(|c| c as i32),
                })
                .collect(),
        })
    }

    /// Point-in-time output dump, optionally only the last `tail` lines
    pub fn get_job_output(&self, job_id: JobId, tail: Option<usize>) -> Option<OutputSnapshot> {
        self.output.snapshot(job_id, tail)
    }

    /// Historical output then live lines until the job terminates
    pub fn follow_job_output(&self, job_id: JobId) -> Option<OutputFollower> {
        self.output.follow(job_id)
    }

    /// Subscribe to the full event stream (with recent-event replay)
    pub fn stream_events(&self, send_replay: bool) -> EventSubscription {
        self.events.subscribe(send_replay)
    }

    /// Event stream narrowed to one job
    pub fn stream_job_updates(&self, job_id: JobId) -> impl Stream<Item = JobEvent> {
        self.events
            .subscribe(true)
            .into_stream()
            .filter(move |event| futures::future::ready(event.job_id == Some(job_id)))
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn list_running(&self) -> Vec<JobId> {
        self.queue.list_running()
    }

    pub async fn get_statistics(&self) -> BorgitoryResult<JobStatistics> {
        self.context.database().get_statistics().await
    }

    pub fn events(&self) -> &JobEventBroadcaster {
        &self.events
    }

    pub fn database(&self) -> &DatabaseManager {
        self.context.database()
    }

    // =========================================================================
    // Cancellation and cleanup
    // =========================================================================

    /// Request a stop. Idempotent and safe after completion: at most one
    /// child-process termination ever happens per job.
    pub async fn cancel_job(&self, job_id: JobId) -> CancelOutcome {
        let Some(job) = self.jobs.get(&job_id).map(|entry| entry.clone()) else {
            return CancelOutcome::default();
        };

        let (status, current_index, current_running, pending_after) = {
            let guard = job.read().expect("job lock");
            let current_running = guard
                .tasks
                .get(guard.current_task_index)
                .is_some_and(|t| t.status == TaskStatus::Running);
            // Counts every task the stop prevents from completing,
            // including the one being killed
            let pending_after = guard
                .tasks
                .iter()
                .skip(guard.current_task_index)
                .filter(|t| !t.status.is_terminal())
                .count();
            (
                guard.status,
                guard.current_task_index,
                current_running,
                pending_after,
            )
        };

        match status {
            // Already terminal: nothing else to stop
            s if s.is_terminal() => CancelOutcome {
                cancelled: s == JobStatus::Stopped,
                ..Default::default()
            },
            JobStatus::Pending | JobStatus::Queued if self.queue.cancel_queued(job_id) => {
                // Removed from the admission queue before any worker saw
                // it; finalize here without ever running a task.
                if let Some(token) = self.cancel_tokens.get(&job_id) {
                    token.cancel();
                }
                let finished_at = Utc::now();
                let (skipped, tasks) = {
                    let mut guard = job.write().expect("job lock");
                    let mut skipped = 0;
                    for task in &mut guard.tasks {
                        if !task.status.is_terminal() {
                            task.status = TaskStatus::Stopped;
                            task.completed_at = Some(finished_at);
                            skipped += 1;
                        }
                    }
                    guard.status = JobStatus::Stopped;
                    guard.completed_at = Some(finished_at);
                    (skipped, guard.tasks.clone())
                };
                self.context
                    .database()
                    .update_job_status(job_id, JobStatus::Stopped, Some(finished_at), None)
                    .await;
                if let Err(e) = self.context.database().save_tasks(job_id, &tasks).await {
                    warn!(job_id = %job_id, error = %e, "stop persistence failed");
                }
                self.events
                    .publish(JobEvent::new(EventType::JobStopped, Some(job_id)));
                self.events
                    .publish(JobEvent::job_status_changed(job_id, JobStatus::Stopped));
                self.output.close(job_id);
                info!(job_id = %job_id, "queued job stopped before admission");
                CancelOutcome {
                    cancelled: true,
                    tasks_skipped: skipped,
                    current_task_killed: false,
                }
            }
            _ => {
                // Running: flag the token; the runner and executor stop the
                // child within the grace period and mark the remainder.
                if let Some(token) = self.cancel_tokens.get(&job_id) {
                    token.cancel();
                }
                info!(
                    job_id = %job_id,
                    current_task = current_index,
                    "cancellation requested"
                );
                CancelOutcome {
                    cancelled: true,
                    tasks_skipped: pending_after,
                    current_task_killed: current_running,
                }
            }
        }
    }

    /// Drop a terminal job's in-memory state; the persisted row remains
    pub fn cleanup_job(&self, job_id: JobId) -> bool {
        let terminal = self
            .jobs
            .get(&job_id)
            .map(|entry| entry.read().expect("job lock").status.is_terminal())
            .unwrap_or(false);
        if !terminal {
            return false;
        }
        self.jobs.remove(&job_id);
        self.cancel_tokens.remove(&job_id);
        self.output.clear(job_id);
        true
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
