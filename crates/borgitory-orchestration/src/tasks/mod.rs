//! # Task Executors
//!
//! One executor per task kind, all sharing the same shape: take the typed
//! parameter record, a task context, and return a [`TaskResult`]. Executors
//! recover nothing: spawn failures, non-zero exits, and timeouts all
//! surface as a failed result, and the composite runner applies the
//! continue-on-failure policy. Dispatch is an exhaustive match over
//! [`TaskSpec`], so a new task kind cannot be silently unhandled.

pub mod backup;
pub mod check;
pub mod cloud_sync;
pub mod command;
pub mod hook;
pub mod info;
pub mod notification;
pub mod prune;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use borgitory_shared::secrets::RepositoryCredentials;
use borgitory_shared::types::{
    EventType, JobEvent, JobId, OutputLine, OutputStream, TaskSpec, TaskStatus,
};

use crate::context::SystemContext;
use crate::events::JobEventBroadcaster;
use crate::executor::{ExitResult, MonitorOptions};
use crate::output::JobOutputManager;

/// Outcome of one task execution
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub success: bool,
    pub return_code: Option<i32>,
    pub error: Option<String>,
}

impl TaskResult {
    pub fn ok(return_code: Option<i32>) -> Self {
        Self {
            success: true,
            return_code,
            error: None,
        }
    }

    pub fn failed(return_code: Option<i32>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            return_code,
            error: Some(error.into()),
        }
    }

    pub fn from_exit(result: &ExitResult) -> Self {
        match (&result.error, result.code) {
            (None, 0) => Self::ok(Some(0)),
            (None, code) => Self::failed(Some(code), format!("exited with code {code}")),
            (Some(reason), code) => Self::failed(Some(code), reason.clone()),
        }
    }
}

/// Fan-out point for lines a task produces: ring buffer, event stream, and
/// the accumulation persisted with the task row.
#[derive(Debug)]
pub struct OutputSink {
    output: Arc<JobOutputManager>,
    events: JobEventBroadcaster,
    job_id: JobId,
    task_index: usize,
    collected: Mutex<Vec<OutputLine>>,
}

impl OutputSink {
    pub fn new(
        output: Arc<JobOutputManager>,
        events: JobEventBroadcaster,
        job_id: JobId,
        task_index: usize,
    ) -> Self {
        Self {
            output,
            events,
            job_id,
            task_index,
            collected: Mutex::new(Vec::new()),
        }
    }

    /// Record one line: append to the job's ring buffer, publish a
    /// `task_output` event, and keep a copy for persistence.
    pub fn emit(&self, stream: OutputStream, text: &str) {
        let line = self
            .output
            .append(self.job_id, stream, text)
            .unwrap_or_else(|| OutputLine::new(0, stream, text));
        self.events.publish(
            JobEvent::new(EventType::TaskOutput, Some(self.job_id))
                .with_task(self.task_index)
                .with_data(serde_json::json!({
                    "line": text,
                    "stream": stream.to_string(),
                })),
        );
        self.collected.lock().expect("sink lock").push(line);
    }

    /// Orchestrator-synthesized line (summaries, downgrade warnings)
    pub fn emit_meta(&self, text: &str) {
        self.emit(OutputStream::Meta, text);
    }

    /// Drain the lines accumulated for persistence
    pub fn take_collected(&self) -> Vec<OutputLine> {
        std::mem::take(&mut self.collected.lock().expect("sink lock"))
    }
}

/// Everything a task executor needs for one execution
#[derive(Debug)]
pub struct TaskContext<'a> {
    pub job_id: JobId,
    pub task_index: usize,
    pub system: &'a SystemContext,
    /// Decrypted at task start by the runner, dropped at task end
    pub repository: Option<&'a RepositoryCredentials>,
    pub cancel: &'a CancellationToken,
    pub sink: &'a OutputSink,
    /// Name and terminal status of every preceding task in this job
    pub preceding: &'a [(String, TaskStatus)],
    /// Context keys injected into hook environments (uppercased)
    pub env_context: &'a HashMap<String, String>,
}

impl TaskContext<'_> {
    /// Spawn `argv` and stream its output through the sink, honoring
    /// cancellation and the given monitor limits.
    pub async fn run_command(
        &self,
        argv: &[String],
        env: &HashMap<String, String>,
        options: MonitorOptions,
        log_output: bool,
    ) -> TaskResult {
        let handle = match self.system.executor().spawn(argv, env, None) {
            Ok(handle) => handle,
            Err(e) => {
                self.sink.emit_meta(&e.to_string());
                return TaskResult::failed(None, e.to_string());
            }
        };

        let result = self
            .system
            .executor()
            .monitor(
                handle,
                |stream, line| {
                    if log_output {
                        self.sink.emit(stream, line);
                    }
                },
                self.cancel,
                options,
            )
            .await;
        TaskResult::from_exit(&result)
    }

    pub fn monitor_options(&self) -> MonitorOptions {
        MonitorOptions {
            timeout: None,
            grace: self.system.config().termination_grace(),
        }
    }
}

/// Execute one task by kind
pub async fn execute(spec: &TaskSpec, ctx: &TaskContext<'_>) -> TaskResult {
    match spec {
        TaskSpec::Backup(params) => backup::run(params, ctx).await,
        TaskSpec::Prune(params) => prune::run(params, ctx).await,
        TaskSpec::Check(params) => check::run(params, ctx).await,
        TaskSpec::CloudSync(params) => cloud_sync::run(params, ctx).await,
        TaskSpec::Notification(params) => notification::run(params, ctx).await,
        TaskSpec::Hook(params) => hook::run(params, ctx).await,
        TaskSpec::Command(params) => command::run(params, ctx).await,
        TaskSpec::Info(params) => info::run(params, ctx).await,
    }
}

/// Standard failure for executors that need repository credentials
pub(crate) fn missing_repository() -> TaskResult {
    TaskResult::failed(None, "task requires a repository")
}
