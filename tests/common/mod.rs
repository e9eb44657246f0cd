//! Shared harness for the end-to-end tests: a full manager over an
//! in-memory database, plus polling and event-draining helpers.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use borgitory_core::orchestration::events::EventSubscription;
use borgitory_core::orchestration::notifications::LoggingNotificationSender;
use borgitory_core::orchestration::manager::JobStatusDto;
use borgitory_core::shared::database::DatabaseManager;
use borgitory_core::shared::paths::PathService;
use borgitory_core::shared::secrets::PassthroughEncryptor;
use borgitory_core::shared::types::{
    BorgJobTask, CommandParams, HookParams, JobEvent, JobId, TaskSpec,
};
use borgitory_core::{JobManager, JobManagerConfig, JobManagerDependencies};

pub struct Harness {
    pub manager: Arc<JobManager>,
    pub database: Arc<DatabaseManager>,
    _data_dir: TempDir,
}

pub async fn start_manager(config: JobManagerConfig) -> Harness {
    let database = Arc::new(
        DatabaseManager::connect("sqlite::memory:")
            .await
            .expect("in-memory database"),
    );
    start_manager_with(config, database).await
}

pub async fn start_manager_with(
    config: JobManagerConfig,
    database: Arc<DatabaseManager>,
) -> Harness {
    let data_dir = tempfile::tempdir().expect("data dir");
    let deps = JobManagerDependencies {
        config,
        database: database.clone(),
        encryptor: Arc::new(PassthroughEncryptor),
        notifier: Arc::new(LoggingNotificationSender),
        paths: PathService::new(data_dir.path()),
    };
    let manager = JobManager::start(deps).await.expect("manager start");
    Harness {
        manager,
        database,
        _data_dir: data_dir,
    }
}

/// A task that runs `script` under `sh -c`
pub fn shell_task(name: &str, script: &str) -> BorgJobTask {
    BorgJobTask::new(
        name,
        TaskSpec::Command(CommandParams {
            argv: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            env: HashMap::new(),
        }),
    )
}

/// A hook task with an explicit continue-on-failure policy
pub fn hook_task(name: &str, command: &str, continue_on_failure: bool) -> BorgJobTask {
    BorgJobTask::new(
        name,
        TaskSpec::Hook(HookParams {
            name: name.to_string(),
            command: command.to_string(),
            shell: "/bin/sh".to_string(),
            timeout_secs: 60,
            environment: HashMap::new(),
            log_output: true,
            continue_on_failure,
        }),
    )
}

/// Poll until the job reaches a terminal status
pub async fn wait_terminal(manager: &JobManager, job_id: JobId) -> JobStatusDto {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if let Some(status) = manager.get_job_status(job_id).await {
                if status.status.is_terminal() {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("job should reach a terminal status")
}

/// Poll until `predicate` holds for the job's live status
pub async fn wait_until<F>(manager: &JobManager, job_id: JobId, predicate: F) -> JobStatusDto
where
    F: Fn(&JobStatusDto) -> bool,
{
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if let Some(status) = manager.get_job_status(job_id).await {
                if predicate(&status) {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition should hold before timeout")
}

/// Drain everything currently queued on a subscription
pub async fn drain_events(subscription: &mut EventSubscription) -> Vec<JobEvent> {
    let mut events = Vec::new();
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(300), subscription.recv()).await
    {
        events.push(event);
    }
    events
}
