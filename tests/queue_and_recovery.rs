//! Pool admission, priority dispatch, backlog rejection, and the startup
//! recovery sweep, driven through the public facade.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{shell_task, start_manager, start_manager_with, wait_terminal, wait_until};

use borgitory_core::shared::database::DatabaseManager;
use borgitory_core::shared::types::{
    EventType, JobKind, JobPriority, JobStatus, TaskStatus,
};
use borgitory_core::JobManagerConfig;

fn backup_task(name: &str) -> borgitory_core::shared::types::BorgJobTask {
    use borgitory_core::shared::types::{BackupParams, BorgJobTask, TaskSpec};
    BorgJobTask::new(
        name,
        TaskSpec::Backup(BackupParams {
            source_paths: vec!["/tmp/data".to_string()],
            excludes: vec![],
            compression: None,
            archive_name_template: None,
            dry_run: true,
        }),
    )
}

#[tokio::test]
async fn test_high_priority_backup_dispatched_before_earlier_normal_one() {
    let config = JobManagerConfig {
        max_concurrent_backups: 1,
        ..Default::default()
    };
    let harness = start_manager(config).await;
    sqlx::query(
        "INSERT INTO repositories (id, name, path, enc_passphrase) \
         VALUES (1, 'main', '/repos/main', X'00')",
    )
    .execute(harness.database.pool())
    .await
    .expect("seed repository");

    let mut subscription = harness.manager.stream_events(false);

    // Occupy the single backup-pool slot
    let blocker = harness
        .manager
        .start_borg_command(
            vec!["sh".to_string(), "-c".to_string(), "sleep 1".to_string()],
            HashMap::new(),
            true,
        )
        .await
        .expect("blocker");
    wait_until(&harness.manager, blocker, |status| {
        status.status == JobStatus::Running
    })
    .await;

    // A' enqueued first at normal priority, B second at high priority;
    // once the blocker finishes, B must be admitted before A'.
    let normal = harness
        .manager
        .create_composite_job(
            JobKind::ManualBackup,
            vec![backup_task("backup A'")],
            Some(1),
            None,
            JobPriority::Normal,
        )
        .await
        .expect("normal job");
    let high = harness
        .manager
        .create_composite_job(
            JobKind::ManualBackup,
            vec![backup_task("backup B")],
            Some(1),
            None,
            JobPriority::High,
        )
        .await
        .expect("high job");
    assert!(harness.manager.queue_stats().backup_pending >= 2);

    wait_terminal(&harness.manager, blocker).await;
    wait_terminal(&harness.manager, normal).await;
    wait_terminal(&harness.manager, high).await;

    let mut admitted = Vec::new();
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(300), subscription.recv()).await
    {
        if event.event_type == EventType::JobAdmitted {
            admitted.push(event.job_id.expect("job id"));
        }
    }
    assert_eq!(admitted, vec![blocker, high, normal]);
}

#[tokio::test]
async fn test_operation_pool_capacity_is_respected() {
    let config = JobManagerConfig {
        max_concurrent_operations: 2,
        max_concurrent_backups: 1,
        ..Default::default()
    };
    let harness = start_manager(config).await;

    let mut ids = Vec::new();
    for i in 0..4 {
        let id = harness
            .manager
            .create_composite_job(
                JobKind::Command,
                vec![shell_task(&format!("sleep-{i}"), "sleep 0.4")],
                None,
                None,
                JobPriority::Normal,
            )
            .await
            .expect("job");
        ids.push(id);
    }

    // While anything is still pending, occupancy never exceeds capacity
    let deadline = std::time::Instant::now() + Duration::from_secs(30);
    loop {
        let stats = harness.manager.queue_stats();
        assert!(stats.operation_running <= 2, "pool over capacity: {stats:?}");
        if stats.operation_running == 0 && stats.operation_pending == 0 {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "jobs did not drain");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    for id in ids {
        let status = wait_terminal(&harness.manager, id).await;
        assert_eq!(status.status, JobStatus::Completed);
    }
}

#[tokio::test]
async fn test_backlog_cap_rejects_enqueue() {
    let config = JobManagerConfig {
        max_concurrent_operations: 1,
        max_concurrent_backups: 1,
        max_queued_jobs: 1,
        ..Default::default()
    };
    let harness = start_manager(config).await;

    // Fill the single slot, then the single backlog place
    let running = harness
        .manager
        .create_composite_job(
            JobKind::Command,
            vec![shell_task("slot", "sleep 1")],
            None,
            None,
            JobPriority::Normal,
        )
        .await
        .expect("running job");
    wait_until(&harness.manager, running, |s| s.status == JobStatus::Running).await;

    let queued = harness
        .manager
        .create_composite_job(
            JobKind::Command,
            vec![shell_task("backlog", "true")],
            None,
            None,
            JobPriority::Normal,
        )
        .await
        .expect("queued job");

    let rejected = harness
        .manager
        .create_composite_job(
            JobKind::Command,
            vec![shell_task("overflow", "true")],
            None,
            None,
            JobPriority::Normal,
        )
        .await;
    assert!(matches!(
        rejected,
        Err(borgitory_core::BorgitoryError::QueueFull)
    ));

    wait_terminal(&harness.manager, running).await;
    wait_terminal(&harness.manager, queued).await;
}

#[tokio::test]
async fn test_cancel_queued_job_never_runs() {
    let config = JobManagerConfig {
        max_concurrent_operations: 1,
        max_concurrent_backups: 1,
        ..Default::default()
    };
    let harness = start_manager(config).await;

    let blocker = harness
        .manager
        .create_composite_job(
            JobKind::Command,
            vec![shell_task("slot", "sleep 1")],
            None,
            None,
            JobPriority::Normal,
        )
        .await
        .expect("blocker");
    wait_until(&harness.manager, blocker, |s| s.status == JobStatus::Running).await;

    let queued = harness
        .manager
        .create_composite_job(
            JobKind::Command,
            vec![shell_task("one", "echo 1"), shell_task("two", "echo 2")],
            None,
            None,
            JobPriority::Normal,
        )
        .await
        .expect("queued");

    let outcome = harness.manager.cancel_job(queued).await;
    assert!(outcome.cancelled);
    assert_eq!(outcome.tasks_skipped, 2);
    assert!(!outcome.current_task_killed);

    let status = wait_terminal(&harness.manager, queued).await;
    assert_eq!(status.status, JobStatus::Stopped);
    assert!(status
        .tasks
        .iter()
        .all(|t| t.status == TaskStatus::Stopped));

    wait_terminal(&harness.manager, blocker).await;
}

#[tokio::test]
async fn test_startup_sweep_marks_interrupted_rows() {
    let database = Arc::new(
        DatabaseManager::connect("sqlite::memory:")
            .await
            .expect("database"),
    );

    // Simulate a crash: a row left in running status with no finish time
    sqlx::query(
        "INSERT INTO jobs (id, kind, status, started_at) \
         VALUES ('0123456789abcdef0123456789abcdef', 'manual_backup', 'running', ?)",
    )
    .bind(chrono::Utc::now())
    .execute(database.pool())
    .await
    .expect("seed row");
    sqlx::query(
        "INSERT INTO job_tasks (job_id, task_order, kind, name, status, output, parameters_json) \
         VALUES ('0123456789abcdef0123456789abcdef', 0, 'command', 'legacy', 'running', '', \
                 '{\"kind\":\"command\",\"argv\":[],\"env\":{}}')",
    )
    .execute(database.pool())
    .await
    .expect("seed task");

    let harness = start_manager_with(JobManagerConfig::default(), database).await;

    let job_id = borgitory_core::shared::types::JobId::parse("0123456789abcdef0123456789abcdef")
        .expect("id");
    let record = harness
        .database
        .get_job(job_id)
        .await
        .expect("read")
        .expect("row");
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("interrupted"));
    assert!(record.finished_at.is_some());
    // Task rows are untouched by the sweep
    assert_eq!(record.tasks[0].status, TaskStatus::Running);

    // And the manager starts with nothing running
    assert!(harness.manager.list_running().is_empty());
    let stats = harness.manager.queue_stats();
    assert_eq!(stats.backup_running + stats.operation_running, 0);
}

#[tokio::test]
async fn test_statistics_reflect_history() {
    let harness = start_manager(JobManagerConfig::default()).await;

    let ok = harness
        .manager
        .create_composite_job(
            JobKind::Command,
            vec![shell_task("ok", "true")],
            None,
            None,
            JobPriority::Normal,
        )
        .await
        .expect("ok job");
    let bad = harness
        .manager
        .create_composite_job(
            JobKind::Command,
            vec![shell_task("bad", "false")],
            None,
            None,
            JobPriority::Normal,
        )
        .await
        .expect("bad job");
    wait_terminal(&harness.manager, ok).await;
    wait_terminal(&harness.manager, bad).await;

    let stats = harness.manager.get_statistics().await.expect("stats");
    assert_eq!(stats.total_jobs, 2);
    assert_eq!(stats.by_status.get("completed"), Some(&1));
    assert_eq!(stats.by_status.get("failed"), Some(&1));
}
