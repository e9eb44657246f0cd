//! # Task-List Builder
//!
//! The single place where persisted configuration becomes an ordered task
//! list, and the single validation point for job creation: unknown
//! repository or policy references fail here, synchronously, before any job
//! row exists. Task order is fixed: pre-hooks, backup, prune, check,
//! cloud-sync, notification, post-hooks.

use std::collections::HashMap;

use tracing::debug;

use borgitory_shared::database::DatabaseManager;
use borgitory_shared::errors::{BorgitoryError, BorgitoryResult};
use borgitory_shared::models::{HookDefinition, ScheduleRow, ScheduleSpec};
use borgitory_shared::types::{
    BackupParams, BorgJobTask, CheckParams, CheckType, CloudSyncParams, HookParams,
    NotificationParams, PruneParams, TaskSpec,
};

/// Builds validated task lists from schedule specs and policy records
#[derive(Debug, Clone)]
pub struct TaskListBuilder {
    database: DatabaseManager,
}

impl TaskListBuilder {
    pub fn new(database: DatabaseManager) -> Self {
        Self { database }
    }

    /// Deterministically expand a schedule into its task list
    pub async fn build_from_schedule(
        &self,
        schedule: &ScheduleRow,
    ) -> BorgitoryResult<Vec<BorgJobTask>> {
        let spec: ScheduleSpec = serde_json::from_str(&schedule.spec_json)
            .map_err(|e| BorgitoryError::Validation(format!("malformed schedule spec: {e}")))?;
        if spec.source_paths.is_empty() {
            return Err(BorgitoryError::Validation(
                "schedule spec has no source paths".to_string(),
            ));
        }

        // Resolve every referenced record up front; a dangling reference
        // means no job is created at all.
        let repository = self.database.get_repository(schedule.repository_id).await?;

        let mut tasks = Vec::new();
        for hook in &spec.pre_hooks {
            tasks.push(hook_task(hook, "pre"));
        }

        tasks.push(BorgJobTask::new(
            format!("backup {}", repository.name),
            TaskSpec::Backup(BackupParams {
                source_paths: spec.source_paths.clone(),
                excludes: spec.excludes.clone(),
                compression: spec.compression.clone(),
                archive_name_template: spec.archive_name_template.clone(),
                dry_run: false,
            }),
        ));

        if let Some(prune_id) = spec.prune_config_id {
            let prune = self.database.get_prune_config(prune_id).await?;
            tasks.push(BorgJobTask::new(
                format!("prune ({})", prune.name),
                TaskSpec::Prune(PruneParams {
                    keep_within_days: prune.keep_within_days.map(|v| v as u32),
                    keep_daily: prune.keep_daily.map(|v| v as u32),
                    keep_weekly: prune.keep_weekly.map(|v| v as u32),
                    keep_monthly: prune.keep_monthly.map(|v| v as u32),
                    keep_yearly: prune.keep_yearly.map(|v| v as u32),
                    show_list: prune.show_list,
                    show_stats: prune.show_stats,
                    save_space: prune.save_space,
                }),
            ));
        }

        if let Some(check_id) = spec.check_config_id {
            let check = self.database.get_check_config(check_id).await?;
            let check_type = match check.check_type.as_str() {
                "repository" => CheckType::Repository,
                "archives" => CheckType::Archives,
                "full" => CheckType::Full,
                other => {
                    return Err(BorgitoryError::Validation(format!(
                        "unknown check type: {other}"
                    )))
                }
            };
            tasks.push(BorgJobTask::new(
                format!("check ({})", check.name),
                TaskSpec::Check(CheckParams {
                    check_type,
                    verify_data: check.verify_data,
                    // Scheduled runs carry no confirmation token, so a
                    // repair-mode policy always downgrades to a plain check.
                    repair_mode: check.repair_mode,
                    confirmation_token: None,
                    save_space: check.save_space,
                    archive_prefix: check.archive_prefix.clone(),
                    archive_glob: check.archive_glob.clone(),
                    first_n_archives: check.first_n_archives.map(|v| v as u32),
                    last_n_archives: check.last_n_archives.map(|v| v as u32),
                    max_duration_secs: check.max_duration.map(|v| v as u64),
                }),
            ));
        }

        if let Some(cloud_id) = spec.cloud_sync_config_id {
            let cloud = self.database.get_cloud_sync_config(cloud_id).await?;
            tasks.push(BorgJobTask::new(
                format!("sync to {}", cloud.name),
                TaskSpec::CloudSync(CloudSyncParams { config_id: cloud.id }),
            ));
        }

        if let Some(notify_id) = spec.notification_config_id {
            let notify = self.database.get_notification_config(notify_id).await?;
            tasks.push(BorgJobTask::new(
                format!("notify via {}", notify.provider),
                TaskSpec::Notification(NotificationParams {
                    config_id: notify.id,
                    title: format!("Backup of {}", repository.name),
                    message_template: "Backup {job_status}. Failed tasks: {failed_tasks}"
                        .to_string(),
                    continue_on_failure: true,
                }),
            ));
        }

        for hook in &spec.post_hooks {
            tasks.push(hook_task(hook, "post"));
        }

        debug!(
            schedule_id = schedule.id,
            tasks = tasks.len(),
            "built task list from schedule"
        );
        Ok(tasks)
    }
}

fn hook_task(hook: &HookDefinition, phase: &str) -> BorgJobTask {
    BorgJobTask::new(
        format!("{phase}-hook {}", hook.name),
        TaskSpec::Hook(HookParams {
            name: hook.name.clone(),
            command: hook.command.clone(),
            shell: "/bin/sh".to_string(),
            timeout_secs: hook.timeout_secs.unwrap_or(300),
            environment: HashMap::new(),
            log_output: true,
            continue_on_failure: hook.continue_on_failure,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use borgitory_shared::types::TaskKind;

    async fn seeded_db() -> DatabaseManager {
        let db = DatabaseManager::connect("sqlite::memory:")
            .await
            .expect("db");
        sqlx::query(
            "INSERT INTO repositories (id, name, path, enc_passphrase) VALUES (1, 'main', '/repos/main', X'00')",
        )
        .execute(db.pool())
        .await
        .expect("repository");
        sqlx::query(
            "INSERT INTO prune_configs (id, name, keep_daily, show_stats) VALUES (7, 'weekly', 7, 1)",
        )
        .execute(db.pool())
        .await
        .expect("prune config");
        db
    }

    fn schedule(spec_json: &str) -> ScheduleRow {
        ScheduleRow {
            id: 1,
            repository_id: 1,
            name: "nightly".to_string(),
            cron_expr: "0 0 2 * * *".to_string(),
            enabled: true,
            spec_json: spec_json.to_string(),
        }
    }

    #[tokio::test]
    async fn test_builds_ordered_task_list() {
        let db = seeded_db().await;
        let builder = TaskListBuilder::new(db);
        let row = schedule(
            r#"{
                "source_paths": ["/data"],
                "prune_config_id": 7,
                "pre_hooks": [{"name": "quiesce", "command": "sync"}],
                "post_hooks": [{"name": "resume", "command": "true", "continue_on_failure": true}]
            }"#,
        );

        let tasks = builder.build_from_schedule(&row).await.expect("tasks");
        let kinds: Vec<TaskKind> = tasks.iter().map(|t| t.kind()).collect();
        assert_eq!(
            kinds,
            vec![TaskKind::Hook, TaskKind::Backup, TaskKind::Prune, TaskKind::Hook]
        );
        assert_eq!(tasks[0].task_name, "pre-hook quiesce");
        assert_eq!(tasks[3].task_name, "post-hook resume");
        assert!(tasks[3].spec.continue_on_failure());
    }

    #[tokio::test]
    async fn test_unknown_prune_config_is_validation_failure() {
        let db = seeded_db().await;
        let builder = TaskListBuilder::new(db);
        let row = schedule(r#"{"source_paths": ["/data"], "prune_config_id": 999}"#);
        let err = builder.build_from_schedule(&row).await.expect_err("dangling ref");
        assert!(matches!(err, BorgitoryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_empty_sources_rejected() {
        let db = seeded_db().await;
        let builder = TaskListBuilder::new(db);
        let row = schedule(r#"{"source_paths": []}"#);
        let err = builder.build_from_schedule(&row).await.expect_err("no sources");
        assert!(matches!(err, BorgitoryError::Validation(_)));
    }
}
