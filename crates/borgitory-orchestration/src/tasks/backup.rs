//! Backup task: drives `borg create` against the job's repository. The
//! passphrase travels in the child environment, never on the argv.

use std::collections::HashMap;

use chrono::Utc;
use tracing::info;

use borgitory_shared::types::BackupParams;

use super::{missing_repository, TaskContext, TaskResult};

/// Expand the archive name template. `{now}` becomes a UTC timestamp; the
/// default template is `backup-{now}`.
fn archive_name(params: &BackupParams) -> String {
    let template = params
        .archive_name_template
        .as_deref()
        .unwrap_or("backup-{now}");
    template.replace("{now}", &Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string())
}

/// Build the `borg create` argv for `repository::archive`
pub fn build_create_argv(params: &BackupParams, repository_path: &str, archive: &str) -> Vec<String> {
    let mut argv = vec![
        "borg".to_string(),
        "create".to_string(),
        "--stats".to_string(),
    ];
    if params.dry_run {
        argv.push("--dry-run".to_string());
    }
    if let Some(compression) = &params.compression {
        argv.push("--compression".to_string());
        argv.push(compression.clone());
    }
    for exclude in &params.excludes {
        argv.push("--exclude".to_string());
        argv.push(exclude.clone());
    }
    argv.push(format!("{repository_path}::{archive}"));
    argv.extend(params.source_paths.iter().cloned());
    argv
}

pub async fn run(params: &BackupParams, ctx: &TaskContext<'_>) -> TaskResult {
    let Some(credentials) = ctx.repository else {
        return missing_repository();
    };
    if params.source_paths.is_empty() {
        return TaskResult::failed(None, "backup has no source paths");
    }

    let archive = archive_name(params);
    let argv = build_create_argv(params, &credentials.repository_path, &archive);
    let env: HashMap<String, String> = credentials.child_env().into_iter().collect();

    info!(job_id = %ctx.job_id, archive = %archive, dry_run = params.dry_run, "starting borg create");
    let result = ctx
        .run_command(&argv, &env, ctx.monitor_options(), true)
        .await;

    if result.success {
        ctx.sink
            .emit_meta(&format!("Archive {archive} created successfully"));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> BackupParams {
        BackupParams {
            source_paths: vec!["/home".to_string(), "/etc".to_string()],
            excludes: vec!["*.cache".to_string()],
            compression: Some("zstd,3".to_string()),
            archive_name_template: None,
            dry_run: false,
        }
    }

    #[test]
    fn test_create_argv_shape() {
        let argv = build_create_argv(&params(), "/repos/main", "backup-2026-01-01");
        assert_eq!(
            argv,
            vec![
                "borg",
                "create",
                "--stats",
                "--compression",
                "zstd,3",
                "--exclude",
                "*.cache",
                "/repos/main::backup-2026-01-01",
                "/home",
                "/etc",
            ]
        );
    }

    #[test]
    fn test_dry_run_flag() {
        let mut p = params();
        p.dry_run = true;
        let argv = build_create_argv(&p, "/repos/main", "a");
        assert!(argv.contains(&"--dry-run".to_string()));
    }

    #[test]
    fn test_archive_name_default_template() {
        let name = archive_name(&params());
        assert!(name.starts_with("backup-"));
        assert!(!name.contains("{now}"));
    }

    #[test]
    fn test_archive_name_custom_template() {
        let mut p = params();
        p.archive_name_template = Some("host1-{now}".to_string());
        assert!(archive_name(&p).starts_with("host1-"));
    }

    #[test]
    fn test_passphrase_never_on_argv() {
        let argv = build_create_argv(&params(), "/repos/main", "a");
        assert!(argv.iter().all(|a| !a.contains("PASSPHRASE")));
    }
}
