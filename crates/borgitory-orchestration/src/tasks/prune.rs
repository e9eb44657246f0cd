//! Prune task: applies a retention policy with `borg prune` and reports a
//! structured summary line.

use std::collections::HashMap;

use tracing::info;

use borgitory_shared::types::PruneParams;

use super::{missing_repository, TaskContext, TaskResult};

/// Build the `borg prune` argv. `keep_within_days` takes precedence over
/// the per-bucket keeps.
pub fn build_prune_argv(params: &PruneParams, repository_path: &str) -> Vec<String> {
    let mut argv = vec!["borg".to_string(), "prune".to_string()];

    if let Some(days) = params.keep_within_days {
        argv.push(format!("--keep-within={days}d"));
    } else {
        for (flag, value) in [
            ("--keep-daily", params.keep_daily),
            ("--keep-weekly", params.keep_weekly),
            ("--keep-monthly", params.keep_monthly),
            ("--keep-yearly", params.keep_yearly),
        ] {
            if let Some(value) = value {
                argv.push(format!("{flag}={value}"));
            }
        }
    }
    if params.show_list {
        argv.push("--list".to_string());
    }
    if params.show_stats {
        argv.push("--stats".to_string());
    }
    if params.save_space {
        argv.push("--save-space".to_string());
    }
    argv.push(repository_path.to_string());
    argv
}

fn policy_summary(params: &PruneParams) -> String {
    if let Some(days) = params.keep_within_days {
        return format!("keep within {days} days");
    }
    let mut kept = Vec::new();
    for (label, value) in [
        ("daily", params.keep_daily),
        ("weekly", params.keep_weekly),
        ("monthly", params.keep_monthly),
        ("yearly", params.keep_yearly),
    ] {
        if let Some(value) = value {
            kept.push(format!("{value} {label}"));
        }
    }
    if kept.is_empty() {
        "no retention limits".to_string()
    } else {
        format!("keep {}", kept.join(", "))
    }
}

pub async fn run(params: &PruneParams, ctx: &TaskContext<'_>) -> TaskResult {
    let Some(credentials) = ctx.repository else {
        return missing_repository();
    };

    let argv = build_prune_argv(params, &credentials.repository_path);
    let env: HashMap<String, String> = credentials.child_env().into_iter().collect();

    info!(job_id = %ctx.job_id, policy = %policy_summary(params), "starting borg prune");
    let result = ctx
        .run_command(&argv, &env, ctx.monitor_options(), true)
        .await;

    if result.success {
        ctx.sink
            .emit_meta(&format!("Prune finished ({})", policy_summary(params)));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_within_takes_precedence() {
        let params = PruneParams {
            keep_within_days: Some(30),
            keep_daily: Some(7),
            ..Default::default()
        };
        let argv = build_prune_argv(&params, "/repos/main");
        assert!(argv.contains(&"--keep-within=30d".to_string()));
        assert!(!argv.iter().any(|a| a.starts_with("--keep-daily")));
    }

    #[test]
    fn test_bucket_keeps_and_flags() {
        let params = PruneParams {
            keep_daily: Some(7),
            keep_weekly: Some(4),
            keep_monthly: Some(6),
            keep_yearly: Some(1),
            show_list: true,
            show_stats: true,
            save_space: true,
            ..Default::default()
        };
        let argv = build_prune_argv(&params, "/repos/main");
        assert_eq!(
            argv,
            vec![
                "borg",
                "prune",
                "--keep-daily=7",
                "--keep-weekly=4",
                "--keep-monthly=6",
                "--keep-yearly=1",
                "--list",
                "--stats",
                "--save-space",
                "/repos/main",
            ]
        );
    }

    #[test]
    fn test_policy_summary() {
        assert_eq!(
            policy_summary(&PruneParams {
                keep_within_days: Some(14),
                ..Default::default()
            }),
            "keep within 14 days"
        );
        assert_eq!(
            policy_summary(&PruneParams {
                keep_daily: Some(7),
                keep_yearly: Some(2),
                ..Default::default()
            }),
            "keep 7 daily, 2 yearly"
        );
        assert_eq!(policy_summary(&PruneParams::default()), "no retention limits");
    }
}
