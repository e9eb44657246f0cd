//! Consistency-check task: `borg check` with scope, data verification,
//! archive filters, and an optional hard duration limit. Repair mode is
//! destructive and only honored when the caller presented the job-scoped
//! confirmation token; otherwise the run is downgraded to a plain check.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{info, warn};

use borgitory_shared::types::{CheckParams, CheckType};

use super::{missing_repository, TaskContext, TaskResult};

/// Cleanup budget past a task's declared deadline
pub const TIMEOUT_CLEANUP_BUDGET: Duration = Duration::from_secs(5);

/// Whether the per-run confirmation token authorizes repair. The token
/// must echo the exact path of the repository about to be mutated.
pub fn repair_authorized(params: &CheckParams, repository_path: &str) -> bool {
    params
        .confirmation_token
        .as_deref()
        .is_some_and(|token| token == repository_path)
}

/// Build the `borg check` argv; `repair` must already be authorized
pub fn build_check_argv(params: &CheckParams, repository_path: &str, repair: bool) -> Vec<String> {
    let mut argv = vec!["borg".to_string(), "check".to_string()];
    match params.check_type {
        CheckType::Repository => argv.push("--repository-only".to_string()),
        CheckType::Archives => argv.push("--archives-only".to_string()),
        CheckType::Full => {}
    }
    if params.verify_data {
        argv.push("--verify-data".to_string());
    }
    if repair {
        argv.push("--repair".to_string());
    }
    if params.save_space {
        argv.push("--save-space".to_string());
    }
    if let Some(prefix) = &params.archive_prefix {
        argv.push(format!("--prefix={prefix}"));
    }
    if let Some(glob) = &params.archive_glob {
        argv.push(format!("--glob-archives={glob}"));
    }
    if let Some(n) = params.first_n_archives {
        argv.push(format!("--first={n}"));
    }
    if let Some(n) = params.last_n_archives {
        argv.push(format!("--last={n}"));
    }
    if let Some(secs) = params.max_duration_secs {
        argv.push(format!("--max-duration={secs}"));
    }
    argv.push(repository_path.to_string());
    argv
}

pub async fn run(params: &CheckParams, ctx: &TaskContext<'_>) -> TaskResult {
    let Some(credentials) = ctx.repository else {
        return missing_repository();
    };

    let repair = if params.repair_mode {
        let authorized = repair_authorized(params, &credentials.repository_path);
        if !authorized {
            warn!(job_id = %ctx.job_id, "repair requested without confirmation token, downgrading to check");
            ctx.sink
                .emit_meta("Repair mode requested without confirmation token; running a regular check instead");
        }
        authorized
    } else {
        false
    };

    let argv = build_check_argv(params, &credentials.repository_path, repair);
    let env: HashMap<String, String> = credentials.child_env().into_iter().collect();

    let mut options = ctx.monitor_options();
    options.timeout = params
        .max_duration_secs
        .map(|secs| Duration::from_secs(secs) + TIMEOUT_CLEANUP_BUDGET);

    info!(
        job_id = %ctx.job_id,
        check_type = %params.check_type,
        verify_data = params.verify_data,
        repair,
        "starting borg check"
    );
    let result = ctx.run_command(&argv, &env, options, true).await;

    match &result.error {
        Some(reason) if reason == "timeout" => {
            TaskResult::failed(result.return_code, "timeout")
        }
        _ => result,
    }
}
