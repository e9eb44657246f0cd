//! Hook task: user-supplied shell command run around the backup pipeline.
//! The hook sees the job id, its own name, and every context key as an
//! uppercased environment variable. Timeouts get a fixed cleanup budget
//! past the declared limit before the child is killed.

use std::collections::HashMap;
use std::time::Duration;

use tracing::info;

use borgitory_shared::types::HookParams;

use super::{TaskContext, TaskResult};
use crate::executor::MonitorOptions;
use crate::tasks::check::TIMEOUT_CLEANUP_BUDGET;

/// Environment the hook command runs with
pub fn build_hook_env(
    params: &HookParams,
    job_id: &str,
    context: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = params.environment.clone();
    for (key, value) in context {
        env.insert(key.to_uppercase(), value.clone());
    }
    env.insert("BORGITORY_JOB_ID".to_string(), job_id.to_string());
    env.insert("BORGITORY_HOOK_NAME".to_string(), params.name.clone());
    env
}

pub async fn run(params: &HookParams, ctx: &TaskContext<'_>) -> TaskResult {
    let argv = vec![
        params.shell.clone(),
        "-c".to_string(),
        params.command.clone(),
    ];
    let env = build_hook_env(params, &ctx.job_id.as_hex(), ctx.env_context);

    let options = MonitorOptions {
        timeout: Some(Duration::from_secs(params.timeout_secs) + TIMEOUT_CLEANUP_BUDGET),
        grace: TIMEOUT_CLEANUP_BUDGET,
    };

    info!(job_id = %ctx.job_id, hook = %params.name, timeout_secs = params.timeout_secs, "running hook");
    let result = ctx
        .run_command(&argv, &env, options, params.log_output)
        .await;

    match &result.error {
        Some(reason) if reason == "timeout" => {
            ctx.sink.emit_meta(&format!(
                "Hook '{}' exceeded its {}s timeout and was terminated",
                params.name, params.timeout_secs
            ));
            TaskResult::failed(result.return_code, "timeout")
        }
        _ => result,
    }
}
