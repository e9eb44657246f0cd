//! Command task: raw argv pass-through, backing single-command jobs
//! created through `start_borg_command`.

use tracing::info;

use borgitory_shared::types::CommandParams;

use super::{TaskContext, TaskResult};

pub async fn run(params: &CommandParams, ctx: &TaskContext<'_>) -> TaskResult {
    if params.argv.is_empty() {
        return TaskResult::failed(None, "command has empty argv");
    }

    info!(job_id = %ctx.job_id, program = %params.argv[0], "running command");
    ctx.run_command(&params.argv, &params.env, ctx.monitor_options(), true)
        .await
}
