//! Info task: records a repository metadata snapshot (info output and,
//! optionally, the archive count). Purely informational; whatever happens,
//! it completes without failing the job.

use std::collections::HashMap;

use tracing::debug;

use borgitory_shared::types::{InfoParams, OutputStream};

use super::{TaskContext, TaskResult};

pub async fn run(params: &InfoParams, ctx: &TaskContext<'_>) -> TaskResult {
    let Some(credentials) = ctx.repository else {
        ctx.sink.emit_meta("No repository attached, nothing to record");
        return TaskResult::ok(None);
    };
    let env: HashMap<String, String> = credentials.child_env().into_iter().collect();

    let argv = vec![
        "borg".to_string(),
        "info".to_string(),
        "--json".to_string(),
        credentials.repository_path.clone(),
    ];
    let result = ctx
        .run_command(&argv, &env, ctx.monitor_options(), true)
        .await;
    if !result.success {
        debug!(job_id = %ctx.job_id, "borg info failed, recording and continuing");
        ctx.sink
            .emit_meta("Repository info unavailable, snapshot skipped");
    }

    if params.include_archive_list {
        let argv = vec![
            "borg".to_string(),
            "list".to_string(),
            "--short".to_string(),
            credentials.repository_path.clone(),
        ];
        let mut count = 0u64;
        let handle = ctx.system.executor().spawn(&argv, &env, None);
        if let Ok(handle) = handle {
            let exit = ctx
                .system
                .executor()
                .monitor(
                    handle,
                    |stream, _line| {
                        if stream == OutputStream::Stdout {
                            count += 1;
                        }
                    },
                    ctx.cancel,
                    ctx.monitor_options(),
                )
                .await;
            if exit.success() {
                ctx.sink
                    .emit_meta(&format!("Repository holds {count} archives"));
            }
        }
    }

    TaskResult::ok(None)
}
