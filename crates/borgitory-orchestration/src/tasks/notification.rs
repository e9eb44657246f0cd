//! Notification task: renders a message from the statuses of preceding
//! tasks and hands it to the injected transport. A failed delivery is
//! logged and fails the job only when the task's continue-on-failure is
//! off.

use tracing::{info, warn};
use zeroize::Zeroize;

use borgitory_shared::types::{NotificationParams, TaskStatus};

use super::{TaskContext, TaskResult};

/// Expand `{job_status}` and `{failed_tasks}` from preceding task statuses
pub fn render_message(template: &str, preceding: &[(String, TaskStatus)]) -> String {
    let failed: Vec<&str> = preceding
        .iter()
        .filter(|(_, status)| *status == TaskStatus::Failed)
        .map(|(name, _)| name.as_str())
        .collect();
    let job_status = if failed.is_empty() { "completed" } else { "failed" };
    let failed_tasks = if failed.is_empty() {
        "none".to_string()
    } else {
        failed.join(", ")
    };
    template
        .replace("{job_status}", job_status)
        .replace("{failed_tasks}", &failed_tasks)
}

pub async fn run(params: &NotificationParams, ctx: &TaskContext<'_>) -> TaskResult {
    let config_row = match ctx
        .system
        .database()
        .get_notification_config(params.config_id)
        .await
    {
        Ok(row) => row,
        Err(e) => return TaskResult::failed(None, e.to_string()),
    };
    if !config_row.enabled {
        ctx.sink.emit_meta(&format!(
            "Notification config '{}' is disabled, skipping",
            config_row.name
        ));
        return TaskResult::ok(None);
    }

    let mut plaintext = match ctx.system.encryptor().decrypt(&config_row.provider_config_json) {
        Ok(bytes) => bytes,
        Err(e) => return TaskResult::failed(None, e.to_string()),
    };
    let provider_config: serde_json::Value = match serde_json::from_slice(&plaintext) {
        Ok(value) => value,
        Err(e) => {
            plaintext.zeroize();
            return TaskResult::failed(None, format!("invalid provider config: {e}"));
        }
    };
    plaintext.zeroize();

    let body = render_message(&params.message_template, ctx.preceding);
    info!(job_id = %ctx.job_id, provider = %config_row.provider, "sending notification");

    match ctx
        .system
        .notifier()
        .send(&config_row.provider, &provider_config, &params.title, &body)
        .await
    {
        Ok(()) => {
            ctx.sink
                .emit_meta(&format!("Notification sent via {}", config_row.provider));
            TaskResult::ok(None)
        }
        Err(e) => {
            warn!(job_id = %ctx.job_id, error = %e, "notification delivery failed");
            ctx.sink
                .emit_meta(&format!("Notification delivery failed: {e}"));
            TaskResult::failed(None, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_all_completed() {
        let preceding = vec![
            ("pre-hook".to_string(), TaskStatus::Completed),
            ("backup".to_string(), TaskStatus::Completed),
        ];
        let body = render_message("Backup {job_status}; failed: {failed_tasks}", &preceding);
        assert_eq!(body, "Backup completed; failed: none");
    }

    #[test]
    fn test_render_with_failures() {
        let preceding = vec![
            ("backup".to_string(), TaskStatus::Completed),
            ("prune".to_string(), TaskStatus::Failed),
            ("check".to_string(), TaskStatus::Failed),
        ];
        let body = render_message("{job_status}: {failed_tasks}", &preceding);
        assert_eq!(body, "failed: prune, check");
    }
}
