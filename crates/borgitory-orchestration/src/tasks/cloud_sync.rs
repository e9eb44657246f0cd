//! # Cloud-Sync Task
//!
//! Pushes the repository to an off-site provider through the external sync
//! tool (rclone). Provider dispatch is a small registry keyed by the
//! provider tag, built at startup from a declarative table: each entry maps
//! config fields onto rclone remote options. Credentials are passed through
//! `RCLONE_CONFIG_*` environment variables for an ephemeral remote, never
//! on the argv. The provider config blob is decrypted at task start and
//! dropped when the task ends.

use std::collections::HashMap;

use serde_json::Value;
use tracing::info;
use zeroize::Zeroize;

use borgitory_shared::errors::{BorgitoryError, BorgitoryResult};
use borgitory_shared::types::CloudSyncParams;

use super::{missing_repository, TaskContext, TaskResult};

/// Ephemeral rclone remote name used by every invocation
const REMOTE: &str = "borgitory";

/// Declarative description of one provider
#[derive(Debug, Clone)]
pub struct ProviderSpec {
    /// rclone backend type (`s3`, `sftp`, `smb`)
    pub rclone_type: &'static str,
    /// `(config field, rclone option)` pairs copied into the remote
    pub options: &'static [(&'static str, &'static str)],
    /// Config fields that must be present
    pub required: &'static [&'static str],
    /// Config fields joined with `/` to form the remote path
    pub path_fields: &'static [&'static str],
}

/// One rclone invocation, ready to spawn
#[derive(Debug, Clone)]
pub struct RcloneInvocation {
    pub argv: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Provider-tag registry, built once at startup
#[derive(Debug, Clone)]
pub struct CloudProviderRegistry {
    providers: HashMap<&'static str, ProviderSpec>,
}

impl CloudProviderRegistry {
    pub fn with_default_providers() -> Self {
        let mut providers = HashMap::new();
        providers.insert(
            "s3",
            ProviderSpec {
                rclone_type: "s3",
                options: &[
                    ("access_key_id", "ACCESS_KEY_ID"),
                    ("secret_access_key", "SECRET_ACCESS_KEY"),
                    ("region", "REGION"),
                    ("endpoint", "ENDPOINT"),
                ],
                required: &["access_key_id", "secret_access_key", "bucket_name"],
                path_fields: &["bucket_name", "path_prefix"],
            },
        );
        providers.insert(
            "sftp",
            ProviderSpec {
                rclone_type: "sftp",
                options: &[
                    ("host", "HOST"),
                    ("port", "PORT"),
                    ("username", "USER"),
                    ("password", "PASS"),
                ],
                required: &["host", "username"],
                path_fields: &["remote_path"],
            },
        );
        providers.insert(
            "smb",
            ProviderSpec {
                rclone_type: "smb",
                options: &[
                    ("host", "HOST"),
                    ("username", "USER"),
                    ("password", "PASS"),
                    ("domain", "DOMAIN"),
                ],
                required: &["host", "username", "share_name"],
                path_fields: &["share_name", "remote_path"],
            },
        );
        Self { providers }
    }

    pub fn provider_tags(&self) -> Vec<&'static str> {
        let mut tags: Vec<_> = self.providers.keys().copied().collect();
        tags.sort_unstable();
        tags
    }

    /// Build the sync invocation for `provider` from its decrypted config
    pub fn build_sync(
        &self,
        provider: &str,
        config: &Value,
        repository_path: &str,
    ) -> BorgitoryResult<RcloneInvocation> {
        let spec = self.providers.get(provider).ok_or_else(|| {
            BorgitoryError::Validation(format!("unknown cloud provider: {provider}"))
        })?;

        for field in spec.required {
            if config.get(field).and_then(Value::as_str).is_none() {
                return Err(BorgitoryError::Validation(format!(
                    "provider {provider} config is missing required field {field}"
                )));
            }
        }

        let prefix = format!("RCLONE_CONFIG_{}", REMOTE.to_uppercase());
        let mut env = HashMap::new();
        env.insert(format!("{prefix}_TYPE"), spec.rclone_type.to_string());
        for (field, option) in spec.options {
            if let Some(value) = config.get(field) {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                env.insert(format!("{prefix}_{option}"), value);
            }
        }

        let path = spec
            .path_fields
            .iter()
            .filter_map(|f| config.get(f).and_then(Value::as_str))
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("/");

        let argv = vec![
            "rclone".to_string(),
            "sync".to_string(),
            repository_path.to_string(),
            format!("{REMOTE}:{path}"),
            "--stats".to_string(),
            "1s".to_string(),
            "--stats-one-line".to_string(),
        ];
        Ok(RcloneInvocation { argv, env })
    }
}

pub async fn run(params: &CloudSyncParams, ctx: &TaskContext<'_>) -> TaskResult {
    let Some(credentials) = ctx.repository else {
        return missing_repository();
    };

    let config_row = match ctx
        .system
        .database()
        .get_cloud_sync_config(params.config_id)
        .await
    {
        Ok(row) => row,
        Err(e) => return TaskResult::failed(None, e.to_string()),
    };
    if !config_row.enabled {
        ctx.sink
            .emit_meta(&format!("Cloud sync config '{}' is disabled, skipping", config_row.name));
        return TaskResult::ok(None);
    }

    // Decrypt the provider config into task-local memory
    let mut plaintext = match ctx.system.encryptor().decrypt(&config_row.provider_config_json) {
        Ok(bytes) => bytes,
        Err(e) => return TaskResult::failed(None, e.to_string()),
    };
    let provider_config: Value = match serde_json::from_slice(&plaintext) {
        Ok(value) => value,
        Err(e) => {
            plaintext.zeroize();
            return TaskResult::failed(None, format!("invalid provider config: {e}"));
        }
    };
    plaintext.zeroize();

    let invocation = match ctx.system.cloud_registry().build_sync(
        &config_row.provider,
        &provider_config,
        &credentials.repository_path,
    ) {
        Ok(invocation) => invocation,
        Err(e) => return TaskResult::failed(None, e.to_string()),
    };

    // Bound parallel uploads across all jobs
    let _permit = match ctx.system.cloud_permits().clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return TaskResult::failed(None, "upload limiter closed"),
    };

    info!(
        job_id = %ctx.job_id,
        provider = %config_row.provider,
        config = %config_row.name,
        "starting cloud sync"
    );
    let result = ctx
        .run_command(&invocation.argv, &invocation.env, ctx.monitor_options(), true)
        .await;

    if result.success {
        ctx.sink.emit_meta(&format!(
            "Repository synced to {} ({})",
            config_row.name, config_row.provider
        ));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registry_lists_default_providers() {
        let registry = CloudProviderRegistry::with_default_providers();
        assert_eq!(registry.provider_tags(), vec!["s3", "sftp", "smb"]);
    }

    #[test]
    fn test_s3_invocation_puts_secrets_in_env() {
        let registry = CloudProviderRegistry::with_default_providers();
        let config = json!({
            "access_key_id": "AKIA123",
            "secret_access_key": "shhh",
            "region": "eu-west-1",
            "bucket_name": "backups",
            "path_prefix": "host1"
        });
        let invocation = registry
            .build_sync("s3", &config, "/repos/main")
            .expect("s3 invocation");

        assert_eq!(invocation.argv[0..4], [
            "rclone".to_string(),
            "sync".to_string(),
            "/repos/main".to_string(),
            "borgitory:backups/host1".to_string(),
        ]);
        assert_eq!(
            invocation.env.get("RCLONE_CONFIG_BORGITORY_TYPE"),
            Some(&"s3".to_string())
        );
        assert_eq!(
            invocation.env.get("RCLONE_CONFIG_BORGITORY_SECRET_ACCESS_KEY"),
            Some(&"shhh".to_string())
        );
        assert!(invocation.argv.iter().all(|a| !a.contains("shhh")));
    }

    #[test]
    fn test_missing_required_field_is_validation_error() {
        let registry = CloudProviderRegistry::with_default_providers();
        let config = json!({ "access_key_id": "AKIA123" });
        let err = registry
            .build_sync("s3", &config, "/repos/main")
            .expect_err("incomplete config");
        assert!(matches!(err, BorgitoryError::Validation(_)));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let registry = CloudProviderRegistry::with_default_providers();
        let err = registry
            .build_sync("carrier-pigeon", &json!({}), "/repos/main")
            .expect_err("unknown provider");
        assert!(matches!(err, BorgitoryError::Validation(_)));
    }

    #[test]
    fn test_sftp_remote_path() {
        let registry = CloudProviderRegistry::with_default_providers();
        let config = json!({
            "host": "nas.local",
            "username": "backup",
            "password": "pw",
            "remote_path": "borg"
        });
        let invocation = registry
            .build_sync("sftp", &config, "/repos/main")
            .expect("sftp invocation");
        assert!(invocation.argv.contains(&"borgitory:borg".to_string()));
        assert_eq!(
            invocation.env.get("RCLONE_CONFIG_BORGITORY_USER"),
            Some(&"backup".to_string())
        );
    }
}
