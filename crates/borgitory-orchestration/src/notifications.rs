//! # Notification Seam
//!
//! Delivery transports (push services, chat webhooks) live outside the
//! core; the notification task talks to them through this trait. The
//! provider config blob arrives decrypted, as JSON, scoped to the one
//! delivery.

use async_trait::async_trait;
use tracing::info;

use borgitory_shared::errors::BorgitoryResult;

/// Outbound notification transport
#[async_trait]
pub trait NotificationSender: Send + Sync + std::fmt::Debug {
    async fn send(
        &self,
        provider: &str,
        provider_config: &serde_json::Value,
        title: &str,
        body: &str,
    ) -> BorgitoryResult<()>;
}

/// Log-only sender used when no transport is wired in (and in tests)
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotificationSender;

#[async_trait]
impl NotificationSender for LoggingNotificationSender {
    async fn send(
        &self,
        provider: &str,
        _provider_config: &serde_json::Value,
        title: &str,
        body: &str,
    ) -> BorgitoryResult<()> {
        info!(provider, title, body, "notification delivered to log sink");
        Ok(())
    }
}
