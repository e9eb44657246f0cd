//! # System Context
//!
//! Explicit, statically wired dependencies shared by every component of the
//! engine. Constructed once at startup and passed around as `Arc`; there
//! are no registries or global singletons behind it.

use std::sync::Arc;

use tokio::sync::Semaphore;

use borgitory_shared::config::JobManagerConfig;
use borgitory_shared::database::DatabaseManager;
use borgitory_shared::paths::PathService;
use borgitory_shared::secrets::Encryptor;

use crate::executor::ProcessExecutor;
use crate::notifications::NotificationSender;
use crate::tasks::cloud_sync::CloudProviderRegistry;

/// Process-wide state owned by the job manager
#[derive(Debug)]
pub struct SystemContext {
    config: JobManagerConfig,
    database: Arc<DatabaseManager>,
    encryptor: Arc<dyn Encryptor>,
    notifier: Arc<dyn NotificationSender>,
    paths: PathService,
    executor: ProcessExecutor,
    cloud_registry: CloudProviderRegistry,
    cloud_permits: Arc<Semaphore>,
}

impl SystemContext {
    pub fn new(
        config: JobManagerConfig,
        database: Arc<DatabaseManager>,
        encryptor: Arc<dyn Encryptor>,
        notifier: Arc<dyn NotificationSender>,
        paths: PathService,
    ) -> Self {
        let cloud_permits = Arc::new(Semaphore::new(config.max_concurrent_cloud_uploads));
        Self {
            config,
            database,
            encryptor,
            notifier,
            paths,
            executor: ProcessExecutor::new(),
            cloud_registry: CloudProviderRegistry::with_default_providers(),
            cloud_permits,
        }
    }

    pub fn config(&self) -> &JobManagerConfig {
        &self.config
    }

    pub fn database(&self) -> &DatabaseManager {
        &self.database
    }

    pub fn encryptor(&self) -> &dyn Encryptor {
        self.encryptor.as_ref()
    }

    pub fn notifier(&self) -> &dyn NotificationSender {
        self.notifier.as_ref()
    }

    pub fn paths(&self) -> &PathService {
        &self.paths
    }

    pub fn executor(&self) -> &ProcessExecutor {
        &self.executor
    }

    pub fn cloud_registry(&self) -> &CloudProviderRegistry {
        &self.cloud_registry
    }

    /// Global bound on parallel cloud-sync executions
    pub fn cloud_permits(&self) -> &Arc<Semaphore> {
        &self.cloud_permits
    }
}
