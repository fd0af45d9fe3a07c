pub mod error;
pub mod external;
pub mod graph;
pub mod models;
pub mod notify;
pub mod providers;
pub mod services;
pub mod storage;
pub mod taskid;

pub use error::{Error, Result};
pub use models::*;

use std::sync::Arc;

use external::ObjectStore;
use notify::NotificationHub;
use providers::{ProviderRegistry, RetryConfig};
use services::AbilityTaskService;
use storage::Storage;
use tracing::info;

/// Core application state shared between the server and embedded modes.
pub struct AppCore {
    pub storage: Arc<Storage>,
    pub tasks: Arc<AbilityTaskService>,
    pub hub: Arc<NotificationHub>,
}

impl AppCore {
    pub async fn new(db_path: &str, object_store: Arc<dyn ObjectStore>) -> anyhow::Result<Self> {
        let storage = Arc::new(Storage::new(db_path)?);
        let config = storage.config.get_config()?.unwrap_or_default();
        config.validate()?;

        info!(workers = config.worker_count, "initializing abilityflow");

        let retry = RetryConfig::from_system(&config);
        let providers = Arc::new(ProviderRegistry::with_defaults(object_store, retry));
        let hub = Arc::new(NotificationHub::new(config.event_replay_capacity));

        let tasks = Arc::new(AbilityTaskService::new(
            storage.clone(),
            providers,
            hub.clone(),
            config,
        ));

        // Reconcile orphans before admitting new work.
        let resumed = tasks.resume_unfinished_on_startup().await?;
        if resumed > 0 {
            info!(resumed, "reconciled unfinished tasks from previous run");
        }
        tasks.start().await;

        Ok(Self { storage, tasks, hub })
    }
}
