// ABOUTME: Wires stores, caches, dispatcher, orchestrator and scheduler from config
// ABOUTME: One Engine per process; the CLI and the admin server share it

use std::sync::Arc;

use sync_store::{SqliteStore, SubscriberStore};

use crate::admin::{AdminService, HealthThresholds};
use crate::cache::{CacheRegistry, CachedSubscriberStore};
use crate::config::SyncConfig;
use crate::dispatcher::{NotificationDispatcher, WebhookClient};
use crate::error::Result;
use crate::mirror::FileMirror;
use crate::orchestrator::{OrchestratorConfig, SyncOrchestrator};
use crate::resolution::ConflictResolutionService;
use crate::scheduler::SyncScheduler;

/// Cache that fronts the canonical subscriber store, keyed by entity id.
pub const CANONICAL_CACHE: &str = "canonical-subscribers";

pub struct Engine {
    pub store: Arc<SqliteStore>,
    pub caches: Arc<CacheRegistry>,
    pub scheduler: Arc<SyncScheduler>,
    pub admin: Arc<AdminService>,
}

impl Engine {
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(SqliteStore::open(&config.database_path)?);
        tracing::debug!("Opened sync store at {}", config.database_path.display());
        Self::with_store(config, store)
    }

    /// Build around an already-open store (tests use an in-memory one).
    pub fn with_store(config: &SyncConfig, store: Arc<SqliteStore>) -> Result<Self> {
        let mut cache_names: Vec<String> = config.caches.iter().map(|c| c.name.clone()).collect();
        cache_names.push(CANONICAL_CACHE.to_string());
        let caches = Arc::new(CacheRegistry::new(cache_names));

        let subscribers: Arc<dyn SubscriberStore> = Arc::new(CachedSubscriberStore::new(
            store.clone(),
            caches.clone(),
            CANONICAL_CACHE,
        ));

        let webhooks = WebhookClient::new(config.webhooks.clone())?;
        let dispatcher = Arc::new(NotificationDispatcher::new(
            config.caches.clone(),
            caches.clone(),
            webhooks,
        ));

        let mut orchestrator = SyncOrchestrator::new(
            store.clone(),
            store.clone(),
            subscribers.clone(),
            dispatcher.clone(),
            OrchestratorConfig {
                max_attempts: config.max_attempts,
                worker_lanes: config.worker_lanes,
            },
        );
        if let Some(path) = &config.mirror_path {
            tracing::info!("Using {} as the conflict mirror", path.display());
            orchestrator = orchestrator.with_mirror(Arc::new(FileMirror::new(path)));
        }

        let scheduler = Arc::new(SyncScheduler::new(
            Arc::new(orchestrator),
            config.poll_interval(),
            config.batch_size,
        ));

        let admin = Arc::new(AdminService::new(
            scheduler.clone(),
            store.clone(),
            store.clone(),
            ConflictResolutionService::new(store.clone(), subscribers),
            dispatcher,
            HealthThresholds {
                max_unprocessed: config.healthy_max_unprocessed,
                max_lag: std::time::Duration::from_secs(config.healthy_max_lag_secs),
                stuck_after: config.stuck_after(),
            },
        ));

        Ok(Self {
            store,
            caches,
            scheduler,
            admin,
        })
    }
}
