//! Catalog sync service façade.
//!
//! Assembles the engine from a [`CoreConfig`]: opens the catalog pool (running
//! migrations), builds the SQLite repositories, the event bus and the
//! [`SyncOrchestrator`], and exposes the operations a host calls. Hosts
//! supply their own [`ClientRegistry`] or register connections on the
//! built-in in-memory one, then register one [`ProviderFactory`] per client
//! type.
//!
//! ```no_run
//! use core_runtime::config::CoreConfig;
//! use core_service::CatalogSyncService;
//!
//! # async fn run() -> core_service::Result<()> {
//! let config = CoreConfig::builder()
//!     .database_path("/var/lib/catalog/catalog.db")
//!     .build()?;
//! let service = CatalogSyncService::new(config, None).await?;
//! # let _ = service;
//! # Ok(())
//! # }
//! ```

pub mod error;

pub use error::{Result, ServiceError};

use std::sync::Arc;

use bridge_traits::time::Clock;
use core_catalog::db::{create_pool, DatabaseConfig};
use core_catalog::{
    CanonicalItem, CanonicalItemRepository, ClientId, ItemId, MediaKind,
    SqliteCanonicalItemRepository,
};
use core_runtime::config::{CoreConfig, DatabaseLocation};
use core_runtime::events::{EventBus, EventStream};
use core_sync::{
    ClientConnection, ClientRegistry, InMemoryClientRegistry, JobRun, JobRunId, JobSchedule,
    JobScheduleRepository, ProviderFactory, SqliteJobRunRepository, SqliteJobScheduleRepository,
    SyncConfig, SyncOrchestrator, SyncRequest, SyncTarget, UserId,
};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::info;

/// Number of canonical items stored per kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogSummary {
    pub counts: Vec<(MediaKind, i64)>,
}

impl CatalogSummary {
    pub fn count(&self, kind: MediaKind) -> i64 {
        self.counts
            .iter()
            .find(|(k, _)| *k == kind)
            .map_or(0, |(_, count)| *count)
    }

    pub fn total(&self) -> i64 {
        self.counts.iter().map(|(_, count)| count).sum()
    }
}

/// Handle to a fully wired catalog sync engine.
pub struct CatalogSyncService {
    config: CoreConfig,
    pool: SqlitePool,
    items: Arc<SqliteCanonicalItemRepository>,
    schedules: Arc<SqliteJobScheduleRepository>,
    builtin_registry: Option<Arc<InMemoryClientRegistry>>,
    event_bus: EventBus,
    orchestrator: SyncOrchestrator,
}

impl CatalogSyncService {
    /// Build the engine. With `registry` set to `None` the service owns an
    /// in-memory registry filled through [`CatalogSyncService::register_client`].
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or the database cannot be
    /// opened and migrated.
    pub async fn new(
        config: CoreConfig,
        registry: Option<Arc<dyn ClientRegistry>>,
    ) -> Result<Self> {
        config.validate()?;

        let db_config = match &config.database {
            DatabaseLocation::File(path) => {
                DatabaseConfig::new(path.clone()).max_connections(config.max_db_connections)
            }
            DatabaseLocation::InMemory => DatabaseConfig::in_memory(),
        };
        let pool = create_pool(db_config).await?;

        let items = Arc::new(SqliteCanonicalItemRepository::new(pool.clone()));
        let jobs = Arc::new(SqliteJobRunRepository::new(pool.clone()));
        let schedules = Arc::new(SqliteJobScheduleRepository::new(pool.clone()));
        let event_bus = EventBus::new(config.event_buffer_size);

        let (registry, builtin_registry) = match registry {
            Some(registry) => (registry, None),
            None => {
                let builtin = Arc::new(InMemoryClientRegistry::new());
                (builtin.clone() as Arc<dyn ClientRegistry>, Some(builtin))
            }
        };

        let orchestrator = SyncOrchestrator::new(
            SyncConfig::from(&config.sync),
            items.clone(),
            jobs,
            schedules.clone(),
            registry,
            event_bus.clone(),
            config.clock.clone(),
        );

        info!(
            database = ?config.database,
            host_registry = builtin_registry.is_none(),
            "Catalog sync service ready"
        );

        Ok(Self {
            config,
            pool,
            items,
            schedules,
            builtin_registry,
            event_bus,
            orchestrator,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    pub async fn register_provider_factory(&self, factory: Arc<dyn ProviderFactory>) {
        self.orchestrator.register_provider_factory(factory).await;
    }

    /// Add or replace a client on the built-in registry.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::CapabilityMissing`] when the host supplied its
    /// own registry, or [`ServiceError::Sync`] when the connection settings
    /// are invalid.
    pub fn register_client(&self, client_id: ClientId, connection: ClientConnection) -> Result<()> {
        let registry = self.builtin_registry.as_ref().ok_or_else(|| {
            ServiceError::CapabilityMissing {
                capability: "client_registry".to_string(),
                message: "clients are resolved by the host-supplied registry".to_string(),
            }
        })?;
        connection.config.validate()?;
        registry.insert(client_id, connection);
        Ok(())
    }

    /// Run a sync to completion. See [`SyncOrchestrator::run_sync`].
    pub async fn run_sync(
        &self,
        user_id: UserId,
        client_id: ClientId,
        media_type: &str,
    ) -> Result<JobRun> {
        let request = SyncRequest::new(user_id, client_id, media_type);
        Ok(self.orchestrator.run_sync(request).await?)
    }

    /// Start a sync in the background. See [`SyncOrchestrator::start_sync`].
    pub async fn start_sync(
        &self,
        user_id: UserId,
        client_id: ClientId,
        media_type: &str,
    ) -> Result<JobRunId> {
        let request = SyncRequest::new(user_id, client_id, media_type);
        Ok(self.orchestrator.start_sync(request).await?)
    }

    pub async fn cancel_sync(&self, job_id: JobRunId) -> Result<()> {
        Ok(self.orchestrator.cancel_sync(job_id).await?)
    }

    pub async fn get_status(&self, job_id: JobRunId) -> Result<JobRun> {
        Ok(self.orchestrator.get_status(job_id).await?)
    }

    pub async fn list_history(
        &self,
        user_id: UserId,
        client_id: ClientId,
        limit: usize,
    ) -> Result<Vec<JobRun>> {
        Ok(self
            .orchestrator
            .list_history(user_id, client_id, limit)
            .await?)
    }

    pub async fn is_sync_active(&self, target: SyncTarget) -> bool {
        self.orchestrator.is_sync_active(target).await
    }

    pub fn subscribe_events(&self) -> EventStream {
        EventStream::new(self.event_bus.subscribe())
    }

    /// Create or update the schedule for `target`. An existing schedule keeps
    /// its last run time.
    pub async fn schedule_sync(
        &self,
        target: SyncTarget,
        frequency_secs: u64,
    ) -> Result<JobSchedule> {
        let now = self.config.clock.unix_timestamp();
        self.schedules
            .upsert(&JobSchedule::new(target, frequency_secs, now))
            .await?;
        self.stored_schedule(target).await
    }

    pub async fn set_schedule_enabled(&self, target: SyncTarget, enabled: bool) -> Result<JobSchedule> {
        let mut schedule = self.stored_schedule(target).await?;
        schedule.enabled = enabled;
        schedule.updated_at = self.config.clock.unix_timestamp();
        self.schedules.upsert(&schedule).await?;
        Ok(schedule)
    }

    pub async fn schedule(&self, target: SyncTarget) -> Result<Option<JobSchedule>> {
        Ok(self.schedules.find(target).await?)
    }

    pub async fn start_due_syncs(&self) -> Result<Vec<JobRunId>> {
        Ok(self.orchestrator.start_due_syncs().await?)
    }

    pub async fn get_item(&self, id: ItemId) -> Result<Option<CanonicalItem>> {
        Ok(self.items.get_by_id(id).await?)
    }

    pub async fn list_items(&self, kind: MediaKind) -> Result<Vec<CanonicalItem>> {
        Ok(self.items.list_by_kind(kind).await?)
    }

    pub async fn find_by_source(
        &self,
        kind: MediaKind,
        client_id: ClientId,
        external_item_id: &str,
    ) -> Result<Option<CanonicalItem>> {
        Ok(self
            .items
            .find_by_source_link(kind, client_id, external_item_id)
            .await?)
    }

    pub async fn catalog_summary(&self) -> Result<CatalogSummary> {
        let mut counts = Vec::with_capacity(MediaKind::ALL.len());
        for kind in MediaKind::ALL {
            counts.push((kind, self.items.count_by_kind(kind).await?));
        }
        Ok(CatalogSummary { counts })
    }

    /// Close the pool. Background runs still in flight fail their next write.
    pub async fn shutdown(&self) {
        info!("Shutting down catalog sync service");
        self.pool.close().await;
    }

    async fn stored_schedule(&self, target: SyncTarget) -> Result<JobSchedule> {
        self.schedules.find(target).await?.ok_or_else(|| {
            ServiceError::Catalog(core_catalog::CatalogError::NotFound {
                entity_type: "JobSchedule".to_string(),
                id: target.to_string(),
            })
        })
    }
}
