//! Shared fixtures for the core-sync integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bridge_traits::error::{BridgeError, Result as BridgeResult};
use bridge_traits::time::ManualClock;
use core_catalog::db::create_test_pool;
use core_catalog::{
    CanonicalItem, CanonicalItemRepository, CatalogError, ClientId, EpisodeDetails, ExternalIds,
    IdentifierSource, InboundItem, ItemId, MediaKind, MediaPayload, MovieDetails, SeasonDetails,
    SeriesDetails, SqliteCanonicalItemRepository,
};
use core_runtime::events::EventBus;
use core_sync::{
    CatalogProvider, ClientConnection, ClientRegistry, ClientType, ConnectionConfig, FetchFilter,
    MediaClient, ProviderCapability, ProviderFactory, SeriesProvider, SqliteJobRunRepository,
    SqliteJobScheduleRepository, SyncConfig, SyncOrchestrator,
};
use mockall::mock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const START: i64 = 1_700_000_000;

// ============================================================================
// Client registry
// ============================================================================

mock! {
    pub Registry {}

    #[async_trait]
    impl ClientRegistry for Registry {
        async fn resolve(&self, client_id: ClientId) -> BridgeResult<Option<ClientConnection>>;
    }
}

pub fn connection(client_type: &str) -> ClientConnection {
    ClientConnection {
        client_type: ClientType::new(client_type),
        config: ConnectionConfig::new("http://media.local:8096", "api-key"),
    }
}

/// Registry that knows the given clients, all of type "fake".
pub fn registry_for(clients: &[i64]) -> MockRegistry {
    let known: HashSet<i64> = clients.iter().copied().collect();
    let mut registry = MockRegistry::new();
    registry.expect_resolve().returning(move |client_id| {
        Ok(known
            .contains(&client_id.0)
            .then(|| connection("fake")))
    });
    registry
}

// ============================================================================
// Providers
// ============================================================================

#[derive(Default)]
pub struct FakeCatalog {
    items: Mutex<Vec<InboundItem>>,
    hang: AtomicBool,
    pub fetches: AtomicUsize,
}

impl FakeCatalog {
    pub fn set_items(&self, items: Vec<InboundItem>) {
        *self.items.lock().unwrap() = items;
    }

    pub fn hang(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CatalogProvider for FakeCatalog {
    async fn fetch_all(
        &self,
        kind: MediaKind,
        _filter: &FetchFilter,
    ) -> BridgeResult<Vec<InboundItem>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(self
            .items
            .lock()
            .unwrap()
            .iter()
            .filter(|item| item.kind() == kind)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct FakeSeries {
    pub series: Mutex<Vec<InboundItem>>,
    pub seasons: Mutex<HashMap<String, Vec<InboundItem>>>,
    pub episodes: Mutex<HashMap<(String, u32), Vec<InboundItem>>>,
    pub broken_series: Mutex<HashSet<String>>,
    /// `(series, season number)` pairs episodes were requested for
    pub episode_queries: Mutex<Vec<(String, u32)>>,
}

#[async_trait]
impl SeriesProvider for FakeSeries {
    async fn fetch_all(&self, _filter: &FetchFilter) -> BridgeResult<Vec<InboundItem>> {
        Ok(self.series.lock().unwrap().clone())
    }

    async fn fetch_seasons(&self, external_series_id: &str) -> BridgeResult<Vec<InboundItem>> {
        if self.broken_series.lock().unwrap().contains(external_series_id) {
            return Err(BridgeError::OperationFailed("seasons endpoint returned 500".to_string()));
        }
        Ok(self
            .seasons
            .lock()
            .unwrap()
            .get(external_series_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_episodes(
        &self,
        external_series_id: &str,
        season_number: u32,
    ) -> BridgeResult<Vec<InboundItem>> {
        self.episode_queries
            .lock()
            .unwrap()
            .push((external_series_id.to_string(), season_number));
        Ok(self
            .episodes
            .lock()
            .unwrap()
            .get(&(external_series_id.to_string(), season_number))
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct FakeClient {
    pub catalog: Arc<FakeCatalog>,
    pub series: Arc<FakeSeries>,
}

impl MediaClient for FakeClient {
    fn capability(&self, kind: MediaKind) -> Option<ProviderCapability> {
        match kind {
            MediaKind::Series => Some(ProviderCapability::Series(self.series.clone())),
            MediaKind::Movie | MediaKind::Track => {
                Some(ProviderCapability::Catalog(self.catalog.clone()))
            }
            _ => None,
        }
    }
}

pub struct FakeFactory {
    pub client: Arc<FakeClient>,
}

impl ProviderFactory for FakeFactory {
    fn client_type(&self) -> ClientType {
        ClientType::new("fake")
    }

    fn connect(&self, _connection: &ClientConnection) -> core_sync::Result<Arc<dyn MediaClient>> {
        Ok(self.client.clone())
    }
}

// ============================================================================
// Catalog wrapper that fails selected writes
// ============================================================================

/// Delegates to SQLite but fails `create` for the listed titles.
pub struct FailingItems {
    pub inner: Arc<SqliteCanonicalItemRepository>,
    pub failing_titles: HashSet<String>,
}

#[async_trait]
impl CanonicalItemRepository for FailingItems {
    async fn find_by_source_link(
        &self,
        kind: MediaKind,
        client_id: ClientId,
        external_item_id: &str,
    ) -> core_catalog::Result<Option<CanonicalItem>> {
        self.inner
            .find_by_source_link(kind, client_id, external_item_id)
            .await
    }

    async fn find_all_by_external_identifier(
        &self,
        kind: MediaKind,
        source: IdentifierSource,
        value: &str,
    ) -> core_catalog::Result<Vec<CanonicalItem>> {
        self.inner
            .find_all_by_external_identifier(kind, source, value)
            .await
    }

    async fn find_by_title_year(
        &self,
        kind: MediaKind,
        client_id: ClientId,
        title: &str,
        year: Option<i32>,
    ) -> core_catalog::Result<Vec<CanonicalItem>> {
        self.inner
            .find_by_title_year(kind, client_id, title, year)
            .await
    }

    async fn create(&self, item: &CanonicalItem) -> core_catalog::Result<()> {
        if self.failing_titles.contains(&item.title) {
            return Err(CatalogError::Conflict(format!("refusing {}", item.title)));
        }
        self.inner.create(item).await
    }

    async fn update(&self, item: &CanonicalItem) -> core_catalog::Result<()> {
        self.inner.update(item).await
    }

    async fn get_by_id(&self, id: ItemId) -> core_catalog::Result<Option<CanonicalItem>> {
        self.inner.get_by_id(id).await
    }

    async fn list_by_kind(&self, kind: MediaKind) -> core_catalog::Result<Vec<CanonicalItem>> {
        self.inner.list_by_kind(kind).await
    }

    async fn count_by_kind(&self, kind: MediaKind) -> core_catalog::Result<i64> {
        self.inner.count_by_kind(kind).await
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub orchestrator: SyncOrchestrator,
    pub items: Arc<SqliteCanonicalItemRepository>,
    pub jobs: Arc<SqliteJobRunRepository>,
    pub schedules: Arc<SqliteJobScheduleRepository>,
    pub client: Arc<FakeClient>,
    pub bus: EventBus,
    pub clock: Arc<ManualClock>,
}

pub struct HarnessBuilder {
    registry: Arc<dyn ClientRegistry>,
    config: SyncConfig,
    failing_titles: HashSet<String>,
}

impl HarnessBuilder {
    pub fn new(registry: impl ClientRegistry + 'static) -> Self {
        Self {
            registry: Arc::new(registry),
            config: SyncConfig::default(),
            failing_titles: HashSet::new(),
        }
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn failing_titles(mut self, titles: &[&str]) -> Self {
        self.failing_titles = titles.iter().map(|t| t.to_string()).collect();
        self
    }

    pub async fn build(self) -> Harness {
        let pool = create_test_pool().await.unwrap();
        let items = Arc::new(SqliteCanonicalItemRepository::new(pool.clone()));
        let jobs = Arc::new(SqliteJobRunRepository::new(pool.clone()));
        let schedules = Arc::new(SqliteJobScheduleRepository::new(pool));
        let bus = EventBus::new(1024);
        let clock = Arc::new(ManualClock::at_unix(START));

        let catalog: Arc<dyn CanonicalItemRepository> = if self.failing_titles.is_empty() {
            items.clone()
        } else {
            Arc::new(FailingItems {
                inner: items.clone(),
                failing_titles: self.failing_titles,
            })
        };

        let orchestrator = SyncOrchestrator::new(
            self.config,
            catalog,
            jobs.clone(),
            schedules.clone(),
            self.registry,
            bus.clone(),
            clock.clone(),
        );

        let client = Arc::new(FakeClient::default());
        orchestrator
            .register_provider_factory(Arc::new(FakeFactory {
                client: client.clone(),
            }))
            .await;

        Harness {
            orchestrator,
            items,
            jobs,
            schedules,
            client,
            bus,
            clock,
        }
    }
}

// ============================================================================
// Inbound builders
// ============================================================================

pub fn movie(client: i64, key: &str, title: &str, year: i32) -> InboundItem {
    InboundItem::new(
        ClientId(client),
        key,
        title,
        MediaPayload::Movie(MovieDetails::default()),
    )
    .with_year(year)
}

pub fn movie_with_id(
    client: i64,
    key: &str,
    title: &str,
    year: i32,
    source: IdentifierSource,
    value: &str,
) -> InboundItem {
    movie(client, key, title, year).with_external_ids(ExternalIds::new().with(source, value))
}

pub fn series(client: i64, key: &str, title: &str) -> InboundItem {
    InboundItem::new(
        ClientId(client),
        key,
        title,
        MediaPayload::Series(SeriesDetails::default()),
    )
}

pub fn season(client: i64, key: &str, number: u32) -> InboundItem {
    InboundItem::new(
        ClientId(client),
        key,
        format!("Season {}", number),
        MediaPayload::Season(SeasonDetails {
            season_number: number,
            ..Default::default()
        }),
    )
}

pub fn episode(client: i64, key: &str, season_number: u32, number: u32) -> InboundItem {
    InboundItem::new(
        ClientId(client),
        key,
        format!("Episode {}", number),
        MediaPayload::Episode(EpisodeDetails {
            season_number,
            episode_number: Some(number),
            ..Default::default()
        }),
    )
}

/// Poll until the run reaches a terminal state.
pub async fn wait_for_terminal(harness: &Harness, job_id: core_sync::JobRunId) -> core_sync::JobRun {
    for _ in 0..200 {
        let job = harness.orchestrator.get_status(job_id).await.unwrap();
        if job.is_terminal() {
            return job;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    panic!("job {} never finished", job_id);
}
