//! # Sync Orchestrator
//!
//! Drives one job run per `(user, client, media kind)`.
//!
//! ## Workflow
//!
//! 1. Map the requested media type onto a [`SyncPlan`]
//! 2. Refuse the request if a run for the same target is active
//! 3. Create the job run, resolve the client and acquire a provider
//! 4. Fetch (progress 0 → 50)
//! 5. Reconcile in batches (progress 50 → 99); for series the order is
//!    episodes, seasons, series, then the hierarchy linker
//! 6. Finalize as `Completed` (progress 100) or `Failed`, stamp the schedule
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_sync::orchestrator::{SyncOrchestrator, SyncRequest};
//!
//! orchestrator.register_provider_factory(Arc::new(PlexFactory)).await;
//!
//! let run = orchestrator
//!     .run_sync(SyncRequest::new(UserId(1), ClientId(7), "movies"))
//!     .await?;
//! println!("{} items, status {}", run.processed_items, run.status);
//! ```
//!
//! Runs for different targets proceed concurrently; a whole run is bounded by
//! [`SyncConfig::sync_timeout_secs`] and can be cancelled with
//! [`SyncOrchestrator::cancel_sync`].

use crate::batch::{BatchProcessor, BatchReport, ChunkProgress, IdentityLocks, ProgressSink};
use crate::hierarchy::{HierarchyLinker, SeasonLink, SeriesLinkPlan};
use crate::job::{JobRun, JobRunId, JobRunMetadata, JobSchedule, JobStatus, SyncTarget, UserId};
use crate::provider::{
    CatalogProvider, ClientRegistry, ClientType, FetchFilter, ProviderCapability,
    ProviderFactory, SeriesProvider,
};
use crate::repository::{JobRunRepository, JobScheduleRepository};
use crate::{Result, SyncError};
use async_trait::async_trait;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::time::Clock;
use core_catalog::{
    CanonicalItemRepository, ClientId, InboundEpisode, InboundItem, InboundSeason, MediaKind,
    MediaPayload,
};
use core_runtime::config::SyncSettings;
use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Configuration for sync operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Wall-clock limit for one job run, in seconds
    pub sync_timeout_secs: u64,

    /// Items reconciled concurrently inside one chunk
    pub max_concurrent_items: usize,

    /// Passed through to every provider fetch
    pub fetch_filter: FetchFilter,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_timeout_secs: 3600, // 1 hour
            max_concurrent_items: 4,
            fetch_filter: FetchFilter::default(),
        }
    }
}

impl From<&SyncSettings> for SyncConfig {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            sync_timeout_secs: settings.sync_timeout_secs,
            max_concurrent_items: settings.max_concurrent_items,
            fetch_filter: FetchFilter::default(),
        }
    }
}

/// A request to sync one media type of one client for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub user_id: UserId,
    pub client_id: ClientId,
    /// Free-form media type name, e.g. "movies", "TV Shows", "music"
    pub media_type: String,
}

impl SyncRequest {
    pub fn new(user_id: UserId, client_id: ClientId, media_type: impl Into<String>) -> Self {
        Self {
            user_id,
            client_id,
            media_type: media_type.into(),
        }
    }
}

/// What a job run reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPlan {
    /// A flat listing of one kind
    Catalog(MediaKind),
    /// Series, their seasons and their episodes
    SeriesHierarchy,
}

impl SyncPlan {
    /// Kind the run is keyed and guarded by.
    pub fn root_kind(&self) -> MediaKind {
        match self {
            SyncPlan::Catalog(kind) => *kind,
            SyncPlan::SeriesHierarchy => MediaKind::Series,
        }
    }
}

fn normalize_media_type(media_type: &str) -> String {
    media_type
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Map a free-form media type name onto a plan.
///
/// # Errors
///
/// Returns [`SyncError::UnsupportedMediaType`] for names outside the table.
pub fn dispatch_media_type(media_type: &str) -> Result<SyncPlan> {
    let plan = match normalize_media_type(media_type).as_str() {
        "movie" | "movies" | "film" | "films" => SyncPlan::Catalog(MediaKind::Movie),
        "series" | "show" | "shows" | "tv" | "tvshow" | "tvshows" | "season" | "seasons"
        | "episode" | "episodes" => SyncPlan::SeriesHierarchy,
        "track" | "tracks" | "song" | "songs" | "music" => SyncPlan::Catalog(MediaKind::Track),
        "album" | "albums" => SyncPlan::Catalog(MediaKind::Album),
        "artist" | "artists" => SyncPlan::Catalog(MediaKind::Artist),
        _ => return Err(SyncError::UnsupportedMediaType(media_type.trim().to_string())),
    };
    Ok(plan)
}

/// Active sync tracking
#[derive(Debug, Clone)]
struct ActiveSync {
    job_id: JobRunId,
    cancellation_token: CancellationToken,
}

/// A run that passed the overlap guard and has a job record.
struct PreparedRun {
    job_id: JobRunId,
    target: SyncTarget,
    plan: SyncPlan,
    cancellation_token: CancellationToken,
}

enum Prepared {
    Ready(PreparedRun),
    /// The request could not be mapped to a plan; the run is already failed
    Rejected(JobRun),
}

/// One series of a fetch, in client-scoped ids.
struct SeriesTree {
    series_key: String,
    seasons: Vec<(Option<String>, Vec<String>)>,
}

/// Everything fetched for a series plan.
#[derive(Default)]
struct SeriesFetch {
    series: Vec<InboundItem>,
    seasons: Vec<InboundSeason>,
    episodes: Vec<InboundEpisode>,
    trees: Vec<SeriesTree>,
}

/// Main sync orchestrator
///
/// Cloning is cheap; clones share the active-run map, the identity locks and
/// the provider factories.
#[derive(Clone)]
pub struct SyncOrchestrator {
    config: SyncConfig,
    items: Arc<dyn CanonicalItemRepository>,
    jobs: Arc<dyn JobRunRepository>,
    schedules: Arc<dyn JobScheduleRepository>,
    registry: Arc<dyn ClientRegistry>,
    factories: Arc<RwLock<HashMap<ClientType, Arc<dyn ProviderFactory>>>>,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
    locks: Arc<IdentityLocks>,
    active_syncs: Arc<Mutex<HashMap<SyncTarget, ActiveSync>>>,
}

impl SyncOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SyncConfig,
        items: Arc<dyn CanonicalItemRepository>,
        jobs: Arc<dyn JobRunRepository>,
        schedules: Arc<dyn JobScheduleRepository>,
        registry: Arc<dyn ClientRegistry>,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            items,
            jobs,
            schedules,
            registry,
            factories: Arc::new(RwLock::new(HashMap::new())),
            event_bus,
            clock,
            locks: Arc::new(IdentityLocks::new()),
            active_syncs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Register the factory for its client type, replacing any previous one.
    pub async fn register_provider_factory(&self, factory: Arc<dyn ProviderFactory>) {
        let client_type = factory.client_type();
        info!(client_type = %client_type, "Registering provider factory");
        self.factories.write().await.insert(client_type, factory);
    }

    /// Run a sync to completion and return the finalized job run.
    ///
    /// Failures during the run are recorded on the returned run, not
    /// returned as errors.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SyncInProgress`] if a run for the same target is
    /// active, or an error if the job run itself cannot be stored.
    #[instrument(skip(self), fields(user_id = %request.user_id, client_id = %request.client_id, media_type = %request.media_type))]
    pub async fn run_sync(&self, request: SyncRequest) -> Result<JobRun> {
        match self.prepare(&request).await? {
            Prepared::Ready(run) => self.execute(run).await,
            Prepared::Rejected(job) => Ok(job),
        }
    }

    /// Start a sync in the background and return its job run id.
    ///
    /// # Errors
    ///
    /// Same as [`SyncOrchestrator::run_sync`].
    #[instrument(skip(self), fields(user_id = %request.user_id, client_id = %request.client_id, media_type = %request.media_type))]
    pub async fn start_sync(&self, request: SyncRequest) -> Result<JobRunId> {
        match self.prepare(&request).await? {
            Prepared::Rejected(job) => Ok(job.id),
            Prepared::Ready(run) => {
                let job_id = run.job_id;
                let orchestrator = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = orchestrator.execute(run).await {
                        error!("Sync task failed: {}", e);
                    }
                });
                info!(job_id = %job_id, "Started sync");
                Ok(job_id)
            }
        }
    }

    /// Cancel an active run. The run finalizes as `Failed` once the current
    /// items finish.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::JobNotFound`] if the run is not active.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn cancel_sync(&self, job_id: JobRunId) -> Result<()> {
        let active_sync = {
            let active_syncs = self.active_syncs.lock().await;
            active_syncs
                .values()
                .find(|sync| sync.job_id == job_id)
                .cloned()
        };

        match active_sync {
            Some(sync) => {
                sync.cancellation_token.cancel();
                info!("Cancellation requested for sync job {}", job_id);
                Ok(())
            }
            None => Err(SyncError::JobNotFound {
                job_id: job_id.to_string(),
            }),
        }
    }

    /// # Errors
    ///
    /// Returns [`SyncError::JobNotFound`] for an unknown id.
    pub async fn get_status(&self, job_id: JobRunId) -> Result<JobRun> {
        self.jobs
            .find_by_id(job_id)
            .await?
            .ok_or_else(|| SyncError::JobNotFound {
                job_id: job_id.to_string(),
            })
    }

    /// Runs for a user/client pair, most recent first.
    pub async fn list_history(
        &self,
        user_id: UserId,
        client_id: ClientId,
        limit: usize,
    ) -> Result<Vec<JobRun>> {
        self.jobs
            .history(user_id, client_id, limit.try_into().unwrap_or(u32::MAX))
            .await
    }

    pub async fn is_sync_active(&self, target: SyncTarget) -> bool {
        let active_syncs = self.active_syncs.lock().await;
        active_syncs.contains_key(&target)
    }

    /// Enabled schedules whose frequency has elapsed.
    pub async fn due_schedules(&self) -> Result<Vec<JobSchedule>> {
        let now = self.clock.unix_timestamp();
        Ok(self
            .schedules
            .list_enabled()
            .await?
            .into_iter()
            .filter(|schedule| schedule.is_due(now))
            .collect())
    }

    /// Start a background run for every due schedule whose target is idle.
    pub async fn start_due_syncs(&self) -> Result<Vec<JobRunId>> {
        let mut started = Vec::new();
        for schedule in self.due_schedules().await? {
            let request = SyncRequest::new(
                schedule.user_id,
                schedule.client_id,
                schedule.media_kind.as_str(),
            );
            match self.start_sync(request).await {
                Ok(job_id) => started.push(job_id),
                Err(SyncError::SyncInProgress { .. }) => {
                    debug!(sync_target = %schedule.target(), "Scheduled sync already running");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(started)
    }

    // ------------------------------------------------------------------------
    // Run lifecycle
    // ------------------------------------------------------------------------

    async fn prepare(&self, request: &SyncRequest) -> Result<Prepared> {
        let now = self.clock.unix_timestamp();

        let plan = match dispatch_media_type(&request.media_type) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(media_type = %request.media_type, "Rejecting unsupported media type");
                let job = JobRun::new(
                    JobRunMetadata {
                        user_id: request.user_id,
                        client_id: request.client_id,
                        media_kind: normalize_media_type(&request.media_type),
                        client_type: None,
                    },
                    now,
                );
                self.jobs.create(&job).await?;
                self.jobs
                    .complete(job.id, JobStatus::Failed, Some(&e.to_string()), now)
                    .await?;
                self.emit(SyncEvent::Failed {
                    job_id: job.id.to_string(),
                    message: e.to_string(),
                    items_processed: 0,
                    recoverable: e.is_recoverable(),
                });
                return Ok(Prepared::Rejected(self.get_status(job.id).await?));
            }
        };

        let target = SyncTarget {
            user_id: request.user_id,
            client_id: request.client_id,
            media_kind: plan.root_kind(),
        };
        let cancellation_token = CancellationToken::new();

        // Check and insert under one lock so two requests cannot both pass.
        let mut active_syncs = self.active_syncs.lock().await;
        if active_syncs.contains_key(&target) {
            return Err(SyncError::SyncInProgress {
                user_id: target.user_id.0,
                client_id: target.client_id.0,
                media_kind: target.media_kind.to_string(),
            });
        }

        let job = JobRun::new(
            JobRunMetadata {
                user_id: target.user_id,
                client_id: target.client_id,
                media_kind: target.media_kind.to_string(),
                client_type: None,
            },
            now,
        );
        self.jobs.create(&job).await?;

        active_syncs.insert(
            target,
            ActiveSync {
                job_id: job.id,
                cancellation_token: cancellation_token.clone(),
            },
        );

        Ok(Prepared::Ready(PreparedRun {
            job_id: job.id,
            target,
            plan,
            cancellation_token,
        }))
    }

    #[instrument(skip(self, run), fields(job_id = %run.job_id, sync_target = %run.target))]
    async fn execute(&self, run: PreparedRun) -> Result<JobRun> {
        let limit = self.config.sync_timeout_secs;

        let result = match timeout(Duration::from_secs(limit), self.drive(&run)).await {
            Ok(result) => result,
            Err(_) => {
                error!("Sync job {} timed out", run.job_id);
                run.cancellation_token.cancel();
                Err(SyncError::Timeout(limit))
            }
        };

        let finalized = self.finalize(&run, result).await;

        {
            let mut active_syncs = self.active_syncs.lock().await;
            if active_syncs
                .get(&run.target)
                .is_some_and(|sync| sync.job_id == run.job_id)
            {
                active_syncs.remove(&run.target);
            }
        }

        finalized
    }

    async fn drive(&self, run: &PreparedRun) -> Result<()> {
        let kind = run.target.media_kind;

        let connection = self
            .registry
            .resolve(run.target.client_id)
            .await
            .map_err(|e| SyncError::Provider(format!("Client registry failed: {}", e)))?
            .ok_or_else(|| {
                SyncError::ClientConfig(format!("client {} is not registered", run.target.client_id))
            })?;
        connection.config.validate()?;

        let factory = self
            .factories
            .read()
            .await
            .get(&connection.client_type)
            .cloned()
            .ok_or_else(|| SyncError::ProviderUnavailable {
                client_type: connection.client_type.to_string(),
                media_kind: kind.to_string(),
            })?;
        let client = factory.connect(&connection)?;

        let unavailable = || SyncError::ProviderUnavailable {
            client_type: connection.client_type.to_string(),
            media_kind: kind.to_string(),
        };
        let capability = client.capability(kind).ok_or_else(unavailable)?;

        let metadata = JobRunMetadata {
            user_id: run.target.user_id,
            client_id: run.target.client_id,
            media_kind: kind.to_string(),
            client_type: Some(connection.client_type.to_string()),
        };
        self.jobs
            .mark_running(run.job_id, &metadata, self.clock.unix_timestamp())
            .await?;
        self.emit(SyncEvent::Started {
            job_id: run.job_id.to_string(),
            user_id: run.target.user_id.0,
            client_id: run.target.client_id.0,
            media_kind: kind.to_string(),
        });
        self.jobs.update_progress(run.job_id, 0, "Fetching").await?;

        match (run.plan, capability) {
            (SyncPlan::Catalog(kind), ProviderCapability::Catalog(provider)) => {
                self.sync_catalog(run, kind, provider).await
            }
            (SyncPlan::SeriesHierarchy, ProviderCapability::Series(provider)) => {
                self.sync_series(run, provider).await
            }
            _ => Err(unavailable()),
        }
    }

    async fn sync_catalog(
        &self,
        run: &PreparedRun,
        kind: MediaKind,
        provider: Arc<dyn CatalogProvider>,
    ) -> Result<()> {
        let token = &run.cancellation_token;

        info!("Phase 1: Fetching {} from provider", kind);
        let inbound = cancellable(token, provider.fetch_all(kind, &self.config.fetch_filter)).await?;

        let total = inbound.len() as u64;
        self.fetched(run.job_id, total).await?;

        info!("Phase 2: Reconciling {} {} items", total, kind);
        let sink = self.progress_sink(run.job_id, kind.as_str(), 0, total);
        self.batch_processor()
            .process(kind, &inbound, token, &sink)
            .await?;

        Ok(())
    }

    async fn sync_series(&self, run: &PreparedRun, provider: Arc<dyn SeriesProvider>) -> Result<()> {
        let token = &run.cancellation_token;

        info!("Phase 1: Fetching series, seasons and episodes from provider");
        let fetch = self.fetch_series_tree(token, provider.as_ref()).await?;

        let episodes_total = fetch.episodes.len() as u64;
        let seasons_total = fetch.seasons.len() as u64;
        let total = episodes_total + seasons_total + fetch.series.len() as u64;
        self.fetched(run.job_id, total).await?;

        info!(
            series = fetch.series.len(),
            seasons = seasons_total,
            episodes = episodes_total,
            "Phase 2: Reconciling series hierarchy bottom-up"
        );
        let processor = self.batch_processor();

        let sink = self.progress_sink(run.job_id, "episodes", 0, total);
        let episodes = processor
            .process(MediaKind::Episode, &fetch.episodes, token, &sink)
            .await?;

        let sink = self.progress_sink(run.job_id, "seasons", episodes_total, total);
        let seasons = processor
            .process(MediaKind::Season, &fetch.seasons, token, &sink)
            .await?;

        let sink = self.progress_sink(run.job_id, "series", episodes_total + seasons_total, total);
        let series = processor
            .process(MediaKind::Series, &fetch.series, token, &sink)
            .await?;

        info!("Phase 3: Linking {} series trees", fetch.trees.len());
        self.link_trees(token, &fetch.trees, &series, &seasons, &episodes)
            .await
    }

    async fn fetch_series_tree(
        &self,
        token: &CancellationToken,
        provider: &dyn SeriesProvider,
    ) -> Result<SeriesFetch> {
        let mut fetch = SeriesFetch {
            series: cancellable(token, provider.fetch_all(&self.config.fetch_filter)).await?,
            ..Default::default()
        };

        for series in &fetch.series {
            // Without its own id a series cannot be asked for children; the
            // batch skips it.
            let Some(series_key) = series.source_key() else {
                continue;
            };

            match fetch_children(token, provider, series_key).await {
                Ok((seasons, episodes, tree)) => {
                    fetch.seasons.extend(seasons);
                    fetch.episodes.extend(episodes);
                    fetch.trees.push(tree);
                }
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(e) => {
                    warn!(
                        series = %series.title,
                        external_item_id = series_key,
                        error = %e,
                        "Failed to fetch seasons or episodes, skipping this series' children"
                    );
                    fetch.trees.push(SeriesTree {
                        series_key: series_key.to_string(),
                        seasons: Vec::new(),
                    });
                }
            }
        }

        Ok(fetch)
    }

    async fn link_trees(
        &self,
        token: &CancellationToken,
        trees: &[SeriesTree],
        series: &BatchReport,
        seasons: &BatchReport,
        episodes: &BatchReport,
    ) -> Result<()> {
        let linker = HierarchyLinker::new(
            Arc::clone(&self.items),
            self.event_bus.clone(),
            Arc::clone(&self.clock),
        );

        for tree in trees {
            if token.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let Some(series_id) = series.id_for(&tree.series_key) else {
                debug!(external_item_id = %tree.series_key, "Series was skipped, not linking");
                continue;
            };

            let plan = SeriesLinkPlan {
                series_id,
                seasons: tree
                    .seasons
                    .iter()
                    .filter_map(|(season_key, episode_keys)| {
                        let season_id = seasons.id_for(season_key.as_deref()?)?;
                        Some(SeasonLink {
                            season_id,
                            episode_ids: episode_keys
                                .iter()
                                .filter_map(|key| episodes.id_for(key))
                                .collect(),
                        })
                    })
                    .collect(),
            };

            match linker.link(&plan).await {
                Ok(_) => {}
                Err(e) if e.is_item_level() => {
                    error!(series_id = %series_id, error = %e, "Failed to link series hierarchy");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    async fn fetched(&self, job_id: JobRunId, total: u64) -> Result<()> {
        self.jobs.set_total_items(job_id, total).await?;
        self.jobs
            .update_progress(job_id, 50, &format!("Fetched {} items", total))
            .await?;
        self.emit(SyncEvent::Progress {
            job_id: job_id.to_string(),
            items_processed: 0,
            total_items: Some(total),
            percent: 50,
            phase: "fetched".to_string(),
        });
        Ok(())
    }

    async fn finalize(&self, run: &PreparedRun, result: Result<()>) -> Result<JobRun> {
        let now = self.clock.unix_timestamp();

        match &result {
            Ok(()) => {
                self.jobs
                    .complete(run.job_id, JobStatus::Completed, None, now)
                    .await?;
            }
            Err(e) => {
                error!("Sync job {} failed: {}", run.job_id, e);
                self.jobs
                    .complete(run.job_id, JobStatus::Failed, Some(&e.to_string()), now)
                    .await?;
            }
        }

        let job = self.get_status(run.job_id).await?;

        match result {
            Ok(()) => {
                info!(
                    processed = job.processed_items,
                    created = job.created_items,
                    updated = job.updated_items,
                    skipped = job.skipped_items,
                    "Sync job {} completed successfully",
                    run.job_id
                );
                self.emit(SyncEvent::Completed {
                    job_id: job.id.to_string(),
                    items_processed: job.processed_items,
                    items_created: job.created_items,
                    items_updated: job.updated_items,
                    items_skipped: job.skipped_items,
                    duration_secs: job.duration_secs().unwrap_or(0),
                });
            }
            Err(e) => {
                self.emit(SyncEvent::Failed {
                    job_id: job.id.to_string(),
                    message: e.to_string(),
                    items_processed: job.processed_items,
                    recoverable: e.is_recoverable(),
                });
            }
        }

        match self.schedules.stamp_last_run(run.target, now).await {
            Ok(true) => debug!(sync_target = %run.target, "Stamped schedule"),
            Ok(false) => {}
            Err(e) => warn!(sync_target = %run.target, error = %e, "Failed to stamp schedule"),
        }

        Ok(job)
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn batch_processor(&self) -> BatchProcessor {
        BatchProcessor::new(
            Arc::clone(&self.items),
            Arc::clone(&self.locks),
            Arc::clone(&self.clock),
            self.config.max_concurrent_items,
        )
    }

    fn progress_sink(&self, job_id: JobRunId, phase: &str, offset: u64, total: u64) -> JobProgressSink {
        JobProgressSink {
            jobs: Arc::clone(&self.jobs),
            event_bus: self.event_bus.clone(),
            job_id,
            phase: phase.to_string(),
            offset,
            total,
        }
    }

    fn emit(&self, event: SyncEvent) {
        self.event_bus.emit(CoreEvent::Sync(event)).ok();
    }
}

/// Run a provider call unless the token fires first.
async fn cancellable<T>(
    token: &CancellationToken,
    call: impl Future<Output = BridgeResult<T>>,
) -> Result<T> {
    tokio::select! {
        _ = token.cancelled() => Err(SyncError::Cancelled),
        result = call => result.map_err(SyncError::from),
    }
}

/// Seasons and episodes of one series. Season number 0 is coerced to 1 and
/// its episodes inherit the coerced number; the provider is still asked with
/// its own number.
async fn fetch_children(
    token: &CancellationToken,
    provider: &dyn SeriesProvider,
    series_key: &str,
) -> Result<(Vec<InboundSeason>, Vec<InboundEpisode>, SeriesTree)> {
    let mut seasons = cancellable(token, provider.fetch_seasons(series_key)).await?;
    let mut episodes = Vec::new();
    let mut tree = SeriesTree {
        series_key: series_key.to_string(),
        seasons: Vec::with_capacity(seasons.len()),
    };

    for season in &mut seasons {
        let MediaPayload::Season(details) = &mut season.payload else {
            continue;
        };

        let reported = details.season_number;
        if reported == 0 {
            warn!(
                series = series_key,
                season = %season.title,
                "Season reported number 0, storing as 1"
            );
            details.season_number = 1;
        }
        let season_number = details.season_number;

        let mut season_episodes =
            cancellable(token, provider.fetch_episodes(series_key, reported)).await?;
        for episode in &mut season_episodes {
            if let MediaPayload::Episode(details) = &mut episode.payload {
                details.season_number = season_number;
            }
        }

        tree.seasons.push((
            season.source_key().map(str::to_string),
            season_episodes
                .iter()
                .filter_map(|episode| episode.source_key().map(str::to_string))
                .collect(),
        ));
        episodes.extend(season_episodes);
    }

    Ok((seasons, episodes, tree))
}

/// Writes chunk progress into the job run and onto the event bus.
///
/// `offset` places this batch inside a run that reconciles several kinds
/// against one combined total.
struct JobProgressSink {
    jobs: Arc<dyn JobRunRepository>,
    event_bus: EventBus,
    job_id: JobRunId,
    phase: String,
    offset: u64,
    total: u64,
}

/// Batch-phase progress: 50 after the fetch, approaching but never reaching
/// 100 before finalization.
fn batch_percent(processed: u64, total: u64) -> u8 {
    if total == 0 {
        return 99;
    }
    (50 + 50 * processed.min(total) / total).min(99) as u8
}

#[async_trait]
impl ProgressSink for JobProgressSink {
    async fn chunk_completed(&self, progress: &ChunkProgress) {
        let processed = self.offset + progress.batch_processed;
        let percent = batch_percent(processed, self.total);

        if let Err(e) = self
            .jobs
            .increment_processed(self.job_id, progress.chunk_processed)
            .await
        {
            warn!(job_id = %self.job_id, error = %e, "Failed to record processed items");
        }
        if let Err(e) = self
            .jobs
            .record_outcomes(
                self.job_id,
                progress.chunk_created,
                progress.chunk_updated,
                progress.chunk_skipped,
            )
            .await
        {
            warn!(job_id = %self.job_id, error = %e, "Failed to record item outcomes");
        }
        if let Err(e) = self
            .jobs
            .update_progress(
                self.job_id,
                percent,
                &format!("Reconciling {}: {}/{}", self.phase, processed, self.total),
            )
            .await
        {
            warn!(job_id = %self.job_id, error = %e, "Failed to update progress");
        }

        self.event_bus
            .emit(CoreEvent::Sync(SyncEvent::Progress {
                job_id: self.job_id.to_string(),
                items_processed: processed,
                total_items: Some(self.total),
                percent,
                phase: self.phase.clone(),
            }))
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_table() {
        for name in ["movie", "Movies", "film", "FILMS"] {
            assert_eq!(
                dispatch_media_type(name).unwrap(),
                SyncPlan::Catalog(MediaKind::Movie)
            );
        }
        for name in [
            "series", "show", "Shows", "tv", "TV Show", "tv-shows", "tv_shows", "season",
            "seasons", "episode", "Episodes",
        ] {
            assert_eq!(dispatch_media_type(name).unwrap(), SyncPlan::SeriesHierarchy);
        }
        for name in ["track", "tracks", "song", "Songs", "music"] {
            assert_eq!(
                dispatch_media_type(name).unwrap(),
                SyncPlan::Catalog(MediaKind::Track)
            );
        }
        assert_eq!(
            dispatch_media_type("albums").unwrap(),
            SyncPlan::Catalog(MediaKind::Album)
        );
        assert_eq!(
            dispatch_media_type("Artist").unwrap(),
            SyncPlan::Catalog(MediaKind::Artist)
        );
    }

    #[test]
    fn test_dispatch_rejects_unknown_types() {
        for name in ["", "podcasts", "books", "photo"] {
            assert!(matches!(
                dispatch_media_type(name),
                Err(SyncError::UnsupportedMediaType(_))
            ));
        }
    }

    #[test]
    fn test_root_kind() {
        assert_eq!(SyncPlan::SeriesHierarchy.root_kind(), MediaKind::Series);
        assert_eq!(
            SyncPlan::Catalog(MediaKind::Album).root_kind(),
            MediaKind::Album
        );
    }

    #[test]
    fn test_sync_config_from_settings() {
        let settings = SyncSettings {
            sync_timeout_secs: 60,
            max_concurrent_items: 2,
        };
        let config = SyncConfig::from(&settings);
        assert_eq!(config.sync_timeout_secs, 60);
        assert_eq!(config.max_concurrent_items, 2);
        assert_eq!(SyncConfig::default().sync_timeout_secs, 3600);
    }

    #[test]
    fn test_batch_percent_bounds() {
        assert_eq!(batch_percent(0, 0), 99);
        assert_eq!(batch_percent(0, 100), 50);
        assert_eq!(batch_percent(50, 100), 75);
        assert_eq!(batch_percent(100, 100), 99);
        assert_eq!(batch_percent(500, 100), 99);
    }
}
