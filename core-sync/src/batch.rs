//! # Batch Processor
//!
//! Reconciles a fetched collection of one media kind against the catalog.
//!
//! ## Workflow
//!
//! 1. Split the collection into chunks of [`MediaKind::batch_size`] items
//! 2. Per item, bounded by `max_concurrent`:
//!    - take the in-process identity lock for `(kind, client, external id)`
//!    - resolve against the catalog
//!    - on a match, take the lock of the matched item and resolve again, so
//!      two different external ids can never both claim the same item
//!    - merge and update on a match, create otherwise
//! 3. Report chunk progress through a [`ProgressSink`]
//!
//! ## Error Handling
//!
//! Item-level failures (no client-scoped id, kind mismatch, a failed lookup
//! or write) are logged and counted as skipped; the batch carries on.
//! Cancellation is checked before each item. Once observed, the items already
//! in flight finish and the batch returns [`SyncError::Cancelled`]. Each
//! item's create or update is one transaction, so nothing is half-applied.
//!
//! A season reported with number 0 is stored as season 1.

use crate::merge::merge_item;
use crate::resolver::{ClaimedKeys, IdentityResolver};
use crate::{Result, SyncError};
use async_trait::async_trait;
use bridge_traits::time::Clock;
use core_catalog::{
    CanonicalItemRepository, CatalogError, ClientId, InboundItem, ItemId, MediaKind, MediaPayload,
};
use futures::future::FutureExt;
use futures::stream::{self, StreamExt};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// What happened to one inbound item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Created(ItemId),
    Updated(ItemId),
    /// Matched an existing item that already held exactly this data
    Unchanged(ItemId),
    /// Item-level failure; the reason is the error text
    Skipped(String),
}

/// Aggregate result of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub skipped: u64,
    /// Client-scoped external item id -> surrogate key, for every item that
    /// was created, updated or unchanged
    pub ids: HashMap<String, ItemId>,
}

impl BatchReport {
    fn record(&mut self, key: Option<&str>, outcome: &ItemOutcome) {
        self.processed += 1;
        let id = match outcome {
            ItemOutcome::Created(id) => {
                self.created += 1;
                *id
            }
            ItemOutcome::Updated(id) => {
                self.updated += 1;
                *id
            }
            ItemOutcome::Unchanged(id) => {
                self.unchanged += 1;
                *id
            }
            ItemOutcome::Skipped(_) => {
                self.skipped += 1;
                return;
            }
        };
        if let Some(key) = key {
            self.ids.insert(key.to_string(), id);
        }
    }

    /// Surrogate key the given client-scoped id was reconciled to.
    pub fn id_for(&self, external_item_id: &str) -> Option<ItemId> {
        self.ids.get(external_item_id.trim()).copied()
    }
}

/// Progress of one batch after a chunk has been written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkProgress {
    pub kind: MediaKind,
    pub chunk_processed: u64,
    pub chunk_created: u64,
    pub chunk_updated: u64,
    pub chunk_skipped: u64,
    /// Items processed by this batch so far, including this chunk
    pub batch_processed: u64,
    pub batch_total: u64,
}

/// Receives chunk-granular progress. Reporting is best-effort; sinks log
/// their own failures instead of aborting the batch.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn chunk_completed(&self, progress: &ChunkProgress);
}

/// Sink that drops every report.
pub struct NoopProgress;

#[async_trait]
impl ProgressSink for NoopProgress {
    async fn chunk_completed(&self, _progress: &ChunkProgress) {}
}

/// Times an item is re-resolved after its match changed under it.
const MAX_RESOLVE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LockKey {
    Source(MediaKind, ClientId, String),
    Item(ItemId),
}

/// Async locks shared by every batch of an orchestrator.
///
/// Source locks keep two concurrent resolutions of the same
/// `(kind, client, external id)` from both concluding "no match". Item locks
/// serialize every merge into one canonical item. A task holding an item lock
/// never waits for a source lock, so taking them in that order cannot
/// deadlock.
#[derive(Default)]
pub struct IdentityLocks {
    locks: Mutex<HashMap<LockKey, Arc<AsyncMutex<()>>>>,
}

impl IdentityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(
        &self,
        kind: MediaKind,
        client_id: ClientId,
        external_item_id: &str,
    ) -> OwnedMutexGuard<()> {
        self.lock(LockKey::Source(kind, client_id, external_item_id.to_string()))
            .await
    }

    pub async fn acquire_item(&self, id: ItemId) -> OwnedMutexGuard<()> {
        self.lock(LockKey::Item(id)).await
    }

    async fn lock(&self, key: LockKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(key).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Drop locks nobody holds or waits for.
    pub fn prune(&self) {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct BatchProcessor {
    items: Arc<dyn CanonicalItemRepository>,
    resolver: IdentityResolver,
    locks: Arc<IdentityLocks>,
    clock: Arc<dyn Clock>,
    max_concurrent: usize,
}

impl BatchProcessor {
    pub fn new(
        items: Arc<dyn CanonicalItemRepository>,
        locks: Arc<IdentityLocks>,
        clock: Arc<dyn Clock>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            resolver: IdentityResolver::new(Arc::clone(&items)),
            items,
            locks,
            clock,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Reconcile `inbound`, all of kind `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Cancelled`] once `token` is observed cancelled.
    /// Item-level failures never fail the batch.
    #[instrument(skip(self, inbound, token, sink), fields(kind = %kind, total = inbound.len()))]
    pub async fn process(
        &self,
        kind: MediaKind,
        inbound: &[InboundItem],
        token: &CancellationToken,
        sink: &dyn ProgressSink,
    ) -> Result<BatchReport> {
        let claimed = ClaimedKeys::from_items(inbound);
        let batch_total = inbound.len() as u64;
        let mut report = BatchReport::default();

        for (index, chunk) in inbound.chunks(kind.batch_size()).enumerate() {
            debug!(chunk = index, size = chunk.len(), "Processing chunk");

            let pending: Vec<_> = chunk
                .iter()
                .map(|item| self.guarded_item(kind, item, &claimed, token).boxed())
                .collect();
            let results: Vec<(&InboundItem, Result<ItemOutcome>)> = stream::iter(pending)
                .buffer_unordered(self.max_concurrent)
                .collect()
                .await;

            let before = report.clone();
            let mut cancelled = false;
            let mut fatal = None;

            for (item, result) in results {
                let outcome = match result {
                    Ok(outcome) => outcome,
                    Err(SyncError::Cancelled) => {
                        cancelled = true;
                        continue;
                    }
                    Err(e) if e.is_item_level() => {
                        error!(
                            title = %item.title,
                            external_item_id = item.source_key().unwrap_or("<none>"),
                            error = %e,
                            "Skipping item"
                        );
                        ItemOutcome::Skipped(e.to_string())
                    }
                    Err(e) => {
                        fatal.get_or_insert(e);
                        continue;
                    }
                };
                report.record(item.source_key(), &outcome);
            }

            sink.chunk_completed(&ChunkProgress {
                kind,
                chunk_processed: report.processed - before.processed,
                chunk_created: report.created - before.created,
                chunk_updated: report.updated - before.updated,
                chunk_skipped: report.skipped - before.skipped,
                batch_processed: report.processed,
                batch_total,
            })
            .await;

            if let Some(e) = fatal {
                self.locks.prune();
                return Err(e);
            }
            if cancelled {
                info!(processed = report.processed, "Batch cancelled");
                self.locks.prune();
                return Err(SyncError::Cancelled);
            }
        }

        self.locks.prune();

        info!(
            processed = report.processed,
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            skipped = report.skipped,
            "Batch complete"
        );

        Ok(report)
    }

    async fn guarded_item<'a>(
        &self,
        kind: MediaKind,
        item: &'a InboundItem,
        claimed: &ClaimedKeys,
        token: &CancellationToken,
    ) -> (&'a InboundItem, Result<ItemOutcome>) {
        if token.is_cancelled() {
            return (item, Err(SyncError::Cancelled));
        }
        (item, self.process_item(kind, item, claimed).await)
    }

    async fn process_item(
        &self,
        kind: MediaKind,
        inbound: &InboundItem,
        claimed: &ClaimedKeys,
    ) -> Result<ItemOutcome> {
        if inbound.kind() != kind {
            return Err(SyncError::KindMismatch {
                expected: kind.to_string(),
                found: inbound.kind().to_string(),
            });
        }

        let coerced = coerce_season_number(inbound);
        let inbound: &InboundItem = &coerced;
        let key = inbound
            .source_key()
            .ok_or_else(|| SyncError::MissingSourceIdentifier {
                title: inbound.title.clone(),
            })?;

        let _guard = self.locks.acquire(kind, inbound.client_id, key).await;

        for attempt in 0..MAX_RESOLVE_ATTEMPTS {
            let Some(candidate) = self.resolver.resolve(inbound, claimed).await? else {
                return self.create(inbound).await;
            };

            let _item_guard = self.locks.acquire_item(candidate.item.id).await;
            // An earlier holder of the item lock may have linked it to another
            // of this client's ids; resolve again now that the item is ours.
            let resolution = match self.resolver.resolve(inbound, claimed).await? {
                Some(resolution) if resolution.item.id == candidate.item.id => resolution,
                Some(_) => {
                    debug!(external_item_id = key, attempt, "Match moved, resolving again");
                    continue;
                }
                None => return self.create(inbound).await,
            };

            let now = self.clock.unix_timestamp();
            let outcome = merge_item(&resolution.item, inbound, now)?;
            if !outcome.changed {
                return Ok(ItemOutcome::Unchanged(outcome.item.id));
            }
            self.items.update(&outcome.item).await?;
            debug!(item_id = %outcome.item.id, matched_by = ?resolution.matched_by, "Updated item");
            return Ok(ItemOutcome::Updated(outcome.item.id));
        }

        Err(SyncError::Catalog(CatalogError::Conflict(format!(
            "match for '{}' kept changing during reconciliation",
            key
        ))))
    }

    async fn create(&self, inbound: &InboundItem) -> Result<ItemOutcome> {
        let item = inbound
            .to_canonical(self.clock.unix_timestamp())
            .ok_or_else(|| SyncError::MissingSourceIdentifier {
                title: inbound.title.clone(),
            })?;
        self.items.create(&item).await?;
        debug!(item_id = %item.id, "Created item");
        Ok(ItemOutcome::Created(item.id))
    }
}

fn coerce_season_number(inbound: &InboundItem) -> Cow<'_, InboundItem> {
    match &inbound.payload {
        MediaPayload::Season(details) if details.season_number == 0 => {
            warn!(
                title = %inbound.title,
                external_item_id = inbound.source_key().unwrap_or("<none>"),
                "Season number 0 coerced to 1"
            );
            let mut coerced = inbound.clone();
            if let MediaPayload::Season(details) = &mut coerced.payload {
                details.season_number = 1;
            }
            Cow::Owned(coerced)
        }
        _ => Cow::Borrowed(inbound),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::time::ManualClock;
    use core_catalog::db::create_test_pool;
    use core_catalog::{MovieDetails, SeasonDetails, SqliteCanonicalItemRepository, TrackDetails};

    #[derive(Default)]
    struct RecordingSink {
        chunks: Mutex<Vec<ChunkProgress>>,
    }

    #[async_trait]
    impl ProgressSink for RecordingSink {
        async fn chunk_completed(&self, progress: &ChunkProgress) {
            self.chunks.lock().unwrap().push(progress.clone());
        }
    }

    async fn processor() -> (BatchProcessor, Arc<SqliteCanonicalItemRepository>, Arc<IdentityLocks>) {
        let repo = Arc::new(SqliteCanonicalItemRepository::new(
            create_test_pool().await.unwrap(),
        ));
        let locks = Arc::new(IdentityLocks::new());
        let processor = BatchProcessor::new(
            repo.clone(),
            locks.clone(),
            Arc::new(ManualClock::at_unix(1_000)),
            4,
        );
        (processor, repo, locks)
    }

    fn movie(key: &str, title: &str) -> InboundItem {
        InboundItem::new(
            ClientId(7),
            key,
            title,
            MediaPayload::Movie(MovieDetails::default()),
        )
    }

    #[tokio::test]
    async fn test_create_then_unchanged_then_updated() {
        let (processor, repo, _) = processor().await;
        let token = CancellationToken::new();
        let batch = vec![movie("a", "Alien"), movie("b", "Aliens")];

        let first = processor
            .process(MediaKind::Movie, &batch, &token, &NoopProgress)
            .await
            .unwrap();
        assert_eq!(first.created, 2);
        assert_eq!(first.ids.len(), 2);

        let second = processor
            .process(MediaKind::Movie, &batch, &token, &NoopProgress)
            .await
            .unwrap();
        assert_eq!(second.unchanged, 2);
        assert_eq!(second.created, 0);
        assert_eq!(second.ids, first.ids);

        let renamed = vec![movie("a", "Alien (1979)")];
        let third = processor
            .process(MediaKind::Movie, &renamed, &token, &NoopProgress)
            .await
            .unwrap();
        assert_eq!(third.updated, 1);
        assert_eq!(third.id_for("a"), first.id_for("a"));

        assert_eq!(repo.count_by_kind(MediaKind::Movie).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_items_without_source_id_are_skipped() {
        let (processor, repo, _) = processor().await;
        let mut nameless = movie("x", "Nameless");
        nameless.external_item_id = Some("   ".to_string());
        let batch = vec![movie("a", "Alien"), nameless];

        let report = processor
            .process(MediaKind::Movie, &batch, &CancellationToken::new(), &NoopProgress)
            .await
            .unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.created, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(repo.count_by_kind(MediaKind::Movie).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_wrong_kind_is_skipped() {
        let (processor, _, _) = processor().await;
        let track = InboundItem::new(
            ClientId(7),
            "t",
            "Song",
            MediaPayload::Track(TrackDetails::default()),
        );

        let report = processor
            .process(
                MediaKind::Movie,
                &[movie("a", "Alien"), track],
                &CancellationToken::new(),
                &NoopProgress,
            )
            .await
            .unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_duplicate_keys_in_one_batch_create_once() {
        let (processor, repo, locks) = processor().await;
        let batch = vec![movie("a", "Alien"), movie("a", "Alien")];

        let report = processor
            .process(MediaKind::Movie, &batch, &CancellationToken::new(), &NoopProgress)
            .await
            .unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.unchanged, 1);
        assert_eq!(repo.count_by_kind(MediaKind::Movie).await.unwrap(), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_progress_is_reported_per_chunk() {
        let (processor, _, _) = processor().await;
        let sink = RecordingSink::default();
        let batch: Vec<InboundItem> = (0..120)
            .map(|i| movie(&format!("m{}", i), &format!("Movie {}", i)))
            .collect();

        let report = processor
            .process(MediaKind::Movie, &batch, &CancellationToken::new(), &sink)
            .await
            .unwrap();
        assert_eq!(report.created, 120);

        let chunks = sink.chunks.lock().unwrap();
        let processed: Vec<u64> = chunks.iter().map(|c| c.batch_processed).collect();
        assert_eq!(processed, vec![50, 100, 120]);
        assert!(chunks.iter().all(|c| c.batch_total == 120));
        assert_eq!(chunks[2].chunk_created, 20);
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_batch() {
        let (processor, repo, _) = processor().await;
        let token = CancellationToken::new();
        token.cancel();

        let err = processor
            .process(MediaKind::Movie, &[movie("a", "Alien")], &token, &NoopProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
        assert_eq!(repo.count_by_kind(MediaKind::Movie).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_identity_locks_prune_idle_entries() {
        let locks = IdentityLocks::new();
        let held = locks.acquire(MediaKind::Movie, ClientId(1), "a").await;
        let held_item = locks.acquire_item(ItemId::new()).await;
        {
            let _released = locks.acquire(MediaKind::Movie, ClientId(1), "b").await;
            let _released_item = locks.acquire_item(ItemId::new()).await;
        }
        locks.prune();
        assert_eq!(locks.len(), 2);
        drop(held);
        drop(held_item);
        locks.prune();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_batch_runs_on_a_spawned_task() {
        let (processor, repo, _) = processor().await;
        let processor = Arc::new(processor);

        let task = tokio::spawn({
            let processor = Arc::clone(&processor);
            async move {
                let batch = vec![movie("a", "Alien"), movie("b", "Aliens")];
                let token = CancellationToken::new();
                processor
                    .process(MediaKind::Movie, &batch, &token, &NoopProgress)
                    .await
            }
        });

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.created, 2);
        assert_eq!(repo.count_by_kind(MediaKind::Movie).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_fallback_matches_keep_every_source_key() {
        let (processor, repo, locks) = processor().await;
        let existing = movie("k1", "Twin").with_year(2020).to_canonical(500).unwrap();
        repo.create(&existing).await.unwrap();

        // Both ids fall back to the same title/year match; only one may take it.
        let batch = vec![
            movie("k3", "Twin").with_year(2020),
            movie("k4", "Twin").with_year(2020),
        ];
        let report = processor
            .process(MediaKind::Movie, &batch, &CancellationToken::new(), &NoopProgress)
            .await
            .unwrap();

        assert_eq!(report.updated, 1);
        assert_eq!(report.created, 1);
        assert_eq!(report.skipped, 0);
        assert_ne!(report.id_for("k3"), report.id_for("k4"));
        assert_eq!(repo.count_by_kind(MediaKind::Movie).await.unwrap(), 2);
        for key in ["k3", "k4"] {
            let linked = repo
                .find_by_source_link(MediaKind::Movie, ClientId(7), key)
                .await
                .unwrap();
            assert_eq!(linked.map(|item| item.id), report.id_for(key), "{}", key);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_season_zero_is_stored_as_season_one() {
        let (processor, repo, _) = processor().await;
        let specials = InboundItem::new(
            ClientId(7),
            "s0",
            "Specials",
            MediaPayload::Season(SeasonDetails {
                season_number: 0,
                ..SeasonDetails::default()
            }),
        );

        let report = processor
            .process(
                MediaKind::Season,
                &[specials],
                &CancellationToken::new(),
                &NoopProgress,
            )
            .await
            .unwrap();
        assert_eq!(report.created, 1);

        let stored = repo
            .get_by_id(report.id_for("s0").unwrap())
            .await
            .unwrap()
            .unwrap();
        match stored.payload {
            MediaPayload::Season(details) => assert_eq!(details.season_number, 1),
            other => panic!("expected a season, got {:?}", other),
        }
    }
}
