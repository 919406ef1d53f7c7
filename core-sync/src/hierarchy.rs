//! # Hierarchy Linker
//!
//! Runs after episodes, seasons and series of one fetch have been reconciled
//! and back-propagates surrogate keys through the tree:
//!
//! - each episode gets its series id, season id and season number
//! - each season gets its series id and the union of its episode ids
//! - the series gets one season entry per season number
//!
//! Every update is an explicit read-modify-write against the repository and
//! a record is only rewritten when its linkage actually changed. A referenced
//! record that cannot be found, read or written is logged and that one
//! relation is skipped; the rest of the tree is still linked.

use crate::Result;
use bridge_traits::time::Clock;
use core_catalog::{CanonicalItem, CanonicalItemRepository, ItemId, MediaPayload, SeasonEntry};
use core_runtime::events::{CatalogEvent, CoreEvent, EventBus};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// One season of a series tree together with its reconciled episodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeasonLink {
    pub season_id: ItemId,
    pub episode_ids: Vec<ItemId>,
}

/// A reconciled series tree, expressed in surrogate keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesLinkPlan {
    pub series_id: ItemId,
    pub seasons: Vec<SeasonLink>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkReport {
    pub seasons_linked: u64,
    pub episodes_linked: u64,
    /// Records that were written because their linkage changed
    pub records_written: u64,
    /// Relations skipped because a referenced record was missing or could
    /// not be read or written
    pub relations_skipped: u64,
}

pub struct HierarchyLinker {
    items: Arc<dyn CanonicalItemRepository>,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
}

impl HierarchyLinker {
    pub fn new(
        items: Arc<dyn CanonicalItemRepository>,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            items,
            event_bus,
            clock,
        }
    }

    /// Link one series tree.
    ///
    /// Storage failures on single records are logged and counted in
    /// [`LinkReport::relations_skipped`]; they never abort the pass.
    #[instrument(skip(self, plan), fields(series_id = %plan.series_id, seasons = plan.seasons.len()))]
    pub async fn link(&self, plan: &SeriesLinkPlan) -> Result<LinkReport> {
        let mut report = LinkReport::default();
        let now = self.clock.unix_timestamp();

        let mut series = self.load(plan.series_id, "series", &mut report).await;
        let mut series_changed = false;

        for season_link in &plan.seasons {
            let Some(mut season) = self.load(season_link.season_id, "season", &mut report).await
            else {
                continue;
            };

            let (season_number, season_changed) = match &mut season.payload {
                MediaPayload::Season(details) => {
                    let mut changed = false;
                    if details.series_id != Some(plan.series_id) {
                        details.series_id = Some(plan.series_id);
                        changed = true;
                    }
                    for episode_id in &season_link.episode_ids {
                        if !details.episode_ids.contains(episode_id) {
                            details.episode_ids.push(*episode_id);
                            changed = true;
                        }
                    }
                    if changed {
                        season.updated_at = now;
                    }
                    (details.season_number, changed)
                }
                other => {
                    warn!(
                        item_id = %season_link.season_id,
                        kind = %other.kind(),
                        "Expected a season record, skipping relation"
                    );
                    report.relations_skipped += 1;
                    continue;
                }
            };
            if season_changed {
                self.write(&season, "season", &mut report).await;
            }

            for episode_id in &season_link.episode_ids {
                let Some(mut episode) = self.load(*episode_id, "episode", &mut report).await
                else {
                    continue;
                };
                let changed = match &mut episode.payload {
                    MediaPayload::Episode(details) => {
                        let before = details.clone();
                        details.series_id = Some(plan.series_id);
                        details.season_id = Some(season.id);
                        details.season_number = season_number;
                        *details != before
                    }
                    other => {
                        warn!(
                            item_id = %episode_id,
                            kind = %other.kind(),
                            "Expected an episode record, skipping relation"
                        );
                        report.relations_skipped += 1;
                        continue;
                    }
                };
                if changed {
                    episode.updated_at = now;
                    if !self.write(&episode, "episode", &mut report).await {
                        continue;
                    }
                }
                report.episodes_linked += 1;
            }

            if let Some(series) = series.as_mut() {
                let episode_ids = match &season.payload {
                    MediaPayload::Season(details) => details.episode_ids.clone(),
                    _ => Vec::new(),
                };
                series_changed |= upsert_season_entry(series, season_number, season.id, episode_ids);
            }
            report.seasons_linked += 1;
        }

        if let Some(mut series) = series {
            if series_changed {
                series.updated_at = now;
                self.write(&series, "series", &mut report).await;
            }
        }

        info!(
            seasons_linked = report.seasons_linked,
            episodes_linked = report.episodes_linked,
            records_written = report.records_written,
            relations_skipped = report.relations_skipped,
            "Series hierarchy linked"
        );

        self.event_bus
            .emit(CoreEvent::Catalog(CatalogEvent::HierarchyLinked {
                series_id: plan.series_id.to_string(),
                seasons_linked: report.seasons_linked,
                episodes_linked: report.episodes_linked,
            }))
            .ok();

        Ok(report)
    }

    async fn load(&self, id: ItemId, what: &str, report: &mut LinkReport) -> Option<CanonicalItem> {
        match self.items.get_by_id(id).await {
            Ok(Some(item)) => Some(item),
            Ok(None) => {
                warn!(item_id = %id, record = what, "Referenced record not found, skipping relation");
                report.relations_skipped += 1;
                None
            }
            Err(e) => {
                warn!(item_id = %id, record = what, error = %e, "Failed to read record, skipping relation");
                report.relations_skipped += 1;
                None
            }
        }
    }

    /// Returns whether the record was stored.
    async fn write(&self, item: &CanonicalItem, what: &str, report: &mut LinkReport) -> bool {
        match self.items.update(item).await {
            Ok(()) => {
                report.records_written += 1;
                true
            }
            Err(e) => {
                warn!(item_id = %item.id, record = what, error = %e, "Failed to write record, skipping relation");
                report.relations_skipped += 1;
                false
            }
        }
    }
}

/// Point the series' entry for `season_number` at `season_id`. Returns
/// whether the series changed.
fn upsert_season_entry(
    series: &mut CanonicalItem,
    season_number: u32,
    season_id: ItemId,
    episode_ids: Vec<ItemId>,
) -> bool {
    let MediaPayload::Series(details) = &mut series.payload else {
        debug!(item_id = %series.id, "Series id does not refer to a series record");
        return false;
    };

    let wanted = SeasonEntry {
        season_number,
        season_id: Some(season_id),
        episode_ids,
    };

    match details
        .seasons
        .iter_mut()
        .find(|entry| entry.season_number == season_number)
    {
        Some(entry) if *entry == wanted => false,
        Some(entry) => {
            *entry = wanted;
            true
        }
        None => {
            details.seasons.push(wanted);
            details.seasons.sort_by_key(|entry| entry.season_number);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::time::ManualClock;
    use core_catalog::db::create_test_pool;
    use async_trait::async_trait;
    use core_catalog::{
        CatalogError, ClientId, EpisodeDetails, IdentifierSource, InboundItem, MediaKind,
        SeasonDetails, SeriesDetails, SqliteCanonicalItemRepository,
    };

    /// Delegates to SQLite but refuses to update one record.
    struct RefusingUpdates {
        inner: Arc<SqliteCanonicalItemRepository>,
        refused: ItemId,
    }

    #[async_trait]
    impl CanonicalItemRepository for RefusingUpdates {
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
            self.inner.create(item).await
        }

        async fn update(&self, item: &CanonicalItem) -> core_catalog::Result<()> {
            if item.id == self.refused {
                return Err(CatalogError::Conflict(format!("refusing {}", item.id)));
            }
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

    struct Fixture {
        repo: Arc<SqliteCanonicalItemRepository>,
        linker: HierarchyLinker,
        bus: EventBus,
    }

    async fn fixture() -> Fixture {
        let repo = Arc::new(SqliteCanonicalItemRepository::new(
            create_test_pool().await.unwrap(),
        ));
        let bus = EventBus::new(16);
        let linker = HierarchyLinker::new(
            repo.clone(),
            bus.clone(),
            Arc::new(ManualClock::at_unix(1_000)),
        );
        Fixture { repo, linker, bus }
    }

    async fn store(repo: &SqliteCanonicalItemRepository, key: &str, payload: MediaPayload) -> ItemId {
        let item = InboundItem::new(ClientId(1), key, key, payload)
            .to_canonical(100)
            .unwrap();
        repo.create(&item).await.unwrap();
        item.id
    }

    async fn season(repo: &SqliteCanonicalItemRepository, key: &str, number: u32) -> ItemId {
        store(
            repo,
            key,
            MediaPayload::Season(SeasonDetails {
                season_number: number,
                ..Default::default()
            }),
        )
        .await
    }

    async fn episode(repo: &SqliteCanonicalItemRepository, key: &str) -> ItemId {
        store(repo, key, MediaPayload::Episode(EpisodeDetails::default())).await
    }

    #[tokio::test]
    async fn test_links_full_tree() {
        let f = fixture().await;
        let mut events = f.bus.subscribe();

        let series_id = store(&f.repo, "show", MediaPayload::Series(SeriesDetails::default())).await;
        let s1 = season(&f.repo, "s1", 1).await;
        let s2 = season(&f.repo, "s2", 2).await;
        let e1 = episode(&f.repo, "e1").await;
        let e2 = episode(&f.repo, "e2").await;
        let e3 = episode(&f.repo, "e3").await;

        let plan = SeriesLinkPlan {
            series_id,
            seasons: vec![
                SeasonLink {
                    season_id: s1,
                    episode_ids: vec![e1, e2],
                },
                SeasonLink {
                    season_id: s2,
                    episode_ids: vec![e3],
                },
            ],
        };

        let report = f.linker.link(&plan).await.unwrap();
        assert_eq!(report.seasons_linked, 2);
        assert_eq!(report.episodes_linked, 3);
        assert_eq!(report.relations_skipped, 0);

        for (episode_id, season_id, number) in [(e1, s1, 1), (e2, s1, 1), (e3, s2, 2)] {
            let stored = f.repo.get_by_id(episode_id).await.unwrap().unwrap();
            match stored.payload {
                MediaPayload::Episode(details) => {
                    assert_eq!(details.series_id, Some(series_id));
                    assert_eq!(details.season_id, Some(season_id));
                    assert_eq!(details.season_number, number);
                }
                other => panic!("unexpected payload {:?}", other),
            }
            assert_eq!(stored.updated_at, 1_000);
        }

        let stored = f.repo.get_by_id(series_id).await.unwrap().unwrap();
        match stored.payload {
            MediaPayload::Series(details) => {
                assert_eq!(details.seasons.len(), 2);
                assert_eq!(details.season(1).unwrap().season_id, Some(s1));
                assert_eq!(details.season(1).unwrap().episode_ids, vec![e1, e2]);
                assert_eq!(details.season(2).unwrap().season_id, Some(s2));
            }
            other => panic!("unexpected payload {:?}", other),
        }

        match events.recv().await.unwrap() {
            CoreEvent::Catalog(CatalogEvent::HierarchyLinked {
                seasons_linked,
                episodes_linked,
                ..
            }) => {
                assert_eq!(seasons_linked, 2);
                assert_eq!(episodes_linked, 3);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_relinking_writes_nothing() {
        let f = fixture().await;
        let series_id = store(&f.repo, "show", MediaPayload::Series(SeriesDetails::default())).await;
        let s1 = season(&f.repo, "s1", 1).await;
        let e1 = episode(&f.repo, "e1").await;

        let plan = SeriesLinkPlan {
            series_id,
            seasons: vec![SeasonLink {
                season_id: s1,
                episode_ids: vec![e1],
            }],
        };

        let first = f.linker.link(&plan).await.unwrap();
        assert_eq!(first.records_written, 3);

        let second = f.linker.link(&plan).await.unwrap();
        assert_eq!(second.records_written, 0);
        assert_eq!(second.episodes_linked, 1);
    }

    #[tokio::test]
    async fn test_missing_records_are_skipped() {
        let f = fixture().await;
        let series_id = store(&f.repo, "show", MediaPayload::Series(SeriesDetails::default())).await;
        let s1 = season(&f.repo, "s1", 1).await;
        let e1 = episode(&f.repo, "e1").await;

        let plan = SeriesLinkPlan {
            series_id,
            seasons: vec![
                SeasonLink {
                    season_id: s1,
                    episode_ids: vec![e1, ItemId::new()],
                },
                SeasonLink {
                    season_id: ItemId::new(),
                    episode_ids: vec![],
                },
            ],
        };

        let report = f.linker.link(&plan).await.unwrap();
        assert_eq!(report.seasons_linked, 1);
        assert_eq!(report.episodes_linked, 1);
        assert_eq!(report.relations_skipped, 2);

        let stored = f.repo.get_by_id(e1).await.unwrap().unwrap();
        match stored.payload {
            MediaPayload::Episode(details) => assert_eq!(details.season_id, Some(s1)),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_series_still_links_children() {
        let f = fixture().await;
        let missing_series = ItemId::new();
        let s1 = season(&f.repo, "s1", 1).await;
        let e1 = episode(&f.repo, "e1").await;

        let plan = SeriesLinkPlan {
            series_id: missing_series,
            seasons: vec![SeasonLink {
                season_id: s1,
                episode_ids: vec![e1],
            }],
        };

        let report = f.linker.link(&plan).await.unwrap();
        assert_eq!(report.relations_skipped, 1);
        assert_eq!(report.episodes_linked, 1);

        let stored = f.repo.get_by_id(s1).await.unwrap().unwrap();
        match stored.payload {
            MediaPayload::Season(details) => {
                assert_eq!(details.series_id, Some(missing_series));
                assert_eq!(details.episode_ids, vec![e1]);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_write_skips_only_that_relation() {
        let f = fixture().await;
        let series_id = store(&f.repo, "show", MediaPayload::Series(SeriesDetails::default())).await;
        let s1 = season(&f.repo, "s1", 1).await;
        let s2 = season(&f.repo, "s2", 2).await;
        let e1 = episode(&f.repo, "e1").await;
        let e2 = episode(&f.repo, "e2").await;
        let e3 = episode(&f.repo, "e3").await;

        let linker = HierarchyLinker::new(
            Arc::new(RefusingUpdates {
                inner: f.repo.clone(),
                refused: e1,
            }),
            f.bus.clone(),
            Arc::new(ManualClock::at_unix(1_000)),
        );
        let plan = SeriesLinkPlan {
            series_id,
            seasons: vec![
                SeasonLink {
                    season_id: s1,
                    episode_ids: vec![e1, e2],
                },
                SeasonLink {
                    season_id: s2,
                    episode_ids: vec![e3],
                },
            ],
        };

        let report = linker.link(&plan).await.unwrap();
        assert_eq!(report.relations_skipped, 1);
        assert_eq!(report.seasons_linked, 2);
        assert_eq!(report.episodes_linked, 2);

        for (episode_id, season_id) in [(e2, s1), (e3, s2)] {
            match f.repo.get_by_id(episode_id).await.unwrap().unwrap().payload {
                MediaPayload::Episode(details) => {
                    assert_eq!(details.series_id, Some(series_id));
                    assert_eq!(details.season_id, Some(season_id));
                }
                other => panic!("unexpected payload {:?}", other),
            }
        }
        match f.repo.get_by_id(e1).await.unwrap().unwrap().payload {
            MediaPayload::Episode(details) => assert_eq!(details.season_id, None),
            other => panic!("unexpected payload {:?}", other),
        }
        match f.repo.get_by_id(series_id).await.unwrap().unwrap().payload {
            MediaPayload::Series(details) => assert_eq!(details.seasons.len(), 2),
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
