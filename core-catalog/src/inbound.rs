//! Inbound item envelope
//!
//! Providers translate their wire formats into [`InboundItem`]s. The envelope
//! mirrors [`CanonicalItem`](crate::models::CanonicalItem) minus the surrogate
//! key, plus the reporting client's own id for the item.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::{CanonicalItem, ClientId, ExternalIds, MediaKind, MediaPayload, SourceLinks};

/// One item as reported by an external client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundItem {
    /// Client that reported the item
    pub client_id: ClientId,
    /// The client's own id for the item; items without one cannot be attributed
    pub external_item_id: Option<String>,
    pub title: String,
    pub release_year: Option<i32>,
    pub release_date: Option<NaiveDate>,
    #[serde(default)]
    pub external_ids: ExternalIds,
    pub payload: MediaPayload,
}

/// Season as reported by a series provider.
pub type InboundSeason = InboundItem;

/// Episode as reported by a series provider.
pub type InboundEpisode = InboundItem;

impl InboundItem {
    pub fn new(
        client_id: ClientId,
        external_item_id: impl Into<String>,
        title: impl Into<String>,
        payload: MediaPayload,
    ) -> Self {
        Self {
            client_id,
            external_item_id: Some(external_item_id.into()),
            title: title.into(),
            release_year: None,
            release_date: None,
            external_ids: ExternalIds::new(),
            payload,
        }
    }

    pub fn with_year(mut self, year: i32) -> Self {
        self.release_year = Some(year);
        self
    }

    pub fn with_release_date(mut self, date: NaiveDate) -> Self {
        self.release_date = Some(date);
        self
    }

    pub fn with_external_ids(mut self, ids: ExternalIds) -> Self {
        self.external_ids = ids;
        self
    }

    pub fn kind(&self) -> MediaKind {
        self.payload.kind()
    }

    /// The client-scoped id, ignoring blank values.
    pub fn source_key(&self) -> Option<&str> {
        self.external_item_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// Build a brand-new canonical item from this report.
    ///
    /// Returns `None` when the item carries no client-scoped id.
    pub fn to_canonical(&self, now: i64) -> Option<CanonicalItem> {
        let key = self.source_key()?;
        let mut item = CanonicalItem::new(self.title.clone(), self.payload.clone(), now);
        item.release_year = self.release_year;
        item.release_date = self.release_date;
        item.source_links = SourceLinks::new().with(self.client_id, key);
        item.external_ids.merge_from(&self.external_ids);
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IdentifierSource, MovieDetails};

    #[test]
    fn test_source_key_ignores_blank_ids() {
        let mut item = InboundItem::new(
            ClientId(7),
            "  ",
            "Example",
            MediaPayload::Movie(MovieDetails::default()),
        );
        assert_eq!(item.source_key(), None);
        assert!(item.to_canonical(0).is_none());

        item.external_item_id = None;
        assert_eq!(item.source_key(), None);
    }

    #[test]
    fn test_to_canonical_carries_identity() {
        let inbound = InboundItem::new(
            ClientId(7),
            "abc",
            "Example",
            MediaPayload::Movie(MovieDetails::default()),
        )
        .with_year(2020)
        .with_external_ids(ExternalIds::new().with(IdentifierSource::Imdb, "tt1"));

        let item = inbound.to_canonical(1_700_000_000).unwrap();
        assert_eq!(item.kind(), MediaKind::Movie);
        assert_eq!(item.source_links.get(ClientId(7)), Some("abc"));
        assert_eq!(item.external_ids.get(IdentifierSource::Imdb), Some("tt1"));
        assert_eq!(item.release_year, Some(2020));
        assert_eq!(item.created_at, 1_700_000_000);
    }
}
