//! # Identity Resolver
//!
//! Decides which canonical item, if any, an inbound item refers to.
//!
//! Resolution order, first success wins:
//! 1. source link `(kind, client, external item id)`: exact identity
//! 2. external identifiers in preference order (imdb, tmdb, tvdb, musicbrainz)
//! 3. exact title and release year among items already linked to the client
//!
//! Steps 2 and 3 skip a candidate whose link for this client points at a
//! different external id that is itself part of the current fetch: that
//! candidate is a different live item on the same server.

use crate::{Result, SyncError};
use core_catalog::{CanonicalItem, CanonicalItemRepository, ClientId, IdentifierSource, InboundItem};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument};

/// How a match was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    SourceLink,
    ExternalId(IdentifierSource),
    TitleYear,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub item: CanonicalItem,
    pub matched_by: MatchStrategy,
}

/// Client-scoped external ids present in the current fetch for one kind.
#[derive(Debug, Clone, Default)]
pub struct ClaimedKeys(HashSet<String>);

impl ClaimedKeys {
    pub fn from_items(items: &[InboundItem]) -> Self {
        Self(
            items
                .iter()
                .filter_map(|item| item.source_key().map(str::to_string))
                .collect(),
        )
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub struct IdentityResolver {
    items: Arc<dyn CanonicalItemRepository>,
}

impl IdentityResolver {
    pub fn new(items: Arc<dyn CanonicalItemRepository>) -> Self {
        Self { items }
    }

    /// Find the canonical item `inbound` refers to.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MissingSourceIdentifier`] if the item carries no
    /// client-scoped id, or a catalog error if a lookup fails.
    #[instrument(skip(self, inbound, claimed), fields(kind = %inbound.kind(), client_id = %inbound.client_id))]
    pub async fn resolve(
        &self,
        inbound: &InboundItem,
        claimed: &ClaimedKeys,
    ) -> Result<Option<Resolution>> {
        let kind = inbound.kind();
        let client_id = inbound.client_id;
        let key = inbound
            .source_key()
            .ok_or_else(|| SyncError::MissingSourceIdentifier {
                title: inbound.title.clone(),
            })?;

        if let Some(item) = self.items.find_by_source_link(kind, client_id, key).await? {
            return Ok(Some(Resolution {
                item,
                matched_by: MatchStrategy::SourceLink,
            }));
        }

        for (source, value) in inbound.external_ids.iter_preferred() {
            let candidates = self
                .items
                .find_all_by_external_identifier(kind, source, value)
                .await?;
            if let Some(item) = first_available(candidates, client_id, key, claimed) {
                debug!(external_item_id = key, source = %source, "Matched by external identifier");
                return Ok(Some(Resolution {
                    item,
                    matched_by: MatchStrategy::ExternalId(source),
                }));
            }
        }

        let candidates = self
            .items
            .find_by_title_year(kind, client_id, &inbound.title, inbound.release_year)
            .await?;
        if let Some(item) = first_available(candidates, client_id, key, claimed) {
            debug!(external_item_id = key, "Matched by title and year");
            return Ok(Some(Resolution {
                item,
                matched_by: MatchStrategy::TitleYear,
            }));
        }

        Ok(None)
    }
}

fn first_available(
    candidates: Vec<CanonicalItem>,
    client_id: ClientId,
    key: &str,
    claimed: &ClaimedKeys,
) -> Option<CanonicalItem> {
    candidates
        .into_iter()
        .find(|candidate| match candidate.source_links.get(client_id) {
            Some(linked) => linked == key || !claimed.contains(linked),
            None => true,
        })
}
