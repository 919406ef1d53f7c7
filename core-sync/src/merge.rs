//! # Merge Engine
//!
//! Combines an existing canonical item with a newer report of the same
//! entity.
//!
//! - **Identity** (source links, external identifiers) is strictly additive:
//!   the reporting client's link is upserted, every inbound identifier is
//!   upserted, nothing is ever removed.
//! - **Descriptive data** (title, year, date, kind-specific details) is
//!   replaced wholesale by the inbound values. Freshest fetch wins.
//! - **Hierarchy linkage** the inbound payload leaves unset is carried over
//!   from the existing record; only the hierarchy linker rewrites it.

use crate::{Result, SyncError};
use core_catalog::{CanonicalItem, InboundItem};

/// Result of merging one inbound report into an existing item.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub item: CanonicalItem,
    /// `false` when the merge reproduced the stored record exactly
    pub changed: bool,
}

/// Merge `inbound` into `existing`.
///
/// `updated_at` only moves to `now` when something actually changed, so a
/// re-run over identical data leaves stored rows untouched.
///
/// # Errors
///
/// Returns [`SyncError::KindMismatch`] if the payload kinds disagree, or
/// [`SyncError::MissingSourceIdentifier`] if the report has no client-scoped
/// id to link.
pub fn merge_item(
    existing: &CanonicalItem,
    inbound: &InboundItem,
    now: i64,
) -> Result<MergeOutcome> {
    if existing.kind() != inbound.kind() {
        return Err(SyncError::KindMismatch {
            expected: existing.kind().to_string(),
            found: inbound.kind().to_string(),
        });
    }

    let key = inbound
        .source_key()
        .ok_or_else(|| SyncError::MissingSourceIdentifier {
            title: inbound.title.clone(),
        })?;

    let mut merged = existing.clone();
    merged.source_links.upsert(inbound.client_id, key);
    merged.external_ids.merge_from(&inbound.external_ids);

    merged.title = inbound.title.clone();
    merged.release_year = inbound.release_year;
    merged.release_date = inbound.release_date;

    let mut payload = inbound.payload.clone();
    payload.carry_hierarchy_from(&existing.payload);
    merged.payload = payload;

    let changed = merged != *existing;
    if changed {
        merged.updated_at = now;
    }

    Ok(MergeOutcome {
        item: merged,
        changed,
    })
}
