//! Domain models for the canonical catalog
//!
//! One [`CanonicalItem`] envelope covers every media kind. The kind-specific
//! shape lives in the closed [`MediaPayload`] variant, so code that only cares
//! about identity (source links, external identifiers, title and year) is
//! written once against the envelope.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{CatalogError, Result};

// =============================================================================
// ID Types
// =============================================================================

/// Locally-assigned surrogate key of a canonical item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(Uuid);

impl ItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| CatalogError::InvalidInput {
                field: "item_id".to_string(),
                message: e.to_string(),
            })
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ItemId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Identifier of an external media-server integration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub i64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ClientId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

// =============================================================================
// Media kinds and identifier sources
// =============================================================================

/// Media variant a canonical item belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Movie,
    Series,
    Season,
    Episode,
    Track,
    Album,
    Artist,
}

impl MediaKind {
    pub const ALL: [MediaKind; 7] = [
        MediaKind::Movie,
        MediaKind::Series,
        MediaKind::Season,
        MediaKind::Episode,
        MediaKind::Track,
        MediaKind::Album,
        MediaKind::Artist,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Movie => "movie",
            MediaKind::Series => "series",
            MediaKind::Season => "season",
            MediaKind::Episode => "episode",
            MediaKind::Track => "track",
            MediaKind::Album => "album",
            MediaKind::Artist => "artist",
        }
    }

    /// Chunk size used when batching inbound items of this kind.
    pub fn batch_size(&self) -> usize {
        match self {
            MediaKind::Episode | MediaKind::Track => 100,
            _ => 50,
        }
    }
}

impl FromStr for MediaKind {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self> {
        MediaKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CatalogError::InvalidInput {
                field: "kind".to_string(),
                message: format!("unknown media kind '{}'", s),
            })
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known external identifier namespaces.
///
/// Declaration order is the resolver's preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierSource {
    Imdb,
    Tmdb,
    Tvdb,
    MusicBrainz,
}

impl IdentifierSource {
    pub const PREFERENCE: [IdentifierSource; 4] = [
        IdentifierSource::Imdb,
        IdentifierSource::Tmdb,
        IdentifierSource::Tvdb,
        IdentifierSource::MusicBrainz,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierSource::Imdb => "imdb",
            IdentifierSource::Tmdb => "tmdb",
            IdentifierSource::Tvdb => "tvdb",
            IdentifierSource::MusicBrainz => "musicbrainz",
        }
    }
}

impl FromStr for IdentifierSource {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self> {
        IdentifierSource::PREFERENCE
            .into_iter()
            .find(|source| source.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CatalogError::InvalidInput {
                field: "identifier_source".to_string(),
                message: format!("unknown identifier source '{}'", s),
            })
    }
}

impl fmt::Display for IdentifierSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Identity collections
// =============================================================================

/// External identifiers keyed by source, one value per source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalIds(BTreeMap<IdentifierSource, String>);

impl ExternalIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, mostly for fixtures.
    pub fn with(mut self, source: IdentifierSource, value: impl Into<String>) -> Self {
        self.upsert(source, value);
        self
    }

    pub fn get(&self, source: IdentifierSource) -> Option<&str> {
        self.0.get(&source).map(String::as_str)
    }

    /// Insert or overwrite; returns true when the stored value changed.
    /// Blank values are ignored.
    pub fn upsert(&mut self, source: IdentifierSource, value: impl Into<String>) -> bool {
        let value = value.into();
        let value = value.trim();
        if value.is_empty() {
            return false;
        }
        match self.0.get(&source) {
            Some(existing) if existing == value => false,
            _ => {
                self.0.insert(source, value.to_string());
                true
            }
        }
    }

    /// Upsert every entry of `other`. Entries absent from `other` are kept.
    pub fn merge_from(&mut self, other: &ExternalIds) -> bool {
        let mut changed = false;
        for (source, value) in other.iter_preferred() {
            changed |= self.upsert(source, value);
        }
        changed
    }

    /// Entries in resolver preference order (imdb, tmdb, tvdb, musicbrainz).
    pub fn iter_preferred(&self) -> impl Iterator<Item = (IdentifierSource, &str)> {
        self.0.iter().map(|(source, value)| (*source, value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// External item id per client, one entry per client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceLinks(BTreeMap<ClientId, String>);

impl SourceLinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, client_id: ClientId, external_item_id: impl Into<String>) -> Self {
        self.upsert(client_id, external_item_id);
        self
    }

    pub fn get(&self, client_id: ClientId) -> Option<&str> {
        self.0.get(&client_id).map(String::as_str)
    }

    /// Set this client's external id; other clients are untouched.
    pub fn upsert(&mut self, client_id: ClientId, external_item_id: impl Into<String>) -> bool {
        let external_item_id = external_item_id.into();
        if self.get(client_id) == Some(external_item_id.as_str()) {
            return false;
        }
        self.0.insert(client_id, external_item_id);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClientId, &str)> {
        self.0.iter().map(|(client, id)| (*client, id.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// =============================================================================
// Payloads
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MovieDetails {
    pub overview: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub cast: Vec<String>,
    pub runtime_minutes: Option<u32>,
    pub rating: Option<f32>,
}

/// One season slot on a series record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonEntry {
    pub season_number: u32,
    pub season_id: Option<ItemId>,
    #[serde(default)]
    pub episode_ids: Vec<ItemId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeriesDetails {
    pub overview: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub seasons: Vec<SeasonEntry>,
}

impl SeriesDetails {
    pub fn season(&self, season_number: u32) -> Option<&SeasonEntry> {
        self.seasons
            .iter()
            .find(|entry| entry.season_number == season_number)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeasonDetails {
    pub series_id: Option<ItemId>,
    pub season_number: u32,
    pub overview: Option<String>,
    #[serde(default)]
    pub episode_ids: Vec<ItemId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpisodeDetails {
    pub series_id: Option<ItemId>,
    pub season_id: Option<ItemId>,
    pub season_number: u32,
    pub episode_number: Option<u32>,
    pub overview: Option<String>,
    pub runtime_minutes: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackDetails {
    pub album: Option<String>,
    #[serde(default)]
    pub artists: Vec<String>,
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub genres: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlbumDetails {
    pub artist: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    pub track_count: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtistDetails {
    pub biography: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    pub country: Option<String>,
}

/// Kind-specific details; the variant is the item's kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "details", rename_all = "lowercase")]
pub enum MediaPayload {
    Movie(MovieDetails),
    Series(SeriesDetails),
    Season(SeasonDetails),
    Episode(EpisodeDetails),
    Track(TrackDetails),
    Album(AlbumDetails),
    Artist(ArtistDetails),
}

impl MediaPayload {
    pub fn kind(&self) -> MediaKind {
        match self {
            MediaPayload::Movie(_) => MediaKind::Movie,
            MediaPayload::Series(_) => MediaKind::Series,
            MediaPayload::Season(_) => MediaKind::Season,
            MediaPayload::Episode(_) => MediaKind::Episode,
            MediaPayload::Track(_) => MediaKind::Track,
            MediaPayload::Album(_) => MediaKind::Album,
            MediaPayload::Artist(_) => MediaKind::Artist,
        }
    }

    /// Fill hierarchy linkage this payload leaves unset from `previous`.
    ///
    /// Providers report descriptive data only; surrogate-key linkage is owned
    /// by the hierarchy linker and must survive a descriptive overwrite.
    pub fn carry_hierarchy_from(&mut self, previous: &MediaPayload) {
        match (self, previous) {
            (MediaPayload::Series(next), MediaPayload::Series(prev)) => {
                for old in &prev.seasons {
                    match next
                        .seasons
                        .iter_mut()
                        .find(|entry| entry.season_number == old.season_number)
                    {
                        Some(entry) => {
                            if entry.season_id.is_none() {
                                entry.season_id = old.season_id;
                            }
                            if entry.episode_ids.is_empty() {
                                entry.episode_ids = old.episode_ids.clone();
                            }
                        }
                        None => next.seasons.push(old.clone()),
                    }
                }
                next.seasons.sort_by_key(|entry| entry.season_number);
            }
            (MediaPayload::Season(next), MediaPayload::Season(prev)) => {
                if next.series_id.is_none() {
                    next.series_id = prev.series_id;
                }
                if next.episode_ids.is_empty() {
                    next.episode_ids = prev.episode_ids.clone();
                }
            }
            (MediaPayload::Episode(next), MediaPayload::Episode(prev)) => {
                if next.series_id.is_none() {
                    next.series_id = prev.series_id;
                }
                if next.season_id.is_none() {
                    next.season_id = prev.season_id;
                }
            }
            _ => {}
        }
    }
}

// =============================================================================
// Canonical item
// =============================================================================

/// One real-world media entity, deduplicated across all clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalItem {
    pub id: ItemId,
    pub title: String,
    pub release_year: Option<i32>,
    pub release_date: Option<NaiveDate>,
    pub source_links: SourceLinks,
    pub external_ids: ExternalIds,
    pub payload: MediaPayload,
    pub created_at: i64,
    pub updated_at: i64,
}

impl CanonicalItem {
    /// Create a fresh item with a new surrogate key.
    pub fn new(title: impl Into<String>, payload: MediaPayload, now: i64) -> Self {
        Self {
            id: ItemId::new(),
            title: title.into(),
            release_year: None,
            release_date: None,
            source_links: SourceLinks::new(),
            external_ids: ExternalIds::new(),
            payload,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.payload.kind()
    }

    /// Validate the item before it is written.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("Title cannot be empty".to_string());
        }

        if let Some(year) = self.release_year {
            if !(1800..=3000).contains(&year) {
                return Err(format!("Release year out of range: {}", year));
            }
        }

        if let MediaPayload::Season(season) = &self.payload {
            if season.season_number == 0 {
                return Err("Season number must be at least 1".to_string());
            }
        }

        Ok(())
    }
}
