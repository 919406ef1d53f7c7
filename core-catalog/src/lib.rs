//! # Canonical Catalog Module
//!
//! Owns the deduplicated media catalog and the storage behind it.
//!
//! ## Overview
//!
//! This module manages:
//! - The canonical item envelope and its kind-specific payloads
//! - The inbound item shape providers hand to the sync engine
//! - SQLite pool setup and embedded schema migrations
//! - The item repository used by identity resolution and hierarchy linking
//!
//! Cross-source identity (source links and external identifiers) lives in
//! side tables and is only ever added to or overwritten, never deleted.

pub mod db;
pub mod error;
pub mod inbound;
pub mod models;
pub mod repositories;

pub use error::{CatalogError, Result};
pub use inbound::{InboundEpisode, InboundItem, InboundSeason};
pub use models::{
    AlbumDetails, ArtistDetails, CanonicalItem, ClientId, EpisodeDetails, ExternalIds,
    IdentifierSource, ItemId, MediaKind, MediaPayload, MovieDetails, SeasonDetails, SeasonEntry,
    SeriesDetails, SourceLinks, TrackDetails,
};
pub use repositories::{CanonicalItemRepository, SqliteCanonicalItemRepository};
