//! # Provider and Client Registry Contracts
//!
//! The engine never speaks an external server's protocol. A host registers a
//! [`ProviderFactory`] per client type; the factory turns a resolved
//! [`ClientConnection`] into a [`MediaClient`], which hands out one
//! [`ProviderCapability`] per media kind it can list.
//!
//! ```text
//! ClientId ──ClientRegistry──▶ ClientConnection ──ProviderFactory──▶ MediaClient
//!                                                                      │
//!                                              capability(kind) ◀──────┘
//! ```

use async_trait::async_trait;
use bridge_traits::error::Result as BridgeResult;
use core_catalog::{ClientId, InboundEpisode, InboundItem, InboundSeason, MediaKind};
use core_runtime::logging::{redact_if_sensitive, redact_url};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::{Result, SyncError};

// ============================================================================
// Connection descriptors
// ============================================================================

/// Lower-cased client type name (e.g. "plex", "jellyfin").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientType(String);

impl ClientType {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How to reach one external server.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub base_url: String,
    pub api_key: String,
    /// Adapter-specific settings (library ids, user names, ...)
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl ConnectionConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            options: BTreeMap::new(),
        }
    }

    /// # Errors
    ///
    /// Returns [`SyncError::ClientConfig`] for an empty or non-http(s) base
    /// URL, or an empty API key.
    pub fn validate(&self) -> Result<()> {
        let url = self.base_url.trim();
        if url.is_empty() {
            return Err(SyncError::ClientConfig("base URL is empty".to_string()));
        }

        let lower = url.to_lowercase();
        let host = lower
            .strip_prefix("https://")
            .or_else(|| lower.strip_prefix("http://"))
            .ok_or_else(|| {
                SyncError::ClientConfig(format!(
                    "base URL must use http or https: {}",
                    redact_url(url)
                ))
            })?;
        if host.is_empty() || host.starts_with('/') {
            return Err(SyncError::ClientConfig(format!(
                "base URL has no host: {}",
                redact_url(url)
            )));
        }

        if self.api_key.trim().is_empty() {
            return Err(SyncError::ClientConfig("API key is empty".to_string()));
        }

        Ok(())
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let options: BTreeMap<&str, String> = self
            .options
            .iter()
            .map(|(key, value)| (key.as_str(), redact_if_sensitive(key, value)))
            .collect();

        f.debug_struct("ConnectionConfig")
            .field("base_url", &redact_url(&self.base_url))
            .field("api_key", &redact_if_sensitive("api_key", &self.api_key))
            .field("options", &options)
            .finish()
    }
}

/// A resolved client: its type and connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConnection {
    pub client_type: ClientType,
    pub config: ConnectionConfig,
}

// ============================================================================
// Provider capabilities
// ============================================================================

/// Options passed through to a provider's bulk fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFilter {
    /// Restrict the fetch to these server-side libraries; empty means all
    #[serde(default)]
    pub library_ids: Vec<String>,
    /// Include items the server marks as unavailable or missing
    #[serde(default)]
    pub include_unavailable: bool,
}

/// Flat listing for movies, tracks, albums and artists.
#[async_trait]
pub trait CatalogProvider: Send + Sync {
    /// One bulk call returning every item of `kind`.
    async fn fetch_all(&self, kind: MediaKind, filter: &FetchFilter)
        -> BridgeResult<Vec<InboundItem>>;
}

/// Three-level listing for series → season → episode.
#[async_trait]
pub trait SeriesProvider: Send + Sync {
    async fn fetch_all(&self, filter: &FetchFilter) -> BridgeResult<Vec<InboundItem>>;

    async fn fetch_seasons(&self, external_series_id: &str) -> BridgeResult<Vec<InboundSeason>>;

    async fn fetch_episodes(
        &self,
        external_series_id: &str,
        season_number: u32,
    ) -> BridgeResult<Vec<InboundEpisode>>;
}

/// What a client can list for a given kind.
#[derive(Clone)]
pub enum ProviderCapability {
    Catalog(Arc<dyn CatalogProvider>),
    Series(Arc<dyn SeriesProvider>),
}

impl fmt::Debug for ProviderCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderCapability::Catalog(_) => f.write_str("ProviderCapability::Catalog"),
            ProviderCapability::Series(_) => f.write_str("ProviderCapability::Series"),
        }
    }
}

/// A connected external client.
pub trait MediaClient: Send + Sync {
    /// `None` when this client cannot list `kind`.
    fn capability(&self, kind: MediaKind) -> Option<ProviderCapability>;
}

/// Builds [`MediaClient`]s for one client type.
pub trait ProviderFactory: Send + Sync {
    fn client_type(&self) -> ClientType;

    /// # Errors
    ///
    /// Returns [`SyncError::ClientConfig`] when the connection settings are
    /// unusable for this adapter.
    fn connect(&self, connection: &ClientConnection) -> Result<Arc<dyn MediaClient>>;
}

/// Resolves a client id to its type and connection settings.
#[async_trait]
pub trait ClientRegistry: Send + Sync {
    /// `Ok(None)` when the client is unknown.
    async fn resolve(&self, client_id: ClientId) -> BridgeResult<Option<ClientConnection>>;
}

/// Map-backed registry for hosts that load client settings up front.
#[derive(Default)]
pub struct InMemoryClientRegistry {
    clients: RwLock<HashMap<ClientId, ClientConnection>>,
}

impl InMemoryClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, client_id: ClientId, connection: ClientConnection) {
        let mut clients = self
            .clients
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        clients.insert(client_id, connection);
    }

    pub fn remove(&self, client_id: ClientId) -> Option<ClientConnection> {
        let mut clients = self
            .clients
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        clients.remove(&client_id)
    }
}

#[async_trait]
impl ClientRegistry for InMemoryClientRegistry {
    async fn resolve(&self, client_id: ClientId) -> BridgeResult<Option<ClientConnection>> {
        let clients = self
            .clients
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(clients.get(&client_id).cloned())
    }
}
