//! # Core Configuration Module
//!
//! Builder-based configuration for the catalog sync engine.
//!
//! ## Overview
//!
//! [`CoreConfig`] gathers everything the service façade needs to assemble the
//! engine: where the catalog database lives, pool sizing, event buffering,
//! sync tuning and the injectable [`Clock`]. The builder validates eagerly so
//! a misconfigured process fails at start-up rather than on its first sync.
//!
//! ## Usage
//!
//! ```
//! use core_runtime::config::CoreConfig;
//!
//! let config = CoreConfig::builder()
//!     .database_path("/var/lib/catalog/catalog.db")
//!     .max_db_connections(8)
//!     .sync_timeout_secs(1800)
//!     .build()
//!     .expect("valid config");
//!
//! assert_eq!(config.sync.sync_timeout_secs, 1800);
//! ```
//!
//! Missing values produce actionable errors:
//!
//! ```should_panic
//! use core_runtime::config::CoreConfig;
//!
//! CoreConfig::builder().build().expect("database location is required");
//! ```

use crate::error::{Error, Result};
use crate::events::DEFAULT_EVENT_BUFFER_SIZE;
use bridge_traits::time::{Clock, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;

/// Upper bound for a single job run.
const MAX_SYNC_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Where the catalog database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    /// SQLite file on disk; created if missing
    File(PathBuf),
    /// Private in-memory database, discarded with the pool
    InMemory,
}

/// Tuning knobs for job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    /// Wall-clock limit for one job run, in seconds
    pub sync_timeout_secs: u64,
    /// Items reconciled concurrently inside one chunk
    pub max_concurrent_items: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            sync_timeout_secs: 3600,
            max_concurrent_items: 4,
        }
    }
}

/// Engine configuration. Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// Catalog database location
    pub database: DatabaseLocation,

    /// Maximum number of pooled SQLite connections
    pub max_db_connections: u32,

    /// Per-subscriber buffer of the event bus
    pub event_buffer_size: usize,

    /// Job-run tuning
    pub sync: SyncSettings,

    /// Time source for job timestamps and schedule stamping
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("database", &self.database)
            .field("max_db_connections", &self.max_db_connections)
            .field("event_buffer_size", &self.event_buffer_size)
            .field("sync", &self.sync)
            .field("clock", &"Clock { ... }")
            .finish()
    }
}

impl CoreConfig {
    /// Creates a new builder for constructing a `CoreConfig`.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if let DatabaseLocation::File(path) = &self.database {
            if path.as_os_str().is_empty() {
                return Err(Error::Config("Database path cannot be empty".to_string()));
            }
        }

        if self.max_db_connections == 0 {
            return Err(Error::Config(
                "Database pool needs at least one connection".to_string(),
            ));
        }

        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        if self.sync.sync_timeout_secs == 0 {
            return Err(Error::Config(
                "Sync timeout must be greater than 0 seconds".to_string(),
            ));
        }

        if self.sync.sync_timeout_secs > MAX_SYNC_TIMEOUT_SECS {
            return Err(Error::Config(format!(
                "Sync timeout exceeds maximum of {} seconds",
                MAX_SYNC_TIMEOUT_SECS
            )));
        }

        if self.sync.max_concurrent_items == 0 {
            return Err(Error::Config(
                "max_concurrent_items must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for constructing [`CoreConfig`] instances.
#[derive(Default)]
pub struct CoreConfigBuilder {
    database: Option<DatabaseLocation>,
    max_db_connections: Option<u32>,
    event_buffer_size: Option<usize>,
    sync_timeout_secs: Option<u64>,
    max_concurrent_items: Option<usize>,
    clock: Option<Arc<dyn Clock>>,
}

impl CoreConfigBuilder {
    /// Sets the SQLite database file.
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database = Some(DatabaseLocation::File(path.into()));
        self
    }

    /// Uses a private in-memory database (tests, dry runs).
    pub fn in_memory_database(mut self) -> Self {
        self.database = Some(DatabaseLocation::InMemory);
        self
    }

    /// Default: 5
    pub fn max_db_connections(mut self, max: u32) -> Self {
        self.max_db_connections = Some(max);
        self
    }

    /// Default: [`DEFAULT_EVENT_BUFFER_SIZE`]
    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Default: 3600 seconds
    pub fn sync_timeout_secs(mut self, secs: u64) -> Self {
        self.sync_timeout_secs = Some(secs);
        self
    }

    /// Default: 4
    pub fn max_concurrent_items(mut self, max: usize) -> Self {
        self.max_concurrent_items = Some(max);
        self
    }

    /// Inject a time source. Default: [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds and validates the final `CoreConfig`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no database location was given or any
    /// value is out of range.
    pub fn build(self) -> Result<CoreConfig> {
        let database = self.database.ok_or_else(|| {
            Error::Config(
                "Database location is required. Use .database_path() or .in_memory_database()."
                    .to_string(),
            )
        })?;

        let defaults = SyncSettings::default();
        let config = CoreConfig {
            database,
            max_db_connections: self.max_db_connections.unwrap_or(5),
            event_buffer_size: self.event_buffer_size.unwrap_or(DEFAULT_EVENT_BUFFER_SIZE),
            sync: SyncSettings {
                sync_timeout_secs: self
                    .sync_timeout_secs
                    .unwrap_or(defaults.sync_timeout_secs),
                max_concurrent_items: self
                    .max_concurrent_items
                    .unwrap_or(defaults.max_concurrent_items),
            },
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        };

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::time::ManualClock;

    #[test]
    fn test_builder_requires_database_location() {
        let result = CoreConfig::builder().build();
        match result {
            Err(Error::Config(msg)) => assert!(msg.contains("Database location is required")),
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_builder_defaults() {
        let config = CoreConfig::builder()
            .database_path("/tmp/catalog.db")
            .build()
            .unwrap();

        assert_eq!(
            config.database,
            DatabaseLocation::File(PathBuf::from("/tmp/catalog.db"))
        );
        assert_eq!(config.max_db_connections, 5);
        assert_eq!(config.event_buffer_size, DEFAULT_EVENT_BUFFER_SIZE);
        assert_eq!(config.sync, SyncSettings::default());
    }

    #[test]
    fn test_builder_overrides() {
        let clock = Arc::new(ManualClock::at_unix(1_000));
        let config = CoreConfig::builder()
            .in_memory_database()
            .max_db_connections(1)
            .event_buffer_size(16)
            .sync_timeout_secs(60)
            .max_concurrent_items(1)
            .clock(clock)
            .build()
            .unwrap();

        assert_eq!(config.database, DatabaseLocation::InMemory);
        assert_eq!(config.max_db_connections, 1);
        assert_eq!(config.event_buffer_size, 16);
        assert_eq!(config.sync.sync_timeout_secs, 60);
        assert_eq!(config.sync.max_concurrent_items, 1);
        assert_eq!(config.clock.unix_timestamp(), 1_000);
    }

    #[test]
    fn test_validate_rejects_empty_path() {
        let result = CoreConfig::builder().database_path("").build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(CoreConfig::builder()
            .in_memory_database()
            .max_db_connections(0)
            .build()
            .is_err());
        assert!(CoreConfig::builder()
            .in_memory_database()
            .event_buffer_size(0)
            .build()
            .is_err());
        assert!(CoreConfig::builder()
            .in_memory_database()
            .sync_timeout_secs(0)
            .build()
            .is_err());
        assert!(CoreConfig::builder()
            .in_memory_database()
            .max_concurrent_items(0)
            .build()
            .is_err());
    }

    #[test]
    fn test_validate_rejects_excessive_timeout() {
        let result = CoreConfig::builder()
            .in_memory_database()
            .sync_timeout_secs(MAX_SYNC_TIMEOUT_SECS + 1)
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_config_debug_hides_clock() {
        let config = CoreConfig::builder().in_memory_database().build().unwrap();
        let rendered = format!("{:?}", config);
        assert!(rendered.contains("InMemory"));
        assert!(rendered.contains("Clock { ... }"));
    }
}
