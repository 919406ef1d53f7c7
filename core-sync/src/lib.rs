//! # Sync & Reconciliation Module
//!
//! Pulls catalog snapshots from external media servers and reconciles them
//! into the canonical catalog.
//!
//! ## Overview
//!
//! This module manages the lifecycle of job runs, including:
//! - Resolving a client id to a provider via the client registry
//! - Fetching items, or series trees, from the provider
//! - Matching every inbound item against the catalog
//! - Merging or creating canonical items, one transaction per item
//! - Back-propagating season and episode ids into their series
//! - Recording progress and outcome on the job run
//!
//! ## Components
//!
//! - **Job Model** (`job`): job runs, schedules and their status machine
//! - **Repository** (`repository`): persistence for job runs and schedules
//! - **Provider Contracts** (`provider`): client registry, factories, capabilities
//! - **Identity Resolver** (`resolver`): source link, external id, title/year matching
//! - **Merge Engine** (`merge`): additive identity, freshest-wins description
//! - **Hierarchy Linker** (`hierarchy`): series → season → episode linkage
//! - **Batch Processor** (`batch`): chunked, bounded-concurrency reconciliation
//! - **Sync Orchestrator** (`orchestrator`): drives and finalizes job runs

pub mod batch;
pub mod error;
pub mod hierarchy;
pub mod job;
pub mod merge;
pub mod orchestrator;
pub mod provider;
pub mod repository;
pub mod resolver;

pub use batch::{
    BatchProcessor, BatchReport, ChunkProgress, IdentityLocks, ItemOutcome, NoopProgress,
    ProgressSink,
};
pub use error::{Result, SyncError};
pub use hierarchy::{HierarchyLinker, LinkReport, SeasonLink, SeriesLinkPlan};
pub use job::{
    JobRun, JobRunId, JobRunMetadata, JobSchedule, JobScheduleId, JobStatus, SyncTarget, UserId,
};
pub use merge::{merge_item, MergeOutcome};
pub use orchestrator::{dispatch_media_type, SyncConfig, SyncOrchestrator, SyncPlan, SyncRequest};
pub use provider::{
    CatalogProvider, ClientConnection, ClientRegistry, ClientType, ConnectionConfig, FetchFilter,
    InMemoryClientRegistry, MediaClient, ProviderCapability, ProviderFactory, SeriesProvider,
};
pub use repository::{
    JobRunRepository, JobScheduleRepository, SqliteJobRunRepository, SqliteJobScheduleRepository,
};
pub use resolver::{ClaimedKeys, IdentityResolver, MatchStrategy, Resolution};
