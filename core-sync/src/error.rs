use bridge_traits::error::BridgeError;
use core_catalog::CatalogError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Job run {job_id} not found")]
    JobNotFound { job_id: String },

    #[error("Sync already in progress for user {user_id}, client {client_id}, kind {media_kind}")]
    SyncInProgress {
        user_id: i64,
        client_id: i64,
        media_kind: String,
    },

    #[error("Invalid client configuration: {0}")]
    ClientConfig(String),

    #[error("Client type '{client_type}' cannot provide {media_kind}")]
    ProviderUnavailable {
        client_type: String,
        media_kind: String,
    },

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Sync timeout after {0} seconds")]
    Timeout(u64),

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Item '{title}' has no client-scoped identifier")]
    MissingSourceIdentifier { title: String },

    #[error("Kind mismatch: expected {expected}, found {found}")]
    KindMismatch { expected: String, found: String },

    #[error("Invalid job ID: {0}")]
    InvalidJobId(String),

    #[error("Invalid job status: {0}")]
    InvalidStatus(String),

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(String),
}

impl SyncError {
    /// Errors that only affect the item being reconciled; the batch skips the
    /// item and carries on.
    pub fn is_item_level(&self) -> bool {
        matches!(
            self,
            SyncError::MissingSourceIdentifier { .. }
                | SyncError::KindMismatch { .. }
                | SyncError::Catalog(_)
        )
    }

    /// Whether a later run of the same job can be expected to succeed without
    /// operator action.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            SyncError::ClientConfig(_)
                | SyncError::ProviderUnavailable { .. }
                | SyncError::UnsupportedMediaType(_)
        )
    }
}

impl From<BridgeError> for SyncError {
    fn from(e: BridgeError) -> Self {
        if e.needs_operator() {
            SyncError::ClientConfig(e.to_string())
        } else {
            SyncError::Provider(e.to_string())
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        SyncError::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
