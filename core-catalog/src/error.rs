use thiserror::Error;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid input: {field} - {message}")]
    InvalidInput { field: String, message: String },

    #[error("Identity conflict: {0}")]
    Conflict(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

impl CatalogError {
    /// Whether the failure comes from a uniqueness constraint on identity rows.
    pub fn is_identity_conflict(&self) -> bool {
        match self {
            CatalogError::Conflict(_) => true,
            CatalogError::Database(sqlx::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CatalogError>;
