//! # Repository Pattern Implementation
//!
//! Traits define the data-access contract; SQLite implementations use sqlx.
//! The sync engine only ever depends on the traits, so tests can wrap or
//! replace the SQLite implementation.

pub mod item;

pub use item::{CanonicalItemRepository, SqliteCanonicalItemRepository};
