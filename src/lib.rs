//! Workspace entry crate.
//!
//! Re-exports the service façade so hosts can depend on
//! `catalog-sync-workspace` alone instead of wiring each crate.

pub use core_service::*;
