//! # Core Runtime Module
//!
//! Foundational runtime infrastructure shared by the catalog and sync crates:
//! - Logging and tracing bootstrap
//! - Engine configuration
//! - Event bus for sync lifecycle notifications
//!
//! ## Overview
//!
//! Nothing in here knows about media items. It establishes the logging
//! conventions, the configuration surface and the broadcast channel that the
//! rest of the workspace builds on.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
