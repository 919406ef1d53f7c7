//! # Host Bridge Traits
//!
//! What the sync engine needs from the process that hosts it: a time source,
//! a place to forward logs, and one error type provider adapters report
//! through.
//!
//! - [`Clock`](time::Clock) for job timestamps and schedule stamping
//! - [`LoggerSink`](log::LoggerSink) to mirror engine logs into host logging
//! - [`BridgeError`](error::BridgeError) for failures of adapters that talk
//!   to external media servers
//!
//! All traits require `Send + Sync` so implementations can be shared across
//! tasks behind an `Arc`.

pub mod error;
pub mod log;
pub mod time;

pub use error::BridgeError;
pub use log::{LogEntry, LogLevel, LoggerSink, RecentLogs};
pub use time::{Clock, ManualClock, SystemClock};
