//! Injectable time source, so job timestamps and schedule stamping stay
//! deterministic under test.

use chrono::{DateTime, Duration, Utc};
use std::sync::RwLock;

/// Source of "now" for job runs and schedules.
///
/// The orchestrator reads it when a run is created, started and finalized,
/// and when it stamps `last_run_time` on a schedule.
///
/// ```
/// use bridge_traits::time::{Clock, ManualClock};
///
/// let clock = ManualClock::at_unix(1_700_000_000);
/// assert_eq!(clock.unix_timestamp(), 1_700_000_000);
/// ```
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Seconds since the Unix epoch; the unit every stored timestamp uses.
    fn unix_timestamp(&self) -> i64 {
        self.now().timestamp()
    }
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Start at the given Unix timestamp (seconds).
    pub fn at_unix(secs: i64) -> Self {
        Self::new(DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_default())
    }

    pub fn set(&self, value: DateTime<Utc>) {
        if let Ok(mut now) = self.now.write() {
            *now = value;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.write() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
            .read()
            .map(|now| *now)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock() {
        let clock = SystemClock;
        let now = clock.now();
        let timestamp = clock.unix_timestamp();

        assert!(timestamp > 0);
        assert!(timestamp - now.timestamp() <= 1);
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::at_unix(1_700_000_000);
        assert_eq!(clock.unix_timestamp(), 1_700_000_000);

        clock.advance(Duration::seconds(90));
        assert_eq!(clock.unix_timestamp(), 1_700_000_090);

        clock.set(DateTime::<Utc>::from_timestamp(42, 0).unwrap());
        assert_eq!(clock.unix_timestamp(), 42);
    }
}
