//! # Job Run and Schedule Model
//!
//! One [`JobRun`] records one execution of the engine for a
//! (user, client, media kind) target. A [`JobSchedule`] is the durable intent
//! to run that target periodically.
//!
//! ## State Machine
//!
//! ```text
//! Created → Running → Completed
//!     │         │
//!     └─────────┴──→ Failed
//! ```
//!
//! Terminal states are final. Cancellation and timeouts end in `Failed` with
//! the reason in `error_message`.

use crate::{Result, SyncError};
use core_catalog::{ClientId, MediaKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// ID Types
// ============================================================================

/// Unique identifier for a job run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobRunId(Uuid);

impl JobRunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// # Errors
    ///
    /// Returns an error if the string is not a valid UUID
    pub fn from_string(s: &str) -> Result<Self> {
        Ok(Self(
            Uuid::parse_str(s).map_err(|e| SyncError::InvalidJobId(e.to_string()))?,
        ))
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for JobRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobRunId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Unique identifier for a job schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobScheduleId(Uuid);

impl JobScheduleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self> {
        Ok(Self(
            Uuid::parse_str(s).map_err(|e| SyncError::InvalidJobId(e.to_string()))?,
        ))
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for JobScheduleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Owner of a sync target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Created, JobStatus::Running)
                | (JobStatus::Created, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl FromStr for JobStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "created" => Ok(JobStatus::Created),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(SyncError::InvalidStatus(s.to_string())),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Targets
// ============================================================================

/// The (user, client, kind) tuple a job run works on. At most one run per
/// target is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncTarget {
    pub user_id: UserId,
    pub client_id: ClientId,
    pub media_kind: MediaKind,
}

impl fmt::Display for SyncTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "user {} / client {} / {}",
            self.user_id, self.client_id, self.media_kind
        )
    }
}

/// Free-form context stored with a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRunMetadata {
    pub user_id: UserId,
    pub client_id: ClientId,
    /// Normalized media type as requested; may be unsupported.
    pub media_kind: String,
    /// Filled in once the client registry resolved the client
    pub client_type: Option<String>,
}

// ============================================================================
// Job Run
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: JobRunId,
    pub status: JobStatus,
    /// 0-100, non-decreasing within a run
    pub progress: u8,
    pub progress_message: Option<String>,
    pub total_items: u64,
    pub processed_items: u64,
    /// Items dropped because of item-level errors
    pub skipped_items: u64,
    pub created_items: u64,
    pub updated_items: u64,
    pub error_message: Option<String>,
    pub metadata: JobRunMetadata,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl JobRun {
    /// A fresh run in `Created` state.
    pub fn new(metadata: JobRunMetadata, now: i64) -> Self {
        Self {
            id: JobRunId::new(),
            status: JobStatus::Created,
            progress: 0,
            progress_message: None,
            total_items: 0,
            processed_items: 0,
            skipped_items: 0,
            created_items: 0,
            updated_items: 0,
            error_message: None,
            metadata,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock seconds between start (or creation) and completion.
    pub fn duration_secs(&self) -> Option<u64> {
        let end = self.completed_at?;
        let start = self.started_at.unwrap_or(self.created_at);
        Some(end.saturating_sub(start).max(0) as u64)
    }
}

// ============================================================================
// Job Schedule
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSchedule {
    pub id: JobScheduleId,
    pub user_id: UserId,
    pub client_id: ClientId,
    pub media_kind: MediaKind,
    pub frequency_secs: u64,
    pub enabled: bool,
    pub last_run_time: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl JobSchedule {
    pub fn new(target: SyncTarget, frequency_secs: u64, now: i64) -> Self {
        Self {
            id: JobScheduleId::new(),
            user_id: target.user_id,
            client_id: target.client_id,
            media_kind: target.media_kind,
            frequency_secs,
            enabled: true,
            last_run_time: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn target(&self) -> SyncTarget {
        SyncTarget {
            user_id: self.user_id,
            client_id: self.client_id,
            media_kind: self.media_kind,
        }
    }

    /// Enabled and never run, or the frequency has elapsed since the last run.
    pub fn is_due(&self, now: i64) -> bool {
        if !self.enabled {
            return false;
        }
        match self.last_run_time {
            None => true,
            Some(last) => now.saturating_sub(last) >= self.frequency_secs as i64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> JobRunMetadata {
        JobRunMetadata {
            user_id: UserId(1),
            client_id: ClientId(7),
            media_kind: "movie".to_string(),
            client_type: None,
        }
    }

    #[test]
    fn test_job_run_id_round_trip() {
        let id = JobRunId::new();
        assert_eq!(JobRunId::from_string(&id.as_str()).unwrap(), id);
        assert!(matches!(
            JobRunId::from_string("nope"),
            Err(SyncError::InvalidJobId(_))
        ));
    }

    #[test]
    fn test_status_transitions() {
        assert!(JobStatus::Created.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Created.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Created.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("RUNNING".parse::<JobStatus>().unwrap(), JobStatus::Running);
        assert!("cancelled".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_new_job_run() {
        let run = JobRun::new(metadata(), 100);
        assert_eq!(run.status, JobStatus::Created);
        assert_eq!(run.progress, 0);
        assert!(!run.is_terminal());
        assert_eq!(run.duration_secs(), None);
    }

    #[test]
    fn test_duration() {
        let mut run = JobRun::new(metadata(), 100);
        run.started_at = Some(110);
        run.completed_at = Some(170);
        assert_eq!(run.duration_secs(), Some(60));
    }

    #[test]
    fn test_schedule_due() {
        let target = SyncTarget {
            user_id: UserId(1),
            client_id: ClientId(2),
            media_kind: MediaKind::Series,
        };
        let mut schedule = JobSchedule::new(target, 3600, 0);
        assert!(schedule.is_due(0));

        schedule.last_run_time = Some(1_000);
        assert!(!schedule.is_due(4_599));
        assert!(schedule.is_due(4_600));

        schedule.enabled = false;
        assert!(!schedule.is_due(100_000));
        assert_eq!(schedule.target(), target);
    }
}
