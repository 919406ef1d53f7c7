//! # Job Repositories
//!
//! Persistence for job runs and job schedules.
//!
//! ## Overview
//!
//! Job-run writes are narrow, single-statement updates so that progress
//! reporting never races with finalization:
//! - progress is written as `MAX(progress, ?)` and never moves backwards
//! - counters are incremented in place
//! - `complete` only matches rows still in `created`/`running`, which makes
//!   finalization happen exactly once

use crate::job::{
    JobRun, JobRunId, JobRunMetadata, JobSchedule, JobScheduleId, JobStatus, SyncTarget, UserId,
};
use crate::{Result, SyncError};
use async_trait::async_trait;
use core_catalog::{ClientId, MediaKind};
use sqlx::{FromRow, SqlitePool};

// ============================================================================
// Repository Traits
// ============================================================================

/// Repository trait for job-run persistence
#[async_trait]
pub trait JobRunRepository: Send + Sync {
    async fn create(&self, job: &JobRun) -> Result<()>;

    /// `Created → Running`, recording the resolved metadata.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidStateTransition`] if the run is not in
    /// `Created` state.
    async fn mark_running(
        &self,
        id: JobRunId,
        metadata: &JobRunMetadata,
        started_at: i64,
    ) -> Result<()>;

    /// Raise progress to `percent` (never lowers it) and set the message.
    async fn update_progress(&self, id: JobRunId, percent: u8, message: &str) -> Result<()>;

    async fn set_total_items(&self, id: JobRunId, total: u64) -> Result<()>;

    async fn increment_processed(&self, id: JobRunId, count: u64) -> Result<()>;

    /// Add per-outcome counts from one chunk.
    async fn record_outcomes(
        &self,
        id: JobRunId,
        created: u64,
        updated: u64,
        skipped: u64,
    ) -> Result<()>;

    /// Finalize the run. Only succeeds once, from `Created` or `Running`.
    async fn complete(
        &self,
        id: JobRunId,
        status: JobStatus,
        error_message: Option<&str>,
        completed_at: i64,
    ) -> Result<()>;

    async fn find_by_id(&self, id: JobRunId) -> Result<Option<JobRun>>;

    /// Runs for a user/client pair, most recent first.
    async fn history(&self, user_id: UserId, client_id: ClientId, limit: u32)
        -> Result<Vec<JobRun>>;
}

/// Repository trait for job-schedule persistence
#[async_trait]
pub trait JobScheduleRepository: Send + Sync {
    /// Insert, or update frequency/enabled of the schedule for the same target.
    async fn upsert(&self, schedule: &JobSchedule) -> Result<()>;

    async fn find(&self, target: SyncTarget) -> Result<Option<JobSchedule>>;

    async fn list_enabled(&self) -> Result<Vec<JobSchedule>>;

    /// Set `last_run_time`; returns false if no schedule exists for the target.
    async fn stamp_last_run(&self, target: SyncTarget, at: i64) -> Result<bool>;
}

// ============================================================================
// SQLite Job Runs
// ============================================================================

/// SQLite implementation of JobRunRepository
#[derive(Clone)]
pub struct SqliteJobRunRepository {
    pool: SqlitePool,
}

impl SqliteJobRunRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn ensure_exists(&self, id: JobRunId) -> Result<JobRun> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| SyncError::JobNotFound {
                job_id: id.to_string(),
            })
    }
}

#[derive(Debug, FromRow)]
struct JobRunRow {
    id: String,
    status: String,
    progress: i64,
    progress_message: Option<String>,
    total_items: i64,
    processed_items: i64,
    skipped_items: i64,
    created_items: i64,
    updated_items: i64,
    error_message: Option<String>,
    metadata: String,
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
}

impl TryFrom<JobRunRow> for JobRun {
    type Error = SyncError;

    fn try_from(row: JobRunRow) -> Result<Self> {
        Ok(JobRun {
            id: JobRunId::from_string(&row.id)?,
            status: row.status.parse()?,
            progress: row.progress.clamp(0, 100) as u8,
            progress_message: row.progress_message,
            total_items: row.total_items.max(0) as u64,
            processed_items: row.processed_items.max(0) as u64,
            skipped_items: row.skipped_items.max(0) as u64,
            created_items: row.created_items.max(0) as u64,
            updated_items: row.updated_items.max(0) as u64,
            error_message: row.error_message,
            metadata: serde_json::from_str(&row.metadata)?,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

const JOB_RUN_COLUMNS: &str = "id, status, progress, progress_message, total_items, \
     processed_items, skipped_items, created_items, updated_items, error_message, \
     metadata, created_at, started_at, completed_at";

#[async_trait]
impl JobRunRepository for SqliteJobRunRepository {
    async fn create(&self, job: &JobRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_runs (
                id, user_id, client_id, media_kind, status, progress, progress_message,
                total_items, processed_items, skipped_items, created_items, updated_items,
                error_message, metadata, created_at, started_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id.as_str())
        .bind(job.metadata.user_id.0)
        .bind(job.metadata.client_id.0)
        .bind(&job.metadata.media_kind)
        .bind(job.status.as_str())
        .bind(job.progress as i64)
        .bind(&job.progress_message)
        .bind(job.total_items as i64)
        .bind(job.processed_items as i64)
        .bind(job.skipped_items as i64)
        .bind(job.created_items as i64)
        .bind(job.updated_items as i64)
        .bind(&job.error_message)
        .bind(serde_json::to_string(&job.metadata)?)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_running(
        &self,
        id: JobRunId,
        metadata: &JobRunMetadata,
        started_at: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_runs SET status = 'running', metadata = ?, started_at = ?
            WHERE id = ? AND status = 'created'
            "#,
        )
        .bind(serde_json::to_string(metadata)?)
        .bind(started_at)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let current = self.ensure_exists(id).await?;
            return Err(SyncError::InvalidStateTransition {
                from: current.status.to_string(),
                to: JobStatus::Running.to_string(),
                reason: "Only created runs can start".to_string(),
            });
        }

        Ok(())
    }

    async fn update_progress(&self, id: JobRunId, percent: u8, message: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_runs SET progress = MAX(progress, ?), progress_message = ?
            WHERE id = ? AND status IN ('created', 'running')
            "#,
        )
        .bind(percent.min(100) as i64)
        .bind(message)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            self.ensure_exists(id).await?;
        }

        Ok(())
    }

    async fn set_total_items(&self, id: JobRunId, total: u64) -> Result<()> {
        let result = sqlx::query("UPDATE job_runs SET total_items = ? WHERE id = ?")
            .bind(total as i64)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::JobNotFound {
                job_id: id.to_string(),
            });
        }

        Ok(())
    }

    async fn increment_processed(&self, id: JobRunId, count: u64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE job_runs SET processed_items = processed_items + ? WHERE id = ?",
        )
        .bind(count as i64)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::JobNotFound {
                job_id: id.to_string(),
            });
        }

        Ok(())
    }

    async fn record_outcomes(
        &self,
        id: JobRunId,
        created: u64,
        updated: u64,
        skipped: u64,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_runs SET
                created_items = created_items + ?,
                updated_items = updated_items + ?,
                skipped_items = skipped_items + ?
            WHERE id = ?
            "#,
        )
        .bind(created as i64)
        .bind(updated as i64)
        .bind(skipped as i64)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::JobNotFound {
                job_id: id.to_string(),
            });
        }

        Ok(())
    }

    async fn complete(
        &self,
        id: JobRunId,
        status: JobStatus,
        error_message: Option<&str>,
        completed_at: i64,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(SyncError::InvalidStateTransition {
                from: "active".to_string(),
                to: status.to_string(),
                reason: "Runs can only be completed into a terminal state".to_string(),
            });
        }

        let result = sqlx::query(
            r#"
            UPDATE job_runs SET
                status = ?,
                error_message = ?,
                completed_at = ?,
                progress = CASE WHEN ? = 'completed' THEN 100 ELSE progress END,
                progress_message = CASE WHEN ? = 'completed' THEN 'completed' ELSE progress_message END
            WHERE id = ? AND status IN ('created', 'running')
            "#,
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(completed_at)
        .bind(status.as_str())
        .bind(status.as_str())
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let current = self.ensure_exists(id).await?;
            return Err(SyncError::InvalidStateTransition {
                from: current.status.to_string(),
                to: status.to_string(),
                reason: "Run was already finalized".to_string(),
            });
        }

        Ok(())
    }

    async fn find_by_id(&self, id: JobRunId) -> Result<Option<JobRun>> {
        let row = sqlx::query_as::<_, JobRunRow>(&format!(
            "SELECT {} FROM job_runs WHERE id = ?",
            JOB_RUN_COLUMNS
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobRun::try_from).transpose()
    }

    async fn history(
        &self,
        user_id: UserId,
        client_id: ClientId,
        limit: u32,
    ) -> Result<Vec<JobRun>> {
        let rows = sqlx::query_as::<_, JobRunRow>(&format!(
            "SELECT {} FROM job_runs WHERE user_id = ? AND client_id = ? \
             ORDER BY created_at DESC, rowid DESC LIMIT ?",
            JOB_RUN_COLUMNS
        ))
        .bind(user_id.0)
        .bind(client_id.0)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(JobRun::try_from)
            .collect::<Result<Vec<_>>>()
    }
}

// ============================================================================
// SQLite Job Schedules
// ============================================================================

/// SQLite implementation of JobScheduleRepository
#[derive(Clone)]
pub struct SqliteJobScheduleRepository {
    pool: SqlitePool,
}

impl SqliteJobScheduleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct JobScheduleRow {
    id: String,
    user_id: i64,
    client_id: i64,
    media_kind: String,
    frequency_secs: i64,
    enabled: bool,
    last_run_time: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<JobScheduleRow> for JobSchedule {
    type Error = SyncError;

    fn try_from(row: JobScheduleRow) -> Result<Self> {
        Ok(JobSchedule {
            id: JobScheduleId::from_string(&row.id)?,
            user_id: UserId(row.user_id),
            client_id: ClientId(row.client_id),
            media_kind: row.media_kind.parse::<MediaKind>()?,
            frequency_secs: row.frequency_secs.max(0) as u64,
            enabled: row.enabled,
            last_run_time: row.last_run_time,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl JobScheduleRepository for SqliteJobScheduleRepository {
    async fn upsert(&self, schedule: &JobSchedule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_schedules (
                id, user_id, client_id, media_kind, frequency_secs, enabled,
                last_run_time, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, client_id, media_kind) DO UPDATE SET
                frequency_secs = excluded.frequency_secs,
                enabled = excluded.enabled,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(schedule.id.as_str())
        .bind(schedule.user_id.0)
        .bind(schedule.client_id.0)
        .bind(schedule.media_kind.as_str())
        .bind(schedule.frequency_secs as i64)
        .bind(schedule.enabled)
        .bind(schedule.last_run_time)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find(&self, target: SyncTarget) -> Result<Option<JobSchedule>> {
        let row = sqlx::query_as::<_, JobScheduleRow>(
            r#"
            SELECT * FROM job_schedules
            WHERE user_id = ? AND client_id = ? AND media_kind = ?
            "#,
        )
        .bind(target.user_id.0)
        .bind(target.client_id.0)
        .bind(target.media_kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobSchedule::try_from).transpose()
    }

    async fn list_enabled(&self) -> Result<Vec<JobSchedule>> {
        let rows = sqlx::query_as::<_, JobScheduleRow>(
            "SELECT * FROM job_schedules WHERE enabled = 1 ORDER BY created_at, rowid",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(JobSchedule::try_from)
            .collect::<Result<Vec<_>>>()
    }

    async fn stamp_last_run(&self, target: SyncTarget, at: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_schedules SET last_run_time = ?, updated_at = ?
            WHERE user_id = ? AND client_id = ? AND media_kind = ?
            "#,
        )
        .bind(at)
        .bind(at)
        .bind(target.user_id.0)
        .bind(target.client_id.0)
        .bind(target.media_kind.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

// ============================================================================
// Tests
// ============================================================================
