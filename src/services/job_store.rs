//! src/services/job_store.rs
//!
//! Import job records and their live progress. Polling readers only run
//! plain SELECTs; the single worker that claimed a job is its only writer,
//! apart from the `cancel_requested` flag.

use crate::models::import_job::{ErrorLog, FailureReason, ImportJob, JobProgress, JobStatus};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("import job `{0}` not found")]
    NotFound(String),
    #[error("failed to encode error log: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type JobStoreResult<T> = Result<T, JobStoreError>;

const JOB_COLUMNS: &str = "id, upload_id, source_object_key, status, total_rows, processed_rows, \
     success_count, error_count, duplicate_count, current_batch, total_batches, \
     cancel_requested, error_log, created_at, started_at, completed_at, updated_at";

#[derive(Clone)]
pub struct JobStore {
    db: Arc<SqlitePool>,
}

impl JobStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn create(&self, source_object_key: &str) -> JobStoreResult<ImportJob> {
        let now = Utc::now();
        Ok(sqlx::query_as::<_, ImportJob>(&format!(
            "INSERT INTO import_jobs (id, source_object_key, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(source_object_key)
        .bind(JobStatus::Pending.as_str())
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await?)
    }

    /// Create the job for a completed upload, or return the one that already
    /// exists. The flag is `true` only when this call created it.
    pub async fn create_for_upload(
        &self,
        upload_id: &str,
        source_object_key: &str,
    ) -> JobStoreResult<(ImportJob, bool)> {
        let now = Utc::now();
        let created = sqlx::query_as::<_, ImportJob>(&format!(
            "INSERT INTO import_jobs (id, upload_id, source_object_key, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(upload_id) DO NOTHING
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(upload_id)
        .bind(source_object_key)
        .bind(JobStatus::Pending.as_str())
        .bind(now)
        .bind(now)
        .fetch_optional(&*self.db)
        .await?;
        if let Some(job) = created {
            return Ok((job, true));
        }

        let existing = sqlx::query_as::<_, ImportJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM import_jobs WHERE upload_id = ?"
        ))
        .bind(upload_id)
        .fetch_one(&*self.db)
        .await?;
        Ok((existing, false))
    }

    pub async fn get(&self, id: &str) -> JobStoreResult<Option<ImportJob>> {
        Ok(sqlx::query_as::<_, ImportJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM import_jobs WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?)
    }

    /// Most recent jobs first.
    pub async fn list(&self, limit: u32) -> JobStoreResult<Vec<ImportJob>> {
        Ok(sqlx::query_as::<_, ImportJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM import_jobs ORDER BY rowid DESC LIMIT ?"
        ))
        .bind(i64::from(limit))
        .fetch_all(&*self.db)
        .await?)
    }

    pub async fn list_by_status(&self, status: JobStatus) -> JobStoreResult<Vec<ImportJob>> {
        Ok(sqlx::query_as::<_, ImportJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM import_jobs WHERE status = ? ORDER BY rowid"
        ))
        .bind(status.as_str())
        .fetch_all(&*self.db)
        .await?)
    }

    /// Move a job from `Pending` to `Running`. Only one caller can win; the
    /// rest get `false` and must not touch the job.
    pub async fn claim(&self, id: &str) -> JobStoreResult<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE import_jobs SET status = ?, started_at = ?, updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(JobStatus::Running.as_str())
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(JobStatus::Pending.as_str())
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Publish counters for a running job.
    pub async fn update_progress(&self, id: &str, progress: &JobProgress) -> JobStoreResult<()> {
        sqlx::query(
            "UPDATE import_jobs SET
                total_rows = ?, processed_rows = ?, success_count = ?, error_count = ?,
                duplicate_count = ?, current_batch = ?, total_batches = ?, updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(progress.total_rows)
        .bind(progress.processed_rows)
        .bind(progress.success_count)
        .bind(progress.error_count)
        .bind(progress.duplicate_count)
        .bind(progress.current_batch)
        .bind(progress.total_batches)
        .bind(Utc::now())
        .bind(id)
        .bind(JobStatus::Running.as_str())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Move a pending or running job into a terminal state with its final counters.
    pub async fn finish(
        &self,
        id: &str,
        status: JobStatus,
        progress: &JobProgress,
        error_log: &ErrorLog,
    ) -> JobStoreResult<()> {
        debug_assert!(status.is_terminal());
        let error_log = if error_log.is_empty() {
            None
        } else {
            Some(serde_json::to_string(error_log)?)
        };
        let now = Utc::now();
        sqlx::query(
            "UPDATE import_jobs SET
                status = ?, total_rows = ?, processed_rows = ?, success_count = ?,
                error_count = ?, duplicate_count = ?, current_batch = ?, total_batches = ?,
                error_log = ?, completed_at = ?, updated_at = ?
             WHERE id = ? AND status IN ('pending', 'running')",
        )
        .bind(status.as_str())
        .bind(progress.total_rows)
        .bind(progress.processed_rows)
        .bind(progress.success_count)
        .bind(progress.error_count)
        .bind(progress.duplicate_count)
        .bind(progress.current_batch)
        .bind(progress.total_batches)
        .bind(error_log)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Flag a job for cooperative cancellation. Terminal jobs are left alone.
    pub async fn request_cancel(&self, id: &str) -> JobStoreResult<ImportJob> {
        sqlx::query(
            "UPDATE import_jobs SET cancel_requested = 1, updated_at = ?
             WHERE id = ? AND status IN ('pending', 'running')",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await?;
        self.get(id)
            .await?
            .ok_or_else(|| JobStoreError::NotFound(id.to_string()))
    }

    pub async fn is_cancel_requested(&self, id: &str) -> JobStoreResult<bool> {
        let flag: Option<bool> =
            sqlx::query_scalar("SELECT cancel_requested FROM import_jobs WHERE id = ?")
                .bind(id)
                .fetch_optional(&*self.db)
                .await?;
        flag.ok_or_else(|| JobStoreError::NotFound(id.to_string()))
    }

    /// Fail every job still marked running. Called at startup, before any
    /// worker exists, for jobs whose worker died with the previous process.
    pub async fn fail_interrupted(&self) -> JobStoreResult<u64> {
        let log = serde_json::to_string(&ErrorLog::failure(
            FailureReason::Interrupted,
            "worker stopped before the job finished",
        ))?;
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE import_jobs SET status = ?, error_log = ?, completed_at = ?, updated_at = ?
             WHERE status = ?",
        )
        .bind(JobStatus::Failed.as_str())
        .bind(log)
        .bind(now)
        .bind(now)
        .bind(JobStatus::Running.as_str())
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected())
    }
}
