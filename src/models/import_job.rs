//! Import job record: lifecycle state plus the live progress metrics polled by clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle of an import job.
///
/// `Pending -> Running -> Completed | Failed | Cancelled`. A pending job may
/// also be cancelled or failed before a worker picks it up.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Why a job entered `Failed`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The source object does not exist in the blob store.
    SourceMissing,
    /// The source object has no header row.
    EmptyFile,
    /// The source stream could not be read or parsed.
    SourceUnreadable,
    /// The contact store or status store rejected a write.
    StoreError,
    /// The process stopped while the job was running.
    Interrupted,
}

/// A malformed or unusable data row, recorded for the client.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RowError {
    /// 1-based line of the record in the source file (header is line 1).
    pub line: u64,
    pub reason: String,
}

/// Structured contents of `import_jobs.error_log`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ErrorLog {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// First rows that were skipped, capped at `ErrorLog::MAX_ROW_ERRORS`.
    #[serde(default)]
    pub row_errors: Vec<RowError>,
}

impl ErrorLog {
    pub const MAX_ROW_ERRORS: usize = 100;

    pub fn failure(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason: Some(reason),
            message: Some(message.into()),
            row_errors: Vec::new(),
        }
    }

    pub fn push_row_error(&mut self, line: u64, reason: impl Into<String>) {
        if self.row_errors.len() < Self::MAX_ROW_ERRORS {
            self.row_errors.push(RowError {
                line,
                reason: reason.into(),
            });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.reason.is_none() && self.message.is_none() && self.row_errors.is_empty()
    }
}

/// Snapshot of an import job as stored in the status store.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ImportJob {
    pub id: String,

    /// Upload whose completion created this job. At most one job per upload.
    pub upload_id: Option<String>,

    /// Key of the completed upload being ingested.
    pub source_object_key: String,

    pub status: JobStatus,

    /// Data rows in the source, counted when the stream opens and corrected at completion.
    pub total_rows: i64,
    pub processed_rows: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub duplicate_count: i64,
    pub current_batch: i64,
    pub total_batches: i64,

    /// Set by any caller, observed by the worker at batch boundaries.
    pub cancel_requested: bool,

    /// JSON-encoded `ErrorLog`.
    pub error_log: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ImportJob {
    /// Share of rows processed, 0.0..=100.0.
    pub fn progress_percentage(&self) -> f64 {
        if self.total_rows <= 0 {
            return if self.status == JobStatus::Completed {
                100.0
            } else {
                0.0
            };
        }
        let pct = self.processed_rows as f64 / self.total_rows as f64 * 100.0;
        pct.clamp(0.0, 100.0)
    }

    pub fn parsed_error_log(&self) -> Option<ErrorLog> {
        self.error_log
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// Counters written after each batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JobProgress {
    pub total_rows: i64,
    pub processed_rows: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub duplicate_count: i64,
    pub current_batch: i64,
    pub total_batches: i64,
}
