//! Import job status, cancellation and history.

use crate::{
    errors::AppError,
    models::import_job::{ErrorLog, ImportJob, JobStatus},
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub limit: Option<u32>,
}

/// Job snapshot as returned to polling clients.
#[derive(Debug, Serialize)]
pub struct JobView {
    pub job_id: String,
    pub upload_id: Option<String>,
    pub source_object_key: String,
    pub status: JobStatus,
    pub total_rows: i64,
    pub processed_rows: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub duplicate_count: i64,
    pub current_batch: i64,
    pub total_batches: i64,
    pub progress_percentage: f64,
    pub cancel_requested: bool,
    pub error_log: Option<ErrorLog>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl From<ImportJob> for JobView {
    fn from(job: ImportJob) -> Self {
        Self {
            progress_percentage: job.progress_percentage(),
            error_log: job.parsed_error_log(),
            job_id: job.id,
            upload_id: job.upload_id,
            source_object_key: job.source_object_key,
            status: job.status,
            total_rows: job.total_rows,
            processed_rows: job.processed_rows,
            success_count: job.success_count,
            error_count: job.error_count,
            duplicate_count: job.duplicate_count,
            current_batch: job.current_batch,
            total_batches: job.total_batches,
            cancel_requested: job.cancel_requested,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            updated_at: job.updated_at,
        }
    }
}

/// `GET /jobs/{job_id}`
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let job = state.imports.get_status(&job_id).await?;
    Ok(Json(JobView::from(job)))
}

/// `POST /jobs/{job_id}/cancel`
///
/// Accepted, not applied: the worker stops at its next batch boundary.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let job = state.imports.request_cancel(&job_id).await?;
    Ok((StatusCode::ACCEPTED, Json(JobView::from(job))))
}

/// `GET /jobs?limit=N`
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<impl IntoResponse, AppError> {
    let jobs = state.imports.list(query.limit).await?;
    Ok(Json(jobs.into_iter().map(JobView::from).collect::<Vec<_>>()))
}
