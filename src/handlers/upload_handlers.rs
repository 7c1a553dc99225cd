//! HTTP handlers for the chunked upload protocol.
//! Chunk bodies arrive raw; completion hands the assembled object to the
//! import job controller.

use crate::{
    errors::AppError,
    models::upload_session::{SessionState, UploadSession},
    state::AppState,
};
use axum::{
    Json,
    body::Bytes,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct InitUploadReq {
    pub file_name: String,
    pub file_size: i64,
    pub total_chunks: i64,
}

#[derive(Debug, Serialize)]
pub struct InitUploadResp {
    pub upload_id: String,
    pub object_key: String,
    pub total_chunks: u32,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ChunkResp {
    pub upload_id: String,
    pub chunk_index: u32,
    pub part_number: u32,
    pub etag: String,
    pub accepted_count: usize,
    pub total_chunks: u32,
}

#[derive(Debug, Serialize)]
pub struct CompleteResp {
    pub object_key: String,
    pub job_id: String,
}

/// What a client needs to resume an interrupted upload.
#[derive(Debug, Serialize)]
pub struct UploadStatusResp {
    pub upload_id: String,
    pub object_key: String,
    pub state: SessionState,
    pub file_name: String,
    pub declared_file_size: u64,
    pub total_chunks: u32,
    pub accepted_count: usize,
    pub uploaded_parts: Vec<u32>,
    pub missing_parts: Vec<u32>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<UploadSession> for UploadStatusResp {
    fn from(session: UploadSession) -> Self {
        Self {
            accepted_count: session.accepted_count(),
            uploaded_parts: session.uploaded_parts.keys().copied().collect(),
            missing_parts: session.missing_parts(),
            upload_id: session.upload_id,
            object_key: session.object_key,
            state: session.state,
            file_name: session.file_name,
            declared_file_size: session.declared_file_size,
            total_chunks: session.total_chunks,
            created_at: session.created_at,
            expires_at: session.expires_at,
        }
    }
}

/// `POST /uploads`
pub async fn init_upload(
    State(state): State<AppState>,
    payload: Result<Json<InitUploadReq>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(req) = payload.map_err(|rejection| AppError::bad_request(rejection.body_text()))?;
    let session = state
        .uploads
        .initialize(&req.file_name, req.file_size, req.total_chunks)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(InitUploadResp {
            upload_id: session.upload_id,
            object_key: session.object_key,
            total_chunks: session.total_chunks,
            expires_at: session.expires_at,
        }),
    ))
}

/// `PUT /uploads/{upload_id}/chunks/{chunk_index}`
pub async fn upload_chunk(
    State(state): State<AppState>,
    Path((upload_id, chunk_index)): Path<(String, u32)>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let receipt = state
        .uploads
        .accept_chunk(&upload_id, chunk_index, body)
        .await?;

    Ok(Json(ChunkResp {
        upload_id,
        chunk_index,
        part_number: receipt.part_number,
        etag: receipt.etag,
        accepted_count: receipt.accepted_count,
        total_chunks: receipt.total_chunks,
    }))
}

/// `POST /uploads/{upload_id}/complete`
///
/// The session outlives assembly until the job exists, so a failed dispatch
/// can be retried with the same request.
pub async fn complete_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let completed = state.uploads.complete(&upload_id).await?;
    let job = state
        .imports
        .dispatch(&completed.object_key, Some(&upload_id))
        .await?;
    if let Err(err) = state.uploads.finish(&upload_id).await {
        tracing::warn!("upload {} handed off but not released: {}", upload_id, err);
    }
    tracing::info!(
        "upload {} ({}, {} chunks) handed to job {}",
        upload_id,
        completed.file_name,
        completed.total_chunks,
        job.id
    );

    Ok(Json(CompleteResp {
        object_key: completed.object_key,
        job_id: job.id,
    }))
}

/// `DELETE /uploads/{upload_id}`, always 204.
pub async fn cancel_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state.uploads.cancel(&upload_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /uploads/{upload_id}`
pub async fn get_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let session = state.uploads.status(&upload_id).await?;
    Ok(Json(UploadStatusResp::from(session)))
}
