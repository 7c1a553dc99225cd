use crate::services::{
    blob_store::BlobError,
    import_service::JobError,
    upload_service::UploadError,
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// Error returned by every handler, rendered as `{"error", "status"}` JSON.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("request failed with {}: {}", self.status, self.message);
        }
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<BlobError> for AppError {
    fn from(err: BlobError) -> Self {
        let status = match &err {
            BlobError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            BlobError::NotFound(_) | BlobError::InvalidKey(_) | BlobError::InvalidPart { .. } => {
                StatusCode::BAD_GATEWAY
            }
        };
        AppError::new(status, err.to_string())
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::InvalidArgument(_) => AppError::bad_request(err.to_string()),
            UploadError::SessionNotFound(_) => AppError::not_found(err.to_string()),
            UploadError::IncompleteUpload { .. } | UploadError::SessionClosed { .. } => {
                AppError::new(StatusCode::CONFLICT, err.to_string())
            }
            UploadError::Upstream(blob) => {
                let mapped = AppError::from(blob);
                AppError::new(mapped.status, format!("blob store error: {}", mapped.message))
            }
            UploadError::Store(_) => AppError::internal(err.to_string()),
        }
    }
}

impl From<JobError> for AppError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::NotFound(_) => AppError::not_found(err.to_string()),
            JobError::Queue(_) => AppError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
            JobError::Store(_) => AppError::internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::upload_session::SessionState, services::job_queue::QueueError};
    use std::io;

    #[test]
    fn upload_errors_map_to_client_statuses() {
        let cases = [
            (UploadError::InvalidArgument("x".into()), StatusCode::BAD_REQUEST),
            (UploadError::SessionNotFound("u".into()), StatusCode::NOT_FOUND),
            (
                UploadError::IncompleteUpload {
                    upload_id: "u".into(),
                    missing: vec![2],
                },
                StatusCode::CONFLICT,
            ),
            (
                UploadError::SessionClosed {
                    upload_id: "u".into(),
                    state: SessionState::Completing,
                },
                StatusCode::CONFLICT,
            ),
            (
                UploadError::Upstream(BlobError::StorageUnavailable(io::Error::other("disk"))),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                UploadError::Upstream(BlobError::NotFound("m".into())),
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn job_errors_map_to_statuses() {
        assert_eq!(
            AppError::from(JobError::NotFound("j".into())).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::from(JobError::Queue(QueueError::Closed)).status,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
