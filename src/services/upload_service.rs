//! src/services/upload_service.rs
//!
//! Chunked upload coordinator. Chunks may arrive in any order and may be
//! retried; each accepted chunk becomes blob-store part `chunk_index + 1`.
//! Ordering is enforced once, at completion.
//!
//! Completion is claimed through the session state (`Open -> Completing ->
//! Assembled`), so a session is assembled at most once. The assembled session
//! stays behind until the caller hands the object off and calls `finish`.

use crate::{
    models::upload_session::{SessionState, UploadSession, UploadedPart},
    services::{
        blob_store::{BlobError, BlobStore, CompletedPart},
        session_store::{SessionStore, SessionStoreError},
    },
};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound on declared chunks, matching common object-store part limits.
pub const MAX_TOTAL_CHUNKS: i64 = 10_000;
const MAX_FILE_NAME_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("upload session `{0}` not found")]
    SessionNotFound(String),
    #[error("upload `{upload_id}` is incomplete, missing parts {missing:?}")]
    IncompleteUpload { upload_id: String, missing: Vec<u32> },
    #[error("upload `{upload_id}` is {state} and no longer accepts changes")]
    SessionClosed {
        upload_id: String,
        state: SessionState,
    },
    #[error("blob store error: {0}")]
    Upstream(#[source] BlobError),
    #[error(transparent)]
    Store(SessionStoreError),
}

impl From<SessionStoreError> for UploadError {
    fn from(err: SessionStoreError) -> Self {
        match err {
            SessionStoreError::NotFound(id) => UploadError::SessionNotFound(id),
            SessionStoreError::NotOpen { upload_id, state } => {
                UploadError::SessionClosed { upload_id, state }
            }
            other => UploadError::Store(other),
        }
    }
}

pub type UploadResult<T> = Result<T, UploadError>;

/// Outcome of accepting one chunk.
#[derive(Clone, Debug)]
pub struct ChunkReceipt {
    pub part_number: u32,
    pub etag: String,
    pub accepted_count: usize,
    pub total_chunks: u32,
}

/// Outcome of a successful completion.
#[derive(Clone, Debug)]
pub struct CompletedUpload {
    pub object_key: String,
    pub file_name: String,
    pub total_chunks: u32,
}

impl From<&UploadSession> for CompletedUpload {
    fn from(session: &UploadSession) -> Self {
        Self {
            object_key: session.object_key.clone(),
            file_name: session.file_name.clone(),
            total_chunks: session.total_chunks,
        }
    }
}

#[derive(Clone)]
pub struct UploadService {
    blobs: Arc<dyn BlobStore>,
    sessions: Arc<dyn SessionStore>,
    session_ttl: Duration,
}

impl UploadService {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        sessions: Arc<dyn SessionStore>,
        session_ttl: Duration,
    ) -> Self {
        Self {
            blobs,
            sessions,
            session_ttl,
        }
    }

    /// Start a chunked upload and return the new session.
    pub async fn initialize(
        &self,
        file_name: &str,
        file_size: i64,
        total_chunks: i64,
    ) -> UploadResult<UploadSession> {
        let file_name = file_name.trim();
        if file_name.is_empty() || file_name.len() > MAX_FILE_NAME_LEN {
            return Err(UploadError::InvalidArgument(format!(
                "file_name must be 1-{MAX_FILE_NAME_LEN} bytes"
            )));
        }
        if file_size < 0 {
            return Err(UploadError::InvalidArgument(
                "file_size must be non-negative".into(),
            ));
        }
        if !(1..=MAX_TOTAL_CHUNKS).contains(&total_chunks) {
            return Err(UploadError::InvalidArgument(format!(
                "total_chunks must be between 1 and {MAX_TOTAL_CHUNKS}"
            )));
        }

        let now = Utc::now();
        let upload_id = Uuid::new_v4().to_string();
        let object_key = object_key_for(&upload_id, file_name, now);

        let multipart_id = self
            .blobs
            .create_multipart(&object_key)
            .await
            .map_err(UploadError::Upstream)?;

        let session = UploadSession {
            upload_id,
            object_key,
            multipart_id,
            // Range-checked above.
            total_chunks: total_chunks as u32,
            uploaded_parts: Default::default(),
            file_name: file_name.to_string(),
            declared_file_size: file_size as u64,
            state: SessionState::Open,
            created_at: now,
            expires_at: now + self.session_ttl,
        };

        if let Err(err) = self.sessions.insert(&session).await {
            if let Err(abort_err) = self
                .blobs
                .abort_multipart(&session.object_key, &session.multipart_id)
                .await
            {
                warn!(
                    "failed to abort multipart {} after session insert error: {}",
                    session.multipart_id, abort_err
                );
            }
            return Err(err.into());
        }

        info!(
            "initialized upload {} for {} ({} bytes, {} chunks)",
            session.upload_id, session.file_name, file_size, total_chunks
        );
        Ok(session)
    }

    /// Store one chunk. Re-sending the same `chunk_index` replaces the earlier part.
    pub async fn accept_chunk(
        &self,
        upload_id: &str,
        chunk_index: u32,
        bytes: Bytes,
    ) -> UploadResult<ChunkReceipt> {
        let session = self.live_session(upload_id).await?;
        if session.state != SessionState::Open {
            return Err(UploadError::SessionClosed {
                upload_id: upload_id.to_string(),
                state: session.state,
            });
        }
        if chunk_index >= session.total_chunks {
            return Err(UploadError::InvalidArgument(format!(
                "chunk_index {} out of range for {} chunks",
                chunk_index, session.total_chunks
            )));
        }

        let part_number = chunk_index + 1;
        let size_bytes = bytes.len() as u64;
        let etag = self
            .blobs
            .upload_part(&session.object_key, &session.multipart_id, part_number, bytes)
            .await
            .map_err(UploadError::Upstream)?;

        let accepted_count = self
            .sessions
            .record_part(
                upload_id,
                UploadedPart {
                    part_number,
                    etag: etag.clone(),
                    size_bytes,
                    uploaded_at: Utc::now(),
                },
            )
            .await?;

        debug!(
            "upload {} accepted part {} ({} bytes), {}/{}",
            upload_id, part_number, size_bytes, accepted_count, session.total_chunks
        );

        Ok(ChunkReceipt {
            part_number,
            etag,
            accepted_count,
            total_chunks: session.total_chunks,
        })
    }

    /// Assemble the object once every part is present.
    ///
    /// One caller claims the session and assembles it; a concurrent caller
    /// gets `SessionClosed`. Completing an assembled session again returns
    /// the same object without touching the blob store. A failed assembly
    /// reopens the session so the client can fill gaps or retry.
    pub async fn complete(&self, upload_id: &str) -> UploadResult<CompletedUpload> {
        let session = self.live_session(upload_id).await?;
        match session.state {
            SessionState::Open => Self::ensure_all_parts(&session)?,
            SessionState::Assembled => return Ok(CompletedUpload::from(&session)),
            SessionState::Completing => {
                return Err(UploadError::SessionClosed {
                    upload_id: upload_id.to_string(),
                    state: session.state,
                });
            }
        }

        let Some(session) = self
            .sessions
            .transition(upload_id, SessionState::Open, SessionState::Completing)
            .await?
        else {
            // Someone else moved it first.
            let current = self.live_session(upload_id).await?;
            if current.state == SessionState::Assembled {
                return Ok(CompletedUpload::from(&current));
            }
            return Err(UploadError::SessionClosed {
                upload_id: upload_id.to_string(),
                state: current.state,
            });
        };

        if let Err(err) = Self::ensure_all_parts(&session) {
            self.reopen(upload_id).await;
            return Err(err);
        }

        // BTreeMap iteration is already ascending by part number.
        let parts: Vec<CompletedPart> = session
            .uploaded_parts
            .values()
            .map(|p| CompletedPart {
                part_number: p.part_number,
                etag: p.etag.clone(),
            })
            .collect();

        if let Err(err) = self
            .blobs
            .complete_multipart(&session.object_key, &session.multipart_id, &parts)
            .await
        {
            self.reopen(upload_id).await;
            return Err(UploadError::Upstream(err));
        }

        // The object exists from here on; a bookkeeping miss is left to the reaper.
        match self
            .sessions
            .transition(upload_id, SessionState::Completing, SessionState::Assembled)
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => warn!("upload {} was removed while completing", upload_id),
            Err(err) => warn!("failed to mark upload {} assembled: {}", upload_id, err),
        }

        info!(
            "completed upload {} into {} ({} parts)",
            upload_id,
            session.object_key,
            parts.len()
        );
        Ok(CompletedUpload::from(&session))
    }

    /// Drop an assembled session once its object has been handed off.
    pub async fn finish(&self, upload_id: &str) -> UploadResult<()> {
        if self.sessions.remove(upload_id).await?.is_some() {
            debug!("released upload session {}", upload_id);
        }
        Ok(())
    }

    /// Drop a session and abort its multipart upload. A missing session is a
    /// no-op, and so is one that is being completed: the completion wins.
    pub async fn cancel(&self, upload_id: &str) -> UploadResult<()> {
        match self.sessions.remove(upload_id).await {
            Ok(Some(session)) => {
                if session.state == SessionState::Open {
                    self.abort_quietly(&session).await;
                }
                info!("cancelled upload {}", upload_id);
            }
            Ok(None) => debug!("cancel for unknown upload {}", upload_id),
            Err(SessionStoreError::NotOpen { state, .. }) => {
                info!("ignoring cancel for upload {}, it is {}", upload_id, state)
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    /// Current view of a live session.
    pub async fn status(&self, upload_id: &str) -> UploadResult<UploadSession> {
        self.live_session(upload_id).await
    }

    /// Remove sessions whose TTL elapsed and abort their multipart uploads.
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> UploadResult<usize> {
        let expired = self.sessions.take_expired(now).await?;
        for session in &expired {
            self.abort_quietly(session).await;
        }
        if !expired.is_empty() {
            info!("reaped {} expired upload sessions", expired.len());
        }
        Ok(expired.len())
    }

    async fn live_session(&self, upload_id: &str) -> UploadResult<UploadSession> {
        self.sessions
            .get(upload_id)
            .await?
            .ok_or_else(|| UploadError::SessionNotFound(upload_id.to_string()))
    }

    fn ensure_all_parts(session: &UploadSession) -> UploadResult<()> {
        let missing = session.missing_parts();
        if session.accepted_count() != session.total_chunks as usize || !missing.is_empty() {
            return Err(UploadError::IncompleteUpload {
                upload_id: session.upload_id.clone(),
                missing,
            });
        }
        Ok(())
    }

    /// Hand a claimed session back after a failed assembly.
    async fn reopen(&self, upload_id: &str) {
        match self
            .sessions
            .transition(upload_id, SessionState::Completing, SessionState::Open)
            .await
        {
            Ok(Some(_)) => debug!("reopened upload {}", upload_id),
            Ok(None) => warn!("upload {} was removed while completing", upload_id),
            Err(err) => warn!("failed to reopen upload {}: {}", upload_id, err),
        }
    }

    async fn abort_quietly(&self, session: &UploadSession) {
        match self
            .blobs
            .abort_multipart(&session.object_key, &session.multipart_id)
            .await
        {
            Ok(()) => {}
            Err(BlobError::NotFound(_)) => {
                debug!("multipart {} already gone", session.multipart_id)
            }
            Err(err) => warn!(
                "failed to abort multipart {} for upload {}: {}",
                session.multipart_id, session.upload_id, err
            ),
        }
    }
}

/// Periodically reap expired sessions until the runtime shuts down.
pub fn spawn_session_reaper(service: UploadService, every: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = service.reap_expired(Utc::now()).await {
                warn!("session reaper pass failed: {}", err);
            }
        }
    })
}

/// `imports/{yyyy}/{mm}/{dd}/{upload_id}-{file name}` with the file name
/// reduced to a safe character set.
fn object_key_for(upload_id: &str, file_name: &str, now: DateTime<Utc>) -> String {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    let mut safe: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    while safe.contains("..") {
        safe = safe.replace("..", ".");
    }
    let safe = safe.trim_matches('.');
    let safe = if safe.is_empty() { "upload" } else { safe };
    format!("imports/{}/{}-{}", now.format("%Y/%m/%d"), upload_id, safe)
}
