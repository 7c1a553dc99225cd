//! Represents an in-flight chunked upload and the parts accepted so far.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where a session is in its lifecycle.
///
/// `Open -> Completing -> Assembled`. A failed assembly goes back to `Open`.
/// Only `Open` sessions accept parts; only one caller can move a session out
/// of `Open` into `Completing`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Open,
    Completing,
    Assembled,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Open => "open",
            SessionState::Completing => "completing",
            SessionState::Assembled => "assembled",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single part accepted by the blob store for a multipart upload.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UploadedPart {
    /// Part number (1-based, `chunk_index + 1`).
    pub part_number: u32,

    /// ETag returned by the blob store for this part.
    pub etag: String,

    /// Size of the part payload in bytes.
    pub size_bytes: u64,

    /// When this part was last (re)uploaded.
    pub uploaded_at: DateTime<Utc>,
}

/// A chunked upload session.
///
/// `uploaded_parts` is keyed by part number so a retried chunk replaces the
/// previous entry instead of adding another one.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct UploadSession {
    /// Client-facing handle for this upload.
    pub upload_id: String,

    /// Destination key of the assembled object.
    pub object_key: String,

    /// Handle returned by the blob store when the multipart upload began.
    pub multipart_id: String,

    /// Number of chunks declared by the client at init.
    pub total_chunks: u32,

    /// Accepted parts, keyed by part number.
    pub uploaded_parts: BTreeMap<u32, UploadedPart>,

    /// Original filename supplied by the client (metadata only).
    pub file_name: String,

    /// File size declared by the client (metadata only).
    pub declared_file_size: u64,

    pub state: SessionState,

    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn accepted_count(&self) -> usize {
        self.uploaded_parts.len()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Part numbers in `[1, total_chunks]` that have not been accepted yet.
    pub fn missing_parts(&self) -> Vec<u32> {
        (1..=self.total_chunks)
            .filter(|n| !self.uploaded_parts.contains_key(n))
            .collect()
    }
}
