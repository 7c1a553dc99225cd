//! Contact records written by the ingest pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A contact parsed from one CSV row, ready to upsert.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct NewContact {
    /// Natural key used for duplicate detection (see `services::contact_store::dedup_key`).
    pub dedup_key: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub title: Option<String>,
    pub linkedin_url: Option<String>,
    pub location: Option<String>,

    /// Columns that did not map onto a known field, as a JSON object.
    pub extra: Option<String>,
}

/// A stored contact.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Contact {
    pub dedup_key: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub title: Option<String>,
    pub linkedin_url: Option<String>,
    pub location: Option<String>,
    pub extra: Option<String>,

    /// Job that last wrote this record.
    pub source_job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
