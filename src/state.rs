//! Shared state handed to every handler.

use crate::services::{import_service::ImportJobService, upload_service::UploadService};
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};

#[derive(Clone)]
pub struct AppState {
    pub uploads: UploadService,
    pub imports: ImportJobService,
    /// Used by readiness checks only.
    pub db: Arc<SqlitePool>,
    pub storage_dir: PathBuf,
}
