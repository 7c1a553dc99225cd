//! Core data models for the contact import service.
//!
//! Upload sessions track in-flight chunked uploads, import jobs carry the
//! lifecycle and progress of one ingest run, and contacts are what it writes.
//! Rows map to database tables via `sqlx::FromRow` and serialize as JSON via
//! `serde`.

pub mod contact;
pub mod import_job;
pub mod upload_session;
