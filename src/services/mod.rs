pub mod blob_store;
pub mod contact_store;
pub mod import_service;
pub mod ingest;
pub mod job_queue;
pub mod job_store;
pub mod row_mapper;
pub mod session_store;
pub mod upload_service;
