use anyhow::{Context, Result};
use axum::Router;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;

use services::{
    blob_store::{BlobStore, LocalBlobStore},
    contact_store::SqliteContactStore,
    import_service::ImportJobService,
    ingest::IngestPipeline,
    job_queue::{ChannelQueue, spawn_workers},
    job_store::JobStore,
    session_store::{MemorySessionStore, SessionStore, SqliteSessionStore},
    upload_service::{UploadService, spawn_session_reaper},
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting contact-import with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)
            .with_context(|| format!("creating storage directory {}", cfg.storage_dir))?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url, 5).await?);
    db::run_migrations(&db).await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core services ---
    let local_blobs = LocalBlobStore::new(&cfg.storage_dir);
    let storage_dir = local_blobs.base_path().to_path_buf();
    let blobs: Arc<dyn BlobStore> = Arc::new(local_blobs);
    let sessions: Arc<dyn SessionStore> = match cfg.session_backend {
        config::SessionBackend::Sqlite => Arc::new(SqliteSessionStore::new(db.clone())),
        config::SessionBackend::Memory => {
            tracing::warn!("Upload sessions are kept in memory and will not survive a restart");
            Arc::new(MemorySessionStore::new())
        }
    };
    let uploads = UploadService::new(blobs.clone(), sessions, cfg.session_ttl());
    let jobs = JobStore::new(db.clone());
    let (queue, receiver) = ChannelQueue::new();
    let imports = ImportJobService::new(jobs.clone(), Arc::new(queue));

    // Recovery runs before any worker can claim a job.
    let report = imports.recover().await?;
    tracing::info!(
        "Recovery: {} interrupted jobs failed, {} pending jobs re-enqueued",
        report.interrupted,
        report.requeued
    );

    let pipeline = IngestPipeline::new(
        blobs,
        Arc::new(SqliteContactStore::new(db.clone())),
        jobs,
        cfg.batch_size,
    );
    let _workers = spawn_workers(cfg.workers, receiver, pipeline);
    let _reaper = spawn_session_reaper(uploads.clone(), cfg.reaper_interval());

    // --- Build router ---
    let app_state = state::AppState {
        uploads,
        imports,
        db,
        storage_dir,
    };
    let app: Router = routes::routes::routes(cfg.max_chunk_bytes).with_state(app_state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
