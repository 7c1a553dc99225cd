//! Liveness and readiness.
//!
//! `/readyz` answers for the two things an import needs: the SQLite store
//! that holds sessions, jobs and contacts, and the object directory chunks
//! are staged in. It also reports how many jobs are queued or running.

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use sqlx::SqlitePool;
use std::{collections::BTreeMap, path::Path};
use tokio::fs;
use uuid::Uuid;

#[derive(Serialize)]
struct Liveness {
    status: &'static str,
}

#[derive(Serialize)]
struct Readiness {
    status: &'static str,
    active_jobs: Option<i64>,
    checks: BTreeMap<&'static str, Check>,
}

#[derive(Serialize)]
struct Check {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> From<&Result<T, String>> for Check {
    fn from(result: &Result<T, String>) -> Self {
        Self {
            ok: result.is_ok(),
            error: result.as_ref().err().cloned(),
        }
    }
}

/// `GET /healthz`, no I/O.
pub async fn healthz() -> impl IntoResponse {
    Json(Liveness { status: "ok" })
}

/// `GET /readyz`, 503 when either check fails.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let jobs = active_jobs(&state.db).await;
    let storage = storage_writable(&state.storage_dir).await;

    let ready = jobs.is_ok() && storage.is_ok();
    let body = Readiness {
        status: if ready { "ok" } else { "unavailable" },
        active_jobs: jobs.as_ref().ok().copied(),
        checks: BTreeMap::from([("sqlite", Check::from(&jobs)), ("storage", Check::from(&storage))]),
    };
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

/// Jobs a worker still owes an answer for. Reads the job table, so a missing
/// schema fails readiness too.
async fn active_jobs(db: &SqlitePool) -> Result<i64, String> {
    sqlx::query_scalar("SELECT COUNT(*) FROM import_jobs WHERE status IN ('pending', 'running')")
        .fetch_one(db)
        .await
        .map_err(|err| format!("import_jobs unreadable: {err}"))
}

/// Write, read back and delete a scratch file where chunks are staged.
async fn storage_writable(dir: &Path) -> Result<(), String> {
    let scratch = dir.join(format!(".readyz-{}", Uuid::new_v4()));
    let round_trip = async {
        fs::write(&scratch, b"readyz").await?;
        fs::read(&scratch).await
    }
    .await;
    let removed = fs::remove_file(&scratch).await;

    match round_trip {
        Ok(bytes) if bytes == b"readyz" => {}
        Ok(_) => return Err("scratch file read back altered".into()),
        Err(err) => return Err(format!("{}: {err}", dir.display())),
    }
    removed.map_err(|err| format!("scratch file left behind: {err}"))
}
