//! Defines routes for the upload protocol and import job endpoints.
//!
//! ## Structure
//! - **Upload endpoints**
//!   - `POST   /uploads` -> start a chunked upload
//!   - `GET    /uploads/{upload_id}` -> session view for resuming
//!   - `DELETE /uploads/{upload_id}` -> cancel, idempotent
//!   - `PUT    /uploads/{upload_id}/chunks/{chunk_index}` -> raw chunk body
//!   - `POST   /uploads/{upload_id}/complete` -> assemble and dispatch an import job
//!
//! - **Job endpoints**
//!   - `GET    /jobs` -> recent jobs, newest first
//!   - `GET    /jobs/{job_id}` -> status snapshot
//!   - `POST   /jobs/{job_id}/cancel` -> cooperative cancel

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        job_handlers::{cancel_job, get_job, list_jobs},
        upload_handlers::{cancel_upload, complete_upload, get_upload, init_upload, upload_chunk},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};

/// Build the router. Request bodies above `max_chunk_bytes` are rejected with 413.
pub fn routes(max_chunk_bytes: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/uploads", post(init_upload))
        .route("/uploads/{upload_id}", get(get_upload).delete(cancel_upload))
        .route("/uploads/{upload_id}/chunks/{chunk_index}", put(upload_chunk))
        .route("/uploads/{upload_id}/complete", post(complete_upload))
        .route("/jobs", get(list_jobs))
        .route("/jobs/{job_id}", get(get_job))
        .route("/jobs/{job_id}/cancel", post(cancel_job))
        .layer(DefaultBodyLimit::max(max_chunk_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db,
        services::{
            blob_store::{BlobStore, LocalBlobStore},
            contact_store::SqliteContactStore,
            import_service::ImportJobService,
            ingest::IngestPipeline,
            job_queue::{ChannelQueue, spawn_workers},
            job_store::JobStore,
            session_store::SqliteSessionStore,
            upload_service::UploadService,
        },
    };
    use axum::{
        body::{Body, to_bytes},
        http::{Method, Request, StatusCode},
    };
    use serde_json::{Value, json};
    use sqlx::SqlitePool;
    use std::{sync::Arc, time::Duration};
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn app() -> (Router, TempDir) {
        let (app, dir, _pool) = app_with_pool().await;
        (app, dir)
    }

    async fn app_with_pool() -> (Router, TempDir, Arc<SqlitePool>) {
        let dir = TempDir::new().unwrap();
        let pool = Arc::new(db::memory_pool().await.unwrap());
        let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(dir.path()));
        let uploads = UploadService::new(
            blobs.clone(),
            Arc::new(SqliteSessionStore::new(pool.clone())),
            chrono::Duration::hours(1),
        );
        let jobs = JobStore::new(pool.clone());
        let (queue, receiver) = ChannelQueue::new();
        let pipeline = IngestPipeline::new(
            blobs,
            Arc::new(SqliteContactStore::new(pool.clone())),
            jobs.clone(),
            2,
        );
        spawn_workers(1, receiver, pipeline);

        let state = AppState {
            uploads,
            imports: ImportJobService::new(jobs, Arc::new(queue)),
            db: pool.clone(),
            storage_dir: dir.path().to_path_buf(),
        };
        (routes(1024).with_state(state), dir, pool)
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Body) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn init(app: &Router, total_chunks: i64) -> String {
        let body = json!({"file_name": "contacts.csv", "file_size": 64, "total_chunks": total_chunks});
        let (status, value) = send(app, Method::POST, "/uploads", Body::from(body.to_string())).await;
        assert_eq!(status, StatusCode::CREATED);
        value["upload_id"].as_str().unwrap().to_string()
    }

    async fn wait_for_terminal(app: &Router, job_id: &str) -> Value {
        for _ in 0..200 {
            let (status, job) = send(app, Method::GET, &format!("/jobs/{job_id}"), Body::empty()).await;
            assert_eq!(status, StatusCode::OK);
            if matches!(job["status"].as_str(), Some("completed" | "failed" | "cancelled")) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} did not finish");
    }

    #[tokio::test]
    async fn health_and_readiness() {
        let (app, _dir) = app().await;
        let (status, body) = send(&app, Method::GET, "/healthz", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = send(&app, Method::GET, "/readyz", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["checks"]["sqlite"]["ok"], true);
        assert_eq!(body["checks"]["storage"]["ok"], true);
        assert_eq!(body["active_jobs"], 0);
    }

    #[tokio::test]
    async fn out_of_order_upload_then_import() {
        let (app, _dir) = app().await;
        let id = init(&app, 3).await;
        let chunks = [
            "name,email\nAda,ada@x.io\n",
            "Bob,bob@x.io\nAda again,ADA@x.io\n",
            "Cy\nDee,dee@x.io\n",
        ];

        for index in [2usize, 0] {
            let (status, body) = send(
                &app,
                Method::PUT,
                &format!("/uploads/{id}/chunks/{index}"),
                Body::from(chunks[index]),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["part_number"], index + 1);
        }

        let (status, view) = send(&app, Method::GET, &format!("/uploads/{id}"), Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["accepted_count"], 2);
        assert_eq!(view["missing_parts"], json!([2]));

        let (status, body) = send(
            &app,
            Method::PUT,
            &format!("/uploads/{id}/chunks/1"),
            Body::from(chunks[1]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted_count"], 3);

        let (status, done) = send(&app, Method::POST, &format!("/uploads/{id}/complete"), Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let job_id = done["job_id"].as_str().unwrap().to_string();

        let job = wait_for_terminal(&app, &job_id).await;
        assert_eq!(job["status"], "completed");
        assert_eq!(job["total_rows"], 5);
        assert_eq!(job["success_count"], 3);
        assert_eq!(job["duplicate_count"], 1);
        assert_eq!(job["error_count"], 1);
        assert_eq!(job["progress_percentage"], 100.0);
        assert_eq!(job["error_log"]["row_errors"][0]["line"], 5);

        // The session is gone once completed.
        let (status, _) = send(&app, Method::GET, &format!("/uploads/{id}"), Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, listed) = send(&app, Method::GET, "/jobs?limit=5", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed[0]["job_id"], job_id.as_str());

        // Cancelling a finished job is accepted and changes nothing.
        let (status, after) =
            send(&app, Method::POST, &format!("/jobs/{job_id}/cancel"), Body::empty()).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(after["status"], "completed");
        assert_eq!(after["cancel_requested"], false);
    }

    async fn upload_all(app: &Router, chunks: &[&'static str]) -> String {
        let id = init(app, chunks.len() as i64).await;
        for (index, chunk) in chunks.iter().enumerate() {
            let (status, _) = send(
                app,
                Method::PUT,
                &format!("/uploads/{id}/chunks/{index}"),
                Body::from(*chunk),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }
        id
    }

    #[tokio::test]
    async fn failed_job_creation_keeps_the_upload_retryable() {
        let (app, _dir, pool) = app_with_pool().await;
        let id = upload_all(&app, &["name,email\n", "Ada,ada@x.io\n"]).await;

        sqlx::query("ALTER TABLE import_jobs RENAME TO import_jobs_offline")
            .execute(&*pool)
            .await
            .unwrap();
        let (status, _) = send(&app, Method::POST, &format!("/uploads/{id}/complete"), Body::empty()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        // Assembled, not lost: the session is still there and takes no more chunks.
        let (status, view) = send(&app, Method::GET, &format!("/uploads/{id}"), Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["state"], "assembled");
        let (status, _) = send(&app, Method::PUT, &format!("/uploads/{id}/chunks/0"), Body::from("x")).await;
        assert_eq!(status, StatusCode::CONFLICT);

        sqlx::query("ALTER TABLE import_jobs_offline RENAME TO import_jobs")
            .execute(&*pool)
            .await
            .unwrap();
        let (status, done) = send(&app, Method::POST, &format!("/uploads/{id}/complete"), Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let job_id = done["job_id"].as_str().unwrap().to_string();

        let job = wait_for_terminal(&app, &job_id).await;
        assert_eq!(job["status"], "completed");
        assert_eq!(job["upload_id"], id.as_str());
        assert_eq!(job["success_count"], 1);

        let (status, _) = send(&app, Method::GET, &format!("/uploads/{id}"), Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn concurrent_completes_dispatch_one_job() {
        let (app, _dir) = app().await;
        let id = upload_all(&app, &["name,email\n", "Bo,bo@x.io\n"]).await;
        let uri = format!("/uploads/{id}/complete");

        let (a, b) = tokio::join!(
            send(&app, Method::POST, &uri, Body::empty()),
            send(&app, Method::POST, &uri, Body::empty()),
        );
        let mut job_ids = Vec::new();
        for (status, body) in [a, b] {
            match status {
                StatusCode::OK => job_ids.push(body["job_id"].as_str().unwrap().to_string()),
                StatusCode::CONFLICT | StatusCode::NOT_FOUND => {}
                other => panic!("unexpected status {other}"),
            }
        }
        assert!(!job_ids.is_empty());
        assert!(job_ids.iter().all(|job_id| job_id == &job_ids[0]));

        let (status, listed) = send(&app, Method::GET, "/jobs", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn incomplete_upload_is_a_conflict() {
        let (app, _dir) = app().await;
        let id = init(&app, 2).await;
        send(&app, Method::PUT, &format!("/uploads/{id}/chunks/0"), Body::from("a,b\n")).await;

        let (status, body) = send(&app, Method::POST, &format!("/uploads/{id}/complete"), Body::empty()).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["status"], 409);
    }

    #[tokio::test]
    async fn client_errors() {
        let (app, _dir) = app().await;

        let bad = json!({"file_name": "x.csv", "file_size": 1, "total_chunks": 0});
        let (status, _) = send(&app, Method::POST, "/uploads", Body::from(bad.to_string())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, Method::POST, "/uploads", Body::from("{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, Method::PUT, "/uploads/missing/chunks/0", Body::from("x")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let id = init(&app, 1).await;
        let (status, _) = send(&app, Method::PUT, &format!("/uploads/{id}/chunks/1"), Body::from("x")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            Method::PUT,
            &format!("/uploads/{id}/chunks/0"),
            Body::from(vec![b'x'; 4096]),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

        let (status, _) = send(&app, Method::GET, "/jobs/missing", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, Method::POST, "/jobs/missing/cancel", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_upload_is_idempotent() {
        let (app, _dir) = app().await;
        let id = init(&app, 2).await;
        for _ in 0..2 {
            let (status, _) = send(&app, Method::DELETE, &format!("/uploads/{id}"), Body::empty()).await;
            assert_eq!(status, StatusCode::NO_CONTENT);
        }
        let (status, _) = send(&app, Method::PUT, &format!("/uploads/{id}/chunks/0"), Body::from("x")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
