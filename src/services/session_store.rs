//! src/services/session_store.rs
//!
//! Keyed, TTL-backed store for in-flight upload sessions. Expired sessions
//! read exactly like missing ones. Part recording is atomic per call so
//! concurrent chunks for the same session cannot lose each other's entries.
//! State changes are compare-and-set, so exactly one caller wins a
//! completion.

use crate::models::upload_session::{SessionState, UploadSession, UploadedPart};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("upload session `{0}` not found")]
    NotFound(String),
    #[error("upload session `{0}` already exists")]
    AlreadyExists(String),
    #[error("upload session `{upload_id}` is {state}")]
    NotOpen {
        upload_id: String,
        state: SessionState,
    },
    #[error("stored upload session is corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type SessionStoreResult<T> = Result<T, SessionStoreError>;

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: &UploadSession) -> SessionStoreResult<()>;

    /// Fetch a live session. Expired sessions return `None`.
    async fn get(&self, upload_id: &str) -> SessionStoreResult<Option<UploadSession>>;

    /// Record (or replace) a part and return the number of distinct parts now
    /// held. Only `Open` sessions take parts; others fail with `NotOpen`.
    async fn record_part(&self, upload_id: &str, part: UploadedPart) -> SessionStoreResult<usize>;

    /// Move a session from `from` to `to` if it is currently in `from`,
    /// returning the updated session. Leaving `Open` requires a live session;
    /// later moves ignore expiry so a running completion can settle.
    async fn transition(
        &self,
        upload_id: &str,
        from: SessionState,
        to: SessionState,
    ) -> SessionStoreResult<Option<UploadSession>>;

    /// Delete a session, expired or not, returning what was stored. A
    /// `Completing` session is kept and reported as `NotOpen`.
    async fn remove(&self, upload_id: &str) -> SessionStoreResult<Option<UploadSession>>;

    /// Delete and return every session whose TTL elapsed at `now`, in any state.
    async fn take_expired(&self, now: DateTime<Utc>) -> SessionStoreResult<Vec<UploadSession>>;
}

/// In-process backend. One write lock serializes every mutation.
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, UploadSession>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: &UploadSession) -> SessionStoreResult<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.upload_id) {
            return Err(SessionStoreError::AlreadyExists(session.upload_id.clone()));
        }
        sessions.insert(session.upload_id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, upload_id: &str) -> SessionStoreResult<Option<UploadSession>> {
        let now = Utc::now();
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(upload_id)
            .filter(|s| !s.is_expired(now))
            .cloned())
    }

    async fn record_part(&self, upload_id: &str, part: UploadedPart) -> SessionStoreResult<usize> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(upload_id)
            .filter(|s| !s.is_expired(now))
            .ok_or_else(|| SessionStoreError::NotFound(upload_id.to_string()))?;
        if session.state != SessionState::Open {
            return Err(SessionStoreError::NotOpen {
                upload_id: upload_id.to_string(),
                state: session.state,
            });
        }
        session.uploaded_parts.insert(part.part_number, part);
        Ok(session.uploaded_parts.len())
    }

    async fn transition(
        &self,
        upload_id: &str,
        from: SessionState,
        to: SessionState,
    ) -> SessionStoreResult<Option<UploadSession>> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        Ok(sessions
            .get_mut(upload_id)
            .filter(|s| s.state == from && (from != SessionState::Open || !s.is_expired(now)))
            .map(|s| {
                s.state = to;
                s.clone()
            }))
    }

    async fn remove(&self, upload_id: &str) -> SessionStoreResult<Option<UploadSession>> {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(upload_id) {
            if session.state == SessionState::Completing {
                return Err(SessionStoreError::NotOpen {
                    upload_id: upload_id.to_string(),
                    state: session.state,
                });
            }
        }
        Ok(sessions.remove(upload_id))
    }

    async fn take_expired(&self, now: DateTime<Utc>) -> SessionStoreResult<Vec<UploadSession>> {
        let mut sessions = self.sessions.write().await;
        let expired: Vec<String> = sessions
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.upload_id.clone())
            .collect();
        Ok(expired
            .into_iter()
            .filter_map(|id| sessions.remove(&id))
            .collect())
    }
}

#[derive(FromRow)]
struct SessionRow {
    upload_id: String,
    object_key: String,
    multipart_id: String,
    total_chunks: i64,
    file_name: String,
    declared_file_size: i64,
    state: SessionState,
    created_at: i64,
    expires_at: i64,
}

#[derive(FromRow)]
struct PartRow {
    part_number: i64,
    etag: String,
    size_bytes: i64,
    uploaded_at: i64,
}

fn from_millis(ms: i64) -> SessionStoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| SessionStoreError::Corrupt(format!("timestamp {ms} out of range")))
}

fn numeric<T: TryFrom<i64>>(value: i64, field: &str) -> SessionStoreResult<T> {
    T::try_from(value).map_err(|_| SessionStoreError::Corrupt(format!("{field} = {value}")))
}

impl SessionRow {
    fn into_session(self, parts: Vec<PartRow>) -> SessionStoreResult<UploadSession> {
        let mut uploaded_parts = std::collections::BTreeMap::new();
        for row in parts {
            let part_number: u32 = numeric(row.part_number, "part_number")?;
            uploaded_parts.insert(
                part_number,
                UploadedPart {
                    part_number,
                    etag: row.etag,
                    size_bytes: numeric(row.size_bytes, "size_bytes")?,
                    uploaded_at: from_millis(row.uploaded_at)?,
                },
            );
        }
        Ok(UploadSession {
            upload_id: self.upload_id,
            object_key: self.object_key,
            multipart_id: self.multipart_id,
            total_chunks: numeric(self.total_chunks, "total_chunks")?,
            uploaded_parts,
            file_name: self.file_name,
            declared_file_size: numeric(self.declared_file_size, "declared_file_size")?,
            state: self.state,
            created_at: from_millis(self.created_at)?,
            expires_at: from_millis(self.expires_at)?,
        })
    }
}

const SESSION_COLUMNS: &str = "upload_id, object_key, multipart_id, total_chunks, file_name, \
     declared_file_size, state, created_at, expires_at";

/// SQLite backend sharing the service pool.
#[derive(Clone)]
pub struct SqliteSessionStore {
    db: Arc<SqlitePool>,
}

impl SqliteSessionStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    async fn load_parts<'e, E>(executor: E, upload_id: &str) -> SessionStoreResult<Vec<PartRow>>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        Ok(sqlx::query_as::<_, PartRow>(
            "SELECT part_number, etag, size_bytes, uploaded_at
             FROM upload_parts WHERE upload_id = ? ORDER BY part_number",
        )
        .bind(upload_id)
        .fetch_all(executor)
        .await?)
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn insert(&self, session: &UploadSession) -> SessionStoreResult<()> {
        let result = sqlx::query(
            "INSERT INTO upload_sessions (
                upload_id, object_key, multipart_id, total_chunks, file_name,
                declared_file_size, state, created_at, expires_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.upload_id)
        .bind(&session.object_key)
        .bind(&session.multipart_id)
        .bind(i64::from(session.total_chunks))
        .bind(&session.file_name)
        .bind(i64::try_from(session.declared_file_size).unwrap_or(i64::MAX))
        .bind(session.state.as_str())
        .bind(session.created_at.timestamp_millis())
        .bind(session.expires_at.timestamp_millis())
        .execute(&*self.db)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Err(
                SessionStoreError::AlreadyExists(session.upload_id.clone()),
            ),
            Err(err) => Err(err.into()),
        }
    }

    async fn get(&self, upload_id: &str) -> SessionStoreResult<Option<UploadSession>> {
        // One read transaction so the session and its parts are a consistent snapshot.
        let mut tx = self.db.begin().await?;
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM upload_sessions
             WHERE upload_id = ? AND expires_at > ?"
        ))
        .bind(upload_id)
        .bind(Utc::now().timestamp_millis())
        .fetch_optional(&mut *tx)
        .await?;

        let session = match row {
            Some(row) => {
                let parts = Self::load_parts(&mut *tx, upload_id).await?;
                Some(row.into_session(parts)?)
            }
            None => None,
        };
        tx.commit().await?;
        Ok(session)
    }

    async fn record_part(&self, upload_id: &str, part: UploadedPart) -> SessionStoreResult<usize> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.db.begin().await?;

        // Write first so the transaction takes the write lock up front.
        let inserted = sqlx::query(
            "INSERT INTO upload_parts (upload_id, part_number, etag, size_bytes, uploaded_at)
             SELECT upload_id, ?, ?, ?, ? FROM upload_sessions
             WHERE upload_id = ? AND expires_at > ? AND state = 'open'
             ON CONFLICT(upload_id, part_number) DO UPDATE SET
                etag = excluded.etag,
                size_bytes = excluded.size_bytes,
                uploaded_at = excluded.uploaded_at",
        )
        .bind(i64::from(part.part_number))
        .bind(&part.etag)
        .bind(i64::try_from(part.size_bytes).unwrap_or(i64::MAX))
        .bind(part.uploaded_at.timestamp_millis())
        .bind(upload_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            let state: Option<SessionState> = sqlx::query_scalar(
                "SELECT state FROM upload_sessions WHERE upload_id = ? AND expires_at > ?",
            )
            .bind(upload_id)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;
            return Err(match state {
                Some(state) => SessionStoreError::NotOpen {
                    upload_id: upload_id.to_string(),
                    state,
                },
                None => SessionStoreError::NotFound(upload_id.to_string()),
            });
        }

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM upload_parts WHERE upload_id = ?")
                .bind(upload_id)
                .fetch_one(&mut *tx)
                .await?;
        tx.commit().await?;

        numeric(count, "part count")
    }

    async fn transition(
        &self,
        upload_id: &str,
        from: SessionState,
        to: SessionState,
    ) -> SessionStoreResult<Option<UploadSession>> {
        let mut tx = self.db.begin().await?;
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "UPDATE upload_sessions SET state = ?
             WHERE upload_id = ? AND state = ? AND (state != 'open' OR expires_at > ?)
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(to.as_str())
        .bind(upload_id)
        .bind(from.as_str())
        .bind(Utc::now().timestamp_millis())
        .fetch_optional(&mut *tx)
        .await?;

        let session = match row {
            Some(row) => {
                let parts = Self::load_parts(&mut *tx, upload_id).await?;
                Some(row.into_session(parts)?)
            }
            None => None,
        };
        tx.commit().await?;
        Ok(session)
    }

    async fn remove(&self, upload_id: &str) -> SessionStoreResult<Option<UploadSession>> {
        let mut tx = self.db.begin().await?;
        let parts = sqlx::query_as::<_, PartRow>(
            "DELETE FROM upload_parts WHERE upload_id = ?
               AND EXISTS (
                 SELECT 1 FROM upload_sessions
                 WHERE upload_id = upload_parts.upload_id AND state != 'completing'
               )
             RETURNING part_number, etag, size_bytes, uploaded_at",
        )
        .bind(upload_id)
        .fetch_all(&mut *tx)
        .await?;
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "DELETE FROM upload_sessions WHERE upload_id = ? AND state != 'completing'
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(upload_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            let kept: Option<SessionState> =
                sqlx::query_scalar("SELECT state FROM upload_sessions WHERE upload_id = ?")
                    .bind(upload_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.commit().await?;
            return match kept {
                Some(state) => Err(SessionStoreError::NotOpen {
                    upload_id: upload_id.to_string(),
                    state,
                }),
                None => Ok(None),
            };
        };
        tx.commit().await?;

        row.into_session(parts).map(Some)
    }

    async fn take_expired(&self, now: DateTime<Utc>) -> SessionStoreResult<Vec<UploadSession>> {
        let mut tx = self.db.begin().await?;
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "DELETE FROM upload_sessions WHERE expires_at <= ? RETURNING {SESSION_COLUMNS}"
        ))
        .bind(now.timestamp_millis())
        .fetch_all(&mut *tx)
        .await?;

        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            sqlx::query("DELETE FROM upload_parts WHERE upload_id = ?")
                .bind(&row.upload_id)
                .execute(&mut *tx)
                .await?;
            sessions.push(row.into_session(Vec::new())?);
        }
        tx.commit().await?;

        Ok(sessions)
    }
}
