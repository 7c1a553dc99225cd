//! src/services/contact_store.rs
//!
//! Contact store consumed by the ingest pipeline. Records are keyed by their
//! dedup key; writes are upserts so concurrent jobs touching the same key
//! resolve as last-write-wins.

#[cfg(test)]
use crate::models::contact::Contact;
use crate::models::contact::NewContact;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{collections::HashSet, sync::Arc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContactStoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type ContactStoreResult<T> = Result<T, ContactStoreError>;

#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn exists(&self, dedup_key: &str) -> ContactStoreResult<bool>;

    /// Subset of `keys` already present in the store.
    async fn existing_keys(&self, keys: &[String]) -> ContactStoreResult<HashSet<String>>;

    async fn upsert(&self, contact: &NewContact, job_id: Option<&str>) -> ContactStoreResult<()>;

    /// Upsert every contact in one transaction. Returns rows written.
    async fn bulk_upsert(
        &self,
        contacts: &[NewContact],
        job_id: Option<&str>,
    ) -> ContactStoreResult<u64>;
}

/// SQLite's default host-parameter ceiling is 32766; stay well below it.
const KEYS_PER_QUERY: usize = 500;
const ROWS_PER_INSERT: usize = 200;

#[derive(Clone)]
pub struct SqliteContactStore {
    db: Arc<SqlitePool>,
}

impl SqliteContactStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[cfg(test)]
impl SqliteContactStore {
    pub async fn get(&self, dedup_key: &str) -> ContactStoreResult<Option<Contact>> {
        Ok(sqlx::query_as::<_, Contact>(
            "SELECT dedup_key, name, email, phone, company, title, linkedin_url,
                    location, extra, source_job_id, created_at, updated_at
             FROM contacts WHERE dedup_key = ?",
        )
        .bind(dedup_key)
        .fetch_optional(&*self.db)
        .await?)
    }

    pub async fn count(&self) -> ContactStoreResult<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM contacts")
            .fetch_one(&*self.db)
            .await?)
    }
}

fn upsert_builder<'a>(
    contacts: &'a [NewContact],
    job_id: Option<&'a str>,
) -> QueryBuilder<'a, Sqlite> {
    let now = Utc::now();
    let mut builder = QueryBuilder::<Sqlite>::new(
        "INSERT INTO contacts (
            dedup_key, name, email, phone, company, title, linkedin_url,
            location, extra, source_job_id, created_at, updated_at
        ) ",
    );
    builder.push_values(contacts, |mut row, c| {
        row.push_bind(&c.dedup_key)
            .push_bind(&c.name)
            .push_bind(&c.email)
            .push_bind(&c.phone)
            .push_bind(&c.company)
            .push_bind(&c.title)
            .push_bind(&c.linkedin_url)
            .push_bind(&c.location)
            .push_bind(&c.extra)
            .push_bind(job_id)
            .push_bind(now)
            .push_bind(now);
    });
    builder.push(
        " ON CONFLICT(dedup_key) DO UPDATE SET
            name = COALESCE(excluded.name, contacts.name),
            email = COALESCE(excluded.email, contacts.email),
            phone = COALESCE(excluded.phone, contacts.phone),
            company = COALESCE(excluded.company, contacts.company),
            title = COALESCE(excluded.title, contacts.title),
            linkedin_url = COALESCE(excluded.linkedin_url, contacts.linkedin_url),
            location = COALESCE(excluded.location, contacts.location),
            extra = COALESCE(excluded.extra, contacts.extra),
            source_job_id = excluded.source_job_id,
            updated_at = excluded.updated_at",
    );
    builder
}

#[async_trait]
impl ContactStore for SqliteContactStore {
    async fn exists(&self, dedup_key: &str) -> ContactStoreResult<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM contacts WHERE dedup_key = ?")
            .bind(dedup_key)
            .fetch_optional(&*self.db)
            .await?;
        Ok(found.is_some())
    }

    async fn existing_keys(&self, keys: &[String]) -> ContactStoreResult<HashSet<String>> {
        let mut found = HashSet::new();
        for chunk in keys.chunks(KEYS_PER_QUERY) {
            let mut builder =
                QueryBuilder::<Sqlite>::new("SELECT dedup_key FROM contacts WHERE dedup_key IN (");
            let mut separated = builder.separated(", ");
            for key in chunk {
                separated.push_bind(key);
            }
            separated.push_unseparated(")");
            let rows: Vec<String> = builder
                .build_query_scalar()
                .fetch_all(&*self.db)
                .await?;
            found.extend(rows);
        }
        Ok(found)
    }

    async fn upsert(&self, contact: &NewContact, job_id: Option<&str>) -> ContactStoreResult<()> {
        upsert_builder(std::slice::from_ref(contact), job_id)
            .build()
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    async fn bulk_upsert(
        &self,
        contacts: &[NewContact],
        job_id: Option<&str>,
    ) -> ContactStoreResult<u64> {
        if contacts.is_empty() {
            return Ok(0);
        }
        let mut tx = self.db.begin().await?;
        let mut written = 0;
        for chunk in contacts.chunks(ROWS_PER_INSERT) {
            written += upsert_builder(chunk, job_id)
                .build()
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn contact(key: &str, name: Option<&str>) -> NewContact {
        NewContact {
            dedup_key: key.to_string(),
            name: name.map(str::to_string),
            ..Default::default()
        }
    }

    async fn store() -> SqliteContactStore {
        SqliteContactStore::new(Arc::new(db::memory_pool().await.unwrap()))
    }

    #[tokio::test]
    async fn bulk_upsert_and_lookup() {
        let store = store().await;
        let batch: Vec<NewContact> = (0..450)
            .map(|i| contact(&format!("email:{i}@x.io"), Some("n")))
            .collect();
        assert_eq!(store.bulk_upsert(&batch, Some("job-1")).await.unwrap(), 450);
        assert_eq!(store.count().await.unwrap(), 450);

        let candidates: Vec<String> = (440..460).map(|i| format!("email:{i}@x.io")).collect();
        let found = store.existing_keys(&candidates).await.unwrap();
        assert_eq!(found.len(), 10);
        assert!(found.contains("email:449@x.io"));
        assert!(store.exists("email:0@x.io").await.unwrap());
        assert!(!store.exists("email:999@x.io").await.unwrap());
    }

    #[tokio::test]
    async fn upsert_keeps_one_record_per_key() {
        let store = store().await;
        store
            .upsert(&contact("name:ada|", Some("Ada")), Some("a"))
            .await
            .unwrap();
        store
            .upsert(&contact("name:ada|", None), Some("b"))
            .await
            .unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let stored = store.get("name:ada|").await.unwrap().unwrap();
        assert_eq!(stored.name.as_deref(), Some("Ada"));
        assert_eq!(stored.source_job_id.as_deref(), Some("b"));
    }
}
