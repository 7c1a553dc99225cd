//! src/services/blob_store.rs
//!
//! Blob store client used by the upload coordinator and the ingest pipeline.
//! `BlobStore` is the seam; `LocalBlobStore` keeps payloads on local disk
//! sharded beneath `base_path/{shard}/{shard}/{key}` and stages multipart
//! uploads beneath `base_path/.multipart/{multipart_id}/`.
//!
//! No retries happen here. Callers decide whether to re-send a part.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

/// Streamed object payload.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob store unavailable: {0}")]
    StorageUnavailable(#[source] io::Error),
    #[error("`{0}` not found in blob store")]
    NotFound(String),
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error("part {part_number} rejected: {reason}")]
    InvalidPart { part_number: u32, reason: String },
}

impl From<io::Error> for BlobError {
    fn from(err: io::Error) -> Self {
        BlobError::StorageUnavailable(err)
    }
}

pub type BlobResult<T> = Result<T, BlobError>;

/// A part reference handed to `complete_multipart`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Begin a multipart upload for `key`, returning its multipart id.
    async fn create_multipart(&self, key: &str) -> BlobResult<String>;

    /// Store one part, returning its etag. Re-sending a part number overwrites it.
    async fn upload_part(
        &self,
        key: &str,
        multipart_id: &str,
        part_number: u32,
        bytes: Bytes,
    ) -> BlobResult<String>;

    /// Assemble `parts` (ascending part numbers) into the object at `key`.
    async fn complete_multipart(
        &self,
        key: &str,
        multipart_id: &str,
        parts: &[CompletedPart],
    ) -> BlobResult<()>;

    /// Discard a multipart upload and its staged parts.
    async fn abort_multipart(&self, key: &str, multipart_id: &str) -> BlobResult<()>;

    /// Small-object path: write `bytes` at `key` in one call.
    async fn put_object(&self, key: &str, bytes: Bytes) -> BlobResult<()>;

    /// Open a byte stream over the object at `key`.
    async fn stream_object(&self, key: &str) -> BlobResult<ByteStream>;
}

const MAX_OBJECT_KEY_LEN: usize = 1024;
const MULTIPART_DIR: &str = ".multipart";
const MULTIPART_KEY_FILE: &str = "key";

/// Disk-backed `BlobStore`.
#[derive(Clone, Debug)]
pub struct LocalBlobStore {
    base_path: PathBuf,
}

impl LocalBlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Rejects keys that are empty, too long, absolute, contain `..`, or
    /// carry control characters.
    fn ensure_key_safe(key: &str) -> BlobResult<()> {
        let invalid = key.is_empty()
            || key.len() > MAX_OBJECT_KEY_LEN
            || key.starts_with('/')
            || key.starts_with(MULTIPART_DIR)
            || key.contains("..")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
        if invalid {
            return Err(BlobError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    /// Two-level shard identifiers: first two bytes of MD5(key) as hex.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    /// Staging directory for a multipart upload. Ids we hand out are UUIDs,
    /// anything else cannot exist.
    fn multipart_dir(&self, multipart_id: &str) -> BlobResult<PathBuf> {
        if multipart_id.is_empty()
            || !multipart_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(BlobError::NotFound(format!("multipart upload {multipart_id}")));
        }
        Ok(self.base_path.join(MULTIPART_DIR).join(multipart_id))
    }

    fn part_path(dir: &Path, part_number: u32) -> PathBuf {
        dir.join(format!("{part_number:05}.part"))
    }

    /// Open the staging dir for `multipart_id` and check it belongs to `key`.
    async fn open_multipart(&self, key: &str, multipart_id: &str) -> BlobResult<PathBuf> {
        let dir = self.multipart_dir(multipart_id)?;
        let stored_key = match fs::read_to_string(dir.join(MULTIPART_KEY_FILE)).await {
            Ok(stored) => stored,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(BlobError::NotFound(format!(
                    "multipart upload {multipart_id}"
                )));
            }
            Err(err) => return Err(err.into()),
        };
        if stored_key != key {
            return Err(BlobError::NotFound(format!(
                "multipart upload {multipart_id} for `{key}`"
            )));
        }
        Ok(dir)
    }

    /// Write `bytes` to `target` through a temp file in the same directory,
    /// fsync, then rename into place. Returns the MD5 hex digest. The parent
    /// directory must already exist.
    async fn write_atomic(target: &Path, bytes: &[u8]) -> io::Result<String> {
        let parent = target.parent().ok_or_else(|| {
            io::Error::new(ErrorKind::Other, "target path missing parent directory")
        })?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let result = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, target).await
        }
        .await;

        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        Ok(format!("{:x}", md5::compute(bytes)))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn create_multipart(&self, key: &str) -> BlobResult<String> {
        Self::ensure_key_safe(key)?;
        let multipart_id = Uuid::new_v4().to_string();
        let dir = self.multipart_dir(&multipart_id)?;
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join(MULTIPART_KEY_FILE), key.as_bytes()).await?;
        debug!("created multipart upload {} for {}", multipart_id, key);
        Ok(multipart_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        multipart_id: &str,
        part_number: u32,
        bytes: Bytes,
    ) -> BlobResult<String> {
        if part_number == 0 {
            return Err(BlobError::InvalidPart {
                part_number,
                reason: "part numbers start at 1".into(),
            });
        }
        let dir = self.open_multipart(key, multipart_id).await?;
        // An abort between the open and the write removes `dir`; the part must
        // not bring it back.
        let etag = match Self::write_atomic(&Self::part_path(&dir, part_number), &bytes).await {
            Ok(etag) => etag,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(BlobError::NotFound(format!(
                    "multipart upload {multipart_id}"
                )));
            }
            Err(err) => return Err(err.into()),
        };
        debug!(
            "stored part {} ({} bytes) of multipart upload {}",
            part_number,
            bytes.len(),
            multipart_id
        );
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        key: &str,
        multipart_id: &str,
        parts: &[CompletedPart],
    ) -> BlobResult<()> {
        let dir = self.open_multipart(key, multipart_id).await?;
        if parts.is_empty() {
            return Err(BlobError::InvalidPart {
                part_number: 0,
                reason: "no parts supplied".into(),
            });
        }
        if let Some(pair) = parts.windows(2).find(|w| w[0].part_number >= w[1].part_number) {
            return Err(BlobError::InvalidPart {
                part_number: pair[1].part_number,
                reason: "parts must be in strictly ascending order".into(),
            });
        }

        let target = self.object_path(key);
        let parent = target.parent().map(Path::to_path_buf).ok_or_else(|| {
            BlobError::StorageUnavailable(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut out = File::create(&tmp_path).await?;

        let mut buf = vec![0u8; 64 * 1024];
        for part in parts {
            let assembled = async {
                let mut file = match File::open(Self::part_path(&dir, part.part_number)).await {
                    Ok(file) => file,
                    Err(err) if err.kind() == ErrorKind::NotFound => {
                        return Err(BlobError::InvalidPart {
                            part_number: part.part_number,
                            reason: "part was never uploaded".into(),
                        });
                    }
                    Err(err) => return Err(err.into()),
                };
                let mut digest = Context::new();
                loop {
                    let read = file.read(&mut buf).await?;
                    if read == 0 {
                        break;
                    }
                    digest.consume(&buf[..read]);
                    out.write_all(&buf[..read]).await?;
                }
                let etag = format!("{:x}", digest.compute());
                if etag != part.etag {
                    return Err(BlobError::InvalidPart {
                        part_number: part.part_number,
                        reason: format!("etag mismatch: expected {}, found {}", part.etag, etag),
                    });
                }
                Ok::<(), BlobError>(())
            }
            .await;

            if let Err(err) = assembled {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        }

        let finished = async {
            out.flush().await?;
            out.sync_all().await?;
            fs::rename(&tmp_path, &target).await
        }
        .await;
        if let Err(err) = finished {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }

        if let Err(err) = fs::remove_dir_all(&dir).await {
            debug!(
                "failed to remove staging dir {} after completion: {}",
                dir.display(),
                err
            );
        }
        debug!(
            "completed multipart upload {} into {} ({} parts)",
            multipart_id,
            key,
            parts.len()
        );
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, multipart_id: &str) -> BlobResult<()> {
        let dir = self.open_multipart(key, multipart_id).await?;
        match fs::remove_dir_all(&dir).await {
            Ok(_) => {
                debug!("aborted multipart upload {}", multipart_id);
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Err(BlobError::NotFound(format!(
                "multipart upload {multipart_id}"
            ))),
            Err(err) => Err(err.into()),
        }
    }

    async fn put_object(&self, key: &str, bytes: Bytes) -> BlobResult<()> {
        Self::ensure_key_safe(key)?;
        let target = self.object_path(key);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        Self::write_atomic(&target, &bytes).await?;
        Ok(())
    }

    async fn stream_object(&self, key: &str) -> BlobResult<ByteStream> {
        Self::ensure_key_safe(key)?;
        let file = File::open(self.object_path(key)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                BlobError::NotFound(key.to_string())
            } else {
                BlobError::StorageUnavailable(err)
            }
        })?;
        Ok(ReaderStream::new(file).boxed())
    }
}

/// Drain a byte stream into memory.
#[cfg(test)]
pub async fn read_to_bytes(mut stream: ByteStream) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, LocalBlobStore) {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn multipart_roundtrip_assembles_parts_in_order() {
        let (_dir, store) = store();
        let key = "imports/contacts.csv";
        let id = store.create_multipart(key).await.unwrap();

        let e2 = store
            .upload_part(key, &id, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();
        let e1 = store
            .upload_part(key, &id, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();

        store
            .complete_multipart(
                key,
                &id,
                &[
                    CompletedPart { part_number: 1, etag: e1 },
                    CompletedPart { part_number: 2, etag: e2 },
                ],
            )
            .await
            .unwrap();

        let body = read_to_bytes(store.stream_object(key).await.unwrap())
            .await
            .unwrap();
        assert_eq!(body, b"hello world");

        // Staging is gone once the object is assembled.
        let err = store.abort_multipart(key, &id).await.unwrap_err();
        assert!(matches!(err, BlobError::NotFound(_)));
    }

    #[tokio::test]
    async fn reuploading_a_part_overwrites_it() {
        let (_dir, store) = store();
        let key = "a.csv";
        let id = store.create_multipart(key).await.unwrap();
        store
            .upload_part(key, &id, 1, Bytes::from_static(b"stale"))
            .await
            .unwrap();
        let etag = store
            .upload_part(key, &id, 1, Bytes::from_static(b"fresh"))
            .await
            .unwrap();
        assert_eq!(etag, format!("{:x}", md5::compute(b"fresh")));

        store
            .complete_multipart(key, &id, &[CompletedPart { part_number: 1, etag }])
            .await
            .unwrap();
        let body = read_to_bytes(store.stream_object(key).await.unwrap())
            .await
            .unwrap();
        assert_eq!(body, b"fresh");
    }

    #[tokio::test]
    async fn complete_rejects_etag_mismatch_and_unordered_parts() {
        let (_dir, store) = store();
        let key = "b.csv";
        let id = store.create_multipart(key).await.unwrap();
        let e1 = store
            .upload_part(key, &id, 1, Bytes::from_static(b"x"))
            .await
            .unwrap();
        let e2 = store
            .upload_part(key, &id, 2, Bytes::from_static(b"y"))
            .await
            .unwrap();

        let err = store
            .complete_multipart(
                key,
                &id,
                &[CompletedPart { part_number: 1, etag: "bogus".into() }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::InvalidPart { part_number: 1, .. }));

        let err = store
            .complete_multipart(
                key,
                &id,
                &[
                    CompletedPart { part_number: 2, etag: e2 },
                    CompletedPart { part_number: 1, etag: e1 },
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::InvalidPart { .. }));

        assert!(matches!(
            store.stream_object(key).await.err(),
            Some(BlobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unknown_multipart_and_object_are_not_found() {
        let (_dir, store) = store();
        let err = store
            .upload_part("c.csv", "does-not-exist", 1, Bytes::from_static(b"z"))
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::NotFound(_)));

        let err = store.abort_multipart("c.csv", "../escape").await.unwrap_err();
        assert!(matches!(err, BlobError::NotFound(_)));

        assert!(matches!(
            store.stream_object("missing.csv").await.err(),
            Some(BlobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn part_after_abort_does_not_recreate_staging() {
        let (dir, store) = store();
        let key = "late.csv";
        let id = store.create_multipart(key).await.unwrap();
        store
            .upload_part(key, &id, 1, Bytes::from_static(b"early"))
            .await
            .unwrap();
        store.abort_multipart(key, &id).await.unwrap();

        let err = store
            .upload_part(key, &id, 2, Bytes::from_static(b"late"))
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::NotFound(_)));
        assert!(!dir.path().join(MULTIPART_DIR).join(&id).exists());
    }

    #[tokio::test]
    async fn part_write_into_removed_staging_is_not_found() {
        let (dir, store) = store();
        let id = store.create_multipart("gone.csv").await.unwrap();
        let staging = dir.path().join(MULTIPART_DIR).join(&id);
        // Staging vanishes after the key check but before the part lands.
        fs::remove_dir_all(&staging).await.unwrap();

        let err = LocalBlobStore::write_atomic(&LocalBlobStore::part_path(&staging, 1), b"x")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!staging.exists());
    }

    #[tokio::test]
    async fn multipart_id_is_bound_to_its_key() {
        let (_dir, store) = store();
        let id = store.create_multipart("one.csv").await.unwrap();
        let err = store
            .upload_part("two.csv", &id, 1, Bytes::from_static(b"z"))
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::NotFound(_)));
    }

    #[tokio::test]
    async fn put_object_and_key_validation() {
        let (_dir, store) = store();
        store
            .put_object("small/file.csv", Bytes::from_static(b"name,email\n"))
            .await
            .unwrap();
        let body = read_to_bytes(store.stream_object("small/file.csv").await.unwrap())
            .await
            .unwrap();
        assert_eq!(body, b"name,email\n");

        for bad in ["", "/abs", "../up", "a/../b", ".multipart/x"] {
            assert!(matches!(
                store.put_object(bad, Bytes::new()).await,
                Err(BlobError::InvalidKey(_))
            ));
        }
    }
}
