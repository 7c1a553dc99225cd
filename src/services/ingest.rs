//! src/services/ingest.rs
//!
//! CSV ingest pipeline executed by a worker for one claimed job.
//!
//! The source object is read twice: a survey pass that validates the header
//! and counts data rows, then the import pass. Parsing runs on a blocking
//! thread and hands fixed-size batches over a bounded channel, so the async
//! side only waits on the contact store and the status store.
//!
//! Per batch: check the cancel flag, tally malformed rows, classify the rest
//! as new or duplicate, upsert the new ones in one write, publish counters.
//! Batches already written stay written whatever happens later.

use crate::{
    models::{
        contact::NewContact,
        import_job::{ErrorLog, FailureReason, JobProgress, JobStatus},
    },
    services::{
        blob_store::{BlobError, BlobStore, ByteStream},
        contact_store::{ContactStore, ContactStoreError},
        job_queue::IngestTask,
        job_store::{JobStore, JobStoreError},
        row_mapper::{RowMapper, normalize_header},
    },
};
use csv::{ByteRecord, ReaderBuilder};
use std::{collections::HashSet, io::Read, sync::Arc};
use tokio::sync::mpsc;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{debug, error, info};

pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// A data record and the source line it starts on.
#[derive(Debug)]
struct SourceRow {
    line: u64,
    values: Vec<String>,
}

enum ReaderEvent {
    Header(Vec<String>),
    Rows(Vec<SourceRow>),
    Failed(String),
}

#[derive(Debug)]
struct IngestError {
    reason: FailureReason,
    message: String,
}

impl IngestError {
    fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

impl From<JobStoreError> for IngestError {
    fn from(err: JobStoreError) -> Self {
        IngestError::new(FailureReason::StoreError, err.to_string())
    }
}

impl From<ContactStoreError> for IngestError {
    fn from(err: ContactStoreError) -> Self {
        IngestError::new(FailureReason::StoreError, err.to_string())
    }
}

enum Outcome {
    Completed,
    Cancelled,
}

#[derive(Default)]
struct RunState {
    progress: JobProgress,
    log: ErrorLog,
    /// Dedup keys already classified in this job.
    seen: HashSet<String>,
}

#[derive(Clone)]
pub struct IngestPipeline {
    blobs: Arc<dyn BlobStore>,
    contacts: Arc<dyn ContactStore>,
    jobs: JobStore,
    batch_size: usize,
}

impl IngestPipeline {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        contacts: Arc<dyn ContactStore>,
        jobs: JobStore,
        batch_size: usize,
    ) -> Self {
        Self {
            blobs,
            contacts,
            jobs,
            batch_size: batch_size.max(1),
        }
    }

    /// Claim the job and drive it to a terminal state. Returns `None` when
    /// another delivery already claimed it.
    pub async fn run(&self, task: &IngestTask) -> Option<JobStatus> {
        match self.jobs.claim(&task.job_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    "job {} is not pending, dropping duplicate delivery",
                    task.job_id
                );
                return None;
            }
            Err(err) => {
                error!("failed to claim job {}: {}", task.job_id, err);
                return None;
            }
        }
        info!("job {} started for {}", task.job_id, task.source_object_key);

        let mut state = RunState::default();
        let status = match self.execute(task, &mut state).await {
            Ok(Outcome::Completed) => {
                // Totals follow what was actually read.
                state.progress.total_rows = state.progress.processed_rows;
                state.progress.total_batches = state.progress.current_batch;
                info!(
                    "job {} completed: {} rows, {} inserted, {} duplicates, {} errors",
                    task.job_id,
                    state.progress.processed_rows,
                    state.progress.success_count,
                    state.progress.duplicate_count,
                    state.progress.error_count
                );
                JobStatus::Completed
            }
            Ok(Outcome::Cancelled) => {
                info!(
                    "job {} cancelled after {} batches ({} rows)",
                    task.job_id, state.progress.current_batch, state.progress.processed_rows
                );
                JobStatus::Cancelled
            }
            Err(failure) => {
                error!(
                    "job {} failed ({:?}): {}",
                    task.job_id, failure.reason, failure.message
                );
                state.log.reason = Some(failure.reason);
                state.log.message = Some(failure.message);
                JobStatus::Failed
            }
        };

        if let Err(err) = self
            .jobs
            .finish(&task.job_id, status, &state.progress, &state.log)
            .await
        {
            error!(
                "failed to record final state {:?} for job {}: {}",
                status, task.job_id, err
            );
        }
        Some(status)
    }

    async fn execute(&self, task: &IngestTask, state: &mut RunState) -> Result<Outcome, IngestError> {
        let job_id = task.job_id.as_str();
        if self.jobs.is_cancel_requested(job_id).await? {
            return Ok(Outcome::Cancelled);
        }

        let total_rows = self.survey(&task.source_object_key).await?;
        let batch_size = self.batch_size as u64;
        state.progress.total_rows = total_rows as i64;
        state.progress.total_batches = total_rows.div_ceil(batch_size) as i64;
        self.jobs.update_progress(job_id, &state.progress).await?;
        debug!(
            "job {} surveyed {} rows in {} batches",
            job_id, total_rows, state.progress.total_batches
        );

        let mut events = spawn_reader(self.open_source(&task.source_object_key).await?, self.batch_size);
        let headers = match events.recv().await {
            Some(ReaderEvent::Header(headers)) => headers,
            Some(ReaderEvent::Failed(message)) => {
                return Err(IngestError::new(FailureReason::SourceUnreadable, message));
            }
            _ => return Err(IngestError::new(FailureReason::EmptyFile, "source has no header row")),
        };
        let mapper = RowMapper::new(headers.iter().map(|h| normalize_header(h)).collect());

        while let Some(event) = events.recv().await {
            let rows = match event {
                ReaderEvent::Rows(rows) => rows,
                ReaderEvent::Failed(message) => {
                    return Err(IngestError::new(FailureReason::SourceUnreadable, message));
                }
                ReaderEvent::Header(_) => continue,
            };
            if self.jobs.is_cancel_requested(job_id).await? {
                return Ok(Outcome::Cancelled);
            }
            self.process_batch(job_id, &mapper, rows, state).await?;
        }

        Ok(Outcome::Completed)
    }

    /// Validate the header and count data rows.
    async fn survey(&self, key: &str) -> Result<u64, IngestError> {
        let mut events = spawn_reader(self.open_source(key).await?, self.batch_size);
        match events.recv().await {
            Some(ReaderEvent::Header(_)) => {}
            Some(ReaderEvent::Failed(message)) => {
                return Err(IngestError::new(FailureReason::SourceUnreadable, message));
            }
            _ => return Err(IngestError::new(FailureReason::EmptyFile, "source has no header row")),
        }

        let mut rows = 0u64;
        while let Some(event) = events.recv().await {
            match event {
                ReaderEvent::Rows(batch) => rows += batch.len() as u64,
                ReaderEvent::Failed(message) => {
                    return Err(IngestError::new(FailureReason::SourceUnreadable, message));
                }
                ReaderEvent::Header(_) => {}
            }
        }
        Ok(rows)
    }

    async fn open_source(&self, key: &str) -> Result<ByteStream, IngestError> {
        self.blobs.stream_object(key).await.map_err(|err| match err {
            BlobError::NotFound(_) | BlobError::InvalidKey(_) => IngestError::new(
                FailureReason::SourceMissing,
                format!("source object `{key}` not found"),
            ),
            other => IngestError::new(FailureReason::SourceUnreadable, other.to_string()),
        })
    }

    async fn process_batch(
        &self,
        job_id: &str,
        mapper: &RowMapper,
        rows: Vec<SourceRow>,
        state: &mut RunState,
    ) -> Result<(), IngestError> {
        let row_count = rows.len() as i64;
        let mut errors = 0i64;
        let mut duplicates = 0i64;
        let mut candidates: Vec<NewContact> = Vec::with_capacity(rows.len());

        for row in rows {
            if row.values.len() != mapper.column_count() {
                errors += 1;
                state.log.push_row_error(
                    row.line,
                    format!(
                        "expected {} fields, found {}",
                        mapper.column_count(),
                        row.values.len()
                    ),
                );
                continue;
            }
            match mapper.map(&row.values) {
                Some(contact) => {
                    if state.seen.insert(contact.dedup_key.clone()) {
                        candidates.push(contact);
                    } else {
                        duplicates += 1;
                    }
                }
                None => {
                    errors += 1;
                    state
                        .log
                        .push_row_error(row.line, "no identifying field");
                }
            }
        }

        let keys: Vec<String> = candidates.iter().map(|c| c.dedup_key.clone()).collect();
        let existing = self.contacts.existing_keys(&keys).await?;
        let (known, fresh): (Vec<NewContact>, Vec<NewContact>) = candidates
            .into_iter()
            .partition(|c| existing.contains(&c.dedup_key));
        self.contacts.bulk_upsert(&fresh, Some(job_id)).await?;

        let progress = &mut state.progress;
        progress.processed_rows += row_count;
        progress.success_count += fresh.len() as i64;
        progress.duplicate_count += duplicates + known.len() as i64;
        progress.error_count += errors;
        progress.current_batch += 1;
        self.jobs.update_progress(job_id, progress).await?;

        debug!(
            "job {} batch {}: {} rows, {} new, {} duplicate, {} errors",
            job_id,
            progress.current_batch,
            row_count,
            fresh.len(),
            duplicates + known.len() as i64,
            errors
        );
        Ok(())
    }
}

/// Parse `stream` on a blocking thread. The first non-blank record arrives as
/// `Header`, the rest as `Rows` of at most `batch_size`. Dropping the receiver
/// stops the reader.
fn spawn_reader(stream: ByteStream, batch_size: usize) -> mpsc::Receiver<ReaderEvent> {
    let (tx, rx) = mpsc::channel(2);
    let reader = SyncIoBridge::new(StreamReader::new(stream));
    tokio::task::spawn_blocking(move || read_records(reader, batch_size, &tx));
    rx
}

fn read_records<R: Read>(reader: R, batch_size: usize, tx: &mpsc::Sender<ReaderEvent>) {
    let mut csv = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);
    let mut record = ByteRecord::new();
    let mut header_sent = false;
    let mut batch = Vec::with_capacity(batch_size);

    loop {
        match csv.read_byte_record(&mut record) {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                let _ = tx.blocking_send(ReaderEvent::Failed(format!("malformed CSV: {err}")));
                return;
            }
        }
        if is_blank(&record) {
            continue;
        }

        let values: Vec<String> = record
            .iter()
            .map(|field| String::from_utf8_lossy(field).into_owned())
            .collect();

        if !header_sent {
            header_sent = true;
            if tx.blocking_send(ReaderEvent::Header(values)).is_err() {
                return;
            }
            continue;
        }

        let line = record.position().map(|p| p.line()).unwrap_or_default();
        batch.push(SourceRow { line, values });
        if batch.len() >= batch_size {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            if tx.blocking_send(ReaderEvent::Rows(full)).is_err() {
                return;
            }
        }
    }

    if !batch.is_empty() {
        let _ = tx.blocking_send(ReaderEvent::Rows(batch));
    }
}

/// Empty or whitespace-only lines carry no data.
fn is_blank(record: &ByteRecord) -> bool {
    match record.len() {
        0 => true,
        1 => record[0].trim_ascii().is_empty(),
        _ => false,
    }
}
