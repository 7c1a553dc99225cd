//! src/services/import_service.rs
//!
//! Import job controller: creates jobs for completed uploads, hands them to
//! the queue, and serves status, cancellation and history to callers.

use crate::{
    models::import_job::{ErrorLog, FailureReason, ImportJob, JobProgress, JobStatus},
    services::{
        job_queue::{IngestTask, JobQueue, QueueError},
        job_store::{JobStore, JobStoreError},
    },
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

pub const DEFAULT_LIST_LIMIT: u32 = 20;
pub const MAX_LIST_LIMIT: u32 = 200;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("import job `{0}` not found")]
    NotFound(String),
    #[error("failed to dispatch import job: {0}")]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(JobStoreError),
}

impl From<JobStoreError> for JobError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => JobError::NotFound(id),
            other => JobError::Store(other),
        }
    }
}

pub type JobResult<T> = Result<T, JobError>;

/// What startup recovery did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub interrupted: u64,
    pub requeued: usize,
}

#[derive(Clone)]
pub struct ImportJobService {
    jobs: JobStore,
    queue: Arc<dyn JobQueue>,
}

impl ImportJobService {
    pub fn new(jobs: JobStore, queue: Arc<dyn JobQueue>) -> Self {
        Self { jobs, queue }
    }

    /// Create a `Pending` job for `source_object_key` and enqueue it. If the
    /// queue refuses the task the job is failed so it never sits pending forever.
    ///
    /// With an `upload_id` the call is idempotent: an upload that already has
    /// a job gets that job back and nothing is enqueued again.
    pub async fn dispatch(
        &self,
        source_object_key: &str,
        upload_id: Option<&str>,
    ) -> JobResult<ImportJob> {
        let job = match upload_id {
            Some(upload_id) => {
                let (job, created) = self
                    .jobs
                    .create_for_upload(upload_id, source_object_key)
                    .await?;
                if !created {
                    info!("upload {} already dispatched as job {}", upload_id, job.id);
                    return Ok(job);
                }
                job
            }
            None => self.jobs.create(source_object_key).await?,
        };
        let task = IngestTask {
            job_id: job.id.clone(),
            source_object_key: source_object_key.to_string(),
        };

        if let Err(err) = self.queue.enqueue(task).await {
            error!("could not enqueue job {}: {}", job.id, err);
            let log = ErrorLog::failure(FailureReason::StoreError, err.to_string());
            if let Err(finish_err) = self
                .jobs
                .finish(&job.id, JobStatus::Failed, &JobProgress::default(), &log)
                .await
            {
                warn!("failed to mark job {} as failed: {}", job.id, finish_err);
            }
            return Err(err.into());
        }

        info!("job {} dispatched for {}", job.id, source_object_key);
        Ok(job)
    }

    pub async fn get_status(&self, job_id: &str) -> JobResult<ImportJob> {
        self.jobs
            .get(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }

    /// Ask the worker to stop at its next batch boundary. A pending job is
    /// cancelled by the worker as soon as it is claimed. No effect on
    /// terminal jobs.
    pub async fn request_cancel(&self, job_id: &str) -> JobResult<ImportJob> {
        let job = self.jobs.request_cancel(job_id).await?;
        if job.status.is_terminal() {
            info!(
                "cancel for job {} ignored, already {}",
                job_id,
                job.status.as_str()
            );
        } else {
            info!("cancel requested for job {}", job_id);
        }
        Ok(job)
    }

    /// Recent jobs, newest first.
    pub async fn list(&self, limit: Option<u32>) -> JobResult<Vec<ImportJob>> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        Ok(self.jobs.list(limit).await?)
    }

    /// Fail jobs orphaned by a previous process and re-enqueue pending ones.
    /// Must run before workers start.
    pub async fn recover(&self) -> JobResult<RecoveryReport> {
        let interrupted = self.jobs.fail_interrupted().await?;
        if interrupted > 0 {
            warn!("marked {} interrupted jobs as failed", interrupted);
        }

        let pending = self.jobs.list_by_status(JobStatus::Pending).await?;
        let requeued = pending.len();
        for job in pending {
            self.queue
                .enqueue(IngestTask {
                    job_id: job.id,
                    source_object_key: job.source_object_key,
                })
                .await?;
        }
        if requeued > 0 {
            info!("re-enqueued {} pending jobs", requeued);
        }

        Ok(RecoveryReport {
            interrupted,
            requeued,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, services::job_queue::ChannelQueue};

    async fn service() -> (ImportJobService, JobStore, crate::services::job_queue::TaskReceiver) {
        let jobs = JobStore::new(Arc::new(db::memory_pool().await.unwrap()));
        let (queue, receiver) = ChannelQueue::new();
        (
            ImportJobService::new(jobs.clone(), Arc::new(queue)),
            jobs,
            receiver,
        )
    }

    #[tokio::test]
    async fn dispatch_creates_pending_job_and_enqueues_it() {
        let (service, _, receiver) = service().await;
        let job = service.dispatch("imports/a.csv", None).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let task = receiver.next().await.unwrap();
        assert_eq!(task.job_id, job.id);
        assert_eq!(task.source_object_key, "imports/a.csv");
    }

    #[tokio::test]
    async fn dispatch_fails_job_when_queue_is_closed() {
        let (service, jobs, receiver) = service().await;
        drop(receiver);

        let err = service.dispatch("imports/a.csv", None).await.unwrap_err();
        assert!(matches!(err, JobError::Queue(QueueError::Closed)));

        let all = jobs.list(10).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn dispatch_for_an_upload_is_idempotent() {
        let (service, _, receiver) = service().await;
        let first = service.dispatch("imports/u.csv", Some("u")).await.unwrap();
        let again = service.dispatch("imports/u.csv", Some("u")).await.unwrap();
        assert_eq!(again.id, first.id);
        let other = service.dispatch("imports/v.csv", None).await.unwrap();

        // The repeat enqueued nothing.
        assert_eq!(receiver.next().await.unwrap().job_id, first.id);
        assert_eq!(receiver.next().await.unwrap().job_id, other.id);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let (service, _, _rx) = service().await;
        assert!(matches!(
            service.get_status("nope").await,
            Err(JobError::NotFound(_))
        ));
        assert!(matches!(
            service.request_cancel("nope").await,
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancel_sets_flag_on_live_job() {
        let (service, _, _rx) = service().await;
        let job = service.dispatch("k", None).await.unwrap();
        let after = service.request_cancel(&job.id).await.unwrap();
        assert!(after.cancel_requested);
        assert_eq!(after.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn list_is_newest_first_and_bounded() {
        let (service, _, _rx) = service().await;
        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(service.dispatch(&format!("k{i}"), None).await.unwrap().id);
        }
        let listed = service.list(Some(2)).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, ids[2]);
        assert_eq!(listed[1].id, ids[1]);
        assert_eq!(service.list(Some(0)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn recover_fails_running_and_requeues_pending() {
        let (service, jobs, receiver) = service().await;
        let running = jobs.create("a").await.unwrap();
        jobs.claim(&running.id).await.unwrap();
        let pending = jobs.create("b").await.unwrap();

        let report = service.recover().await.unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                interrupted: 1,
                requeued: 1
            }
        );
        assert_eq!(receiver.next().await.unwrap().job_id, pending.id);
        assert_eq!(
            service.get_status(&running.id).await.unwrap().status,
            JobStatus::Failed
        );
    }
}
