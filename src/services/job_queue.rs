//! src/services/job_queue.rs
//!
//! Task dispatch for ingest work. `JobQueue` is the seam for an external
//! at-least-once queue; `ChannelQueue` is the in-process implementation,
//! drained by a fixed pool of workers.

use crate::services::ingest::IngestPipeline;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info};

/// Payload handed to a worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestTask {
    pub job_id: String,
    pub source_object_key: String,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job queue is closed")]
    Closed,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, task: IngestTask) -> Result<(), QueueError>;
}

/// Receiving half shared by every worker.
#[derive(Clone)]
pub struct TaskReceiver {
    inner: Arc<Mutex<mpsc::UnboundedReceiver<IngestTask>>>,
}

impl TaskReceiver {
    /// Next task, or `None` once every sender is gone.
    pub async fn next(&self) -> Option<IngestTask> {
        self.inner.lock().await.recv().await
    }
}

#[derive(Clone)]
pub struct ChannelQueue {
    tx: mpsc::UnboundedSender<IngestTask>,
}

impl ChannelQueue {
    pub fn new() -> (Self, TaskReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self { tx },
            TaskReceiver {
                inner: Arc::new(Mutex::new(rx)),
            },
        )
    }
}

#[async_trait]
impl JobQueue for ChannelQueue {
    async fn enqueue(&self, task: IngestTask) -> Result<(), QueueError> {
        debug!("enqueueing job {}", task.job_id);
        self.tx.send(task).map_err(|_| QueueError::Closed)
    }
}

/// Spawn `count` workers that run the pipeline for each delivered task.
/// Duplicate deliveries are absorbed by the pipeline's claim step.
pub fn spawn_workers(
    count: usize,
    receiver: TaskReceiver,
    pipeline: IngestPipeline,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|worker| {
            let receiver = receiver.clone();
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                debug!("ingest worker {} started", worker);
                while let Some(task) = receiver.next().await {
                    pipeline.run(&task).await;
                }
                info!("ingest worker {} stopped", worker);
            })
        })
        .collect()
}
