use super::queue::{Job, JobHandler, JobQueue, SendOptions};
use super::worker::{work, WorkOptions, WorkerHandle};
use crate::cancel::CancellationSignal;
use crate::config::JobConfig;
use crate::error::JobError;
use crate::models::IndexResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub const INDEX_JOB_RETRY_LIMIT: u32 = 3;
pub const INDEX_JOB_RETRY_DELAY_SECS: u64 = 30;
pub const INDEX_JOB_EXPIRE_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexFilePayload {
    pub file_id: Uuid,
    pub user_id: Uuid,
}

pub fn index_file_send_options(priority: i32) -> SendOptions {
    SendOptions {
        priority,
        retry_limit: INDEX_JOB_RETRY_LIMIT,
        retry_delay: INDEX_JOB_RETRY_DELAY_SECS,
        expire_in_seconds: INDEX_JOB_EXPIRE_SECS,
    }
}

/// Whatever runs one indexing pass for a file.
#[async_trait]
pub trait FileIndexer: Send + Sync {
    async fn index_file(&self, file_id: Uuid, cancel: CancellationSignal) -> IndexResult;
}

/// Queue-facing translation of an indexing result: a failed run becomes an
/// error so the queue counts the attempt and schedules a retry.
pub fn index_result_to_job_outcome(result: &IndexResult) -> Result<(), JobError> {
    if result.success {
        return Ok(());
    }
    let reason = result.error.as_deref().unwrap_or("indexing failed");
    Err(JobError::HandlerFailed(format!(
        "file {}: {reason}",
        result.file_id
    )))
}

pub struct IndexFileJobHandler {
    indexer: Arc<dyn FileIndexer>,
}

impl IndexFileJobHandler {
    pub fn new(indexer: Arc<dyn FileIndexer>) -> Self {
        Self { indexer }
    }
}

#[async_trait]
impl JobHandler for IndexFileJobHandler {
    #[instrument(skip_all, fields(job_id = %job.id))]
    async fn handle(&self, job: &Job, cancel: CancellationSignal) -> Result<(), JobError> {
        let payload: IndexFilePayload = job.payload_as()?;
        let result = self.indexer.index_file(payload.file_id, cancel).await;

        if result.success {
            info!(
                file_id = %payload.file_id,
                chunks_created = result.chunks_created,
                total_chunks = result.total_chunks,
                "index job finished"
            );
        } else {
            warn!(
                file_id = %payload.file_id,
                retryable = result.retryable,
                error = result.error.as_deref().unwrap_or_default(),
                "index job failed"
            );
        }

        index_result_to_job_outcome(&result)
    }
}

/// Sends indexing work to the queue and starts workers for it.
pub struct JobScheduler {
    queue: Arc<dyn JobQueue>,
    config: JobConfig,
}

impl JobScheduler {
    pub fn new(queue: Arc<dyn JobQueue>, config: JobConfig) -> Self {
        Self { queue, config }
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn queue_name(&self) -> &str {
        &self.config.queue_name
    }

    /// Queue one indexing pass. `priority` defaults to 0.
    pub async fn enqueue_index_file(
        &self,
        file_id: Uuid,
        user_id: Uuid,
        priority: Option<i32>,
    ) -> Result<Uuid, JobError> {
        let payload = serde_json::to_value(IndexFilePayload { file_id, user_id })?;
        let options = index_file_send_options(priority.unwrap_or(0));
        let job_id = self
            .queue
            .send(&self.config.queue_name, payload, options)
            .await?;

        info!(%job_id, %file_id, priority = options.priority, "index job enqueued");
        Ok(job_id)
    }

    /// Poll until every listed job reaches a final state and return the
    /// jobs as last seen. Jobs the queue no longer tracks count as finished.
    pub async fn wait_for_jobs(
        &self,
        job_ids: &[Uuid],
        poll_interval: Duration,
    ) -> Result<Vec<Job>, JobError> {
        let mut finished = Vec::with_capacity(job_ids.len());
        for &job_id in job_ids {
            loop {
                match self.queue.get_job(job_id).await? {
                    Some(job) if job.state.is_final() => {
                        debug!(%job_id, state = %job.state, "job finished");
                        finished.push(job);
                        break;
                    }
                    Some(_) => tokio::time::sleep(poll_interval).await,
                    None => {
                        warn!(%job_id, "job no longer tracked by the queue");
                        break;
                    }
                }
            }
        }
        Ok(finished)
    }

    /// Start a worker that feeds index jobs to `indexer`. Shutting the worker
    /// down cancels the run in progress.
    pub fn register_index_file_handler(&self, indexer: Arc<dyn FileIndexer>) -> WorkerHandle {
        work(
            Arc::clone(&self.queue),
            self.config.queue_name.clone(),
            WorkOptions::from(&self.config),
            Arc::new(IndexFileJobHandler::new(indexer)),
        )
    }
}
