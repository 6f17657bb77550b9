//! Polling worker loop shared by every queue backend.

use super::queue::{Job, JobHandler, JobQueue, JobState};
use crate::cancel::{cancellation, CancellationSignal, CancellationSource};
use crate::config::JobConfig;
use crate::error::JobError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkOptions {
    /// Jobs claimed per poll.
    pub batch_size: usize,
    /// Sleep between polls when the queue is empty.
    pub polling_interval: Duration,
}

impl WorkOptions {
    pub fn new(batch_size: usize, polling_interval: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            polling_interval,
        }
    }
}

impl From<&JobConfig> for WorkOptions {
    fn from(config: &JobConfig) -> Self {
        Self::new(config.batch_size, config.polling_interval())
    }
}

/// Handle to a running worker. Dropping it leaves the worker running.
pub struct WorkerHandle {
    queue_name: String,
    cancel: CancellationSource,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Signal handed to in-flight handlers; raised by [`shutdown`](Self::shutdown).
    pub fn signal(&self) -> CancellationSignal {
        self.cancel.signal()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop polling, cancel the in-flight job cooperatively and wait for the
    /// loop to exit.
    pub async fn shutdown(self) -> Result<(), JobError> {
        self.cancel.cancel();
        self.task
            .await
            .map_err(|error| JobError::Queue(format!("worker task failed: {error}")))
    }
}

/// Start polling `queue_name`, handing each claimed job to `handler`.
///
/// Jobs whose handler returns `Err` are reported to the queue as failed so its
/// retry bookkeeping runs.
pub fn work(
    queue: Arc<dyn JobQueue>,
    queue_name: impl Into<String>,
    options: WorkOptions,
    handler: Arc<dyn JobHandler>,
) -> WorkerHandle {
    let queue_name = queue_name.into();
    let (cancel, signal) = cancellation();

    let task = tokio::spawn(run(
        queue,
        queue_name.clone(),
        options,
        handler,
        signal,
    ));

    WorkerHandle {
        queue_name,
        cancel,
        task,
    }
}

#[instrument(skip(queue, handler, signal))]
async fn run(
    queue: Arc<dyn JobQueue>,
    queue_name: String,
    options: WorkOptions,
    handler: Arc<dyn JobHandler>,
    signal: CancellationSignal,
) {
    info!(
        batch_size = options.batch_size,
        polling_interval_ms = options.polling_interval.as_millis() as u64,
        "job worker started"
    );

    while !signal.is_cancelled() {
        let jobs = match queue.fetch(&queue_name, options.batch_size).await {
            Ok(jobs) => jobs,
            Err(error) => {
                error!(%error, "failed to claim jobs");
                Vec::new()
            }
        };

        if jobs.is_empty() {
            tokio::select! {
                _ = signal.cancelled() => break,
                _ = tokio::time::sleep(options.polling_interval) => {}
            }
            continue;
        }

        debug!(claimed = jobs.len(), "processing job batch");
        for job in jobs {
            execute_job(queue.as_ref(), handler.as_ref(), job, signal.clone()).await;
        }
    }

    info!("job worker stopped");
}

#[instrument(skip_all, fields(job_id = %job.id, retry_count = job.retry_count))]
async fn execute_job(
    queue: &dyn JobQueue,
    handler: &dyn JobHandler,
    job: Job,
    signal: CancellationSignal,
) {
    let start = Instant::now();
    info!("processing job");

    match handler.handle(&job, signal).await {
        Ok(()) => match queue.complete(&job).await {
            Ok(()) => info!(
                duration_ms = start.elapsed().as_millis() as u64,
                "job completed"
            ),
            Err(error @ JobError::StaleAttempt { .. }) => {
                warn!(%error, "job finished after its attempt expired, result dropped")
            }
            Err(error) => error!(%error, "failed to mark job as completed"),
        },
        Err(failure) => {
            let message = failure.to_string();
            match queue.fail(&job, &message).await {
                Ok(JobState::Retry) => warn!(
                    error = %message,
                    retry_limit = job.retry_limit,
                    "job failed, will retry"
                ),
                Ok(state) => warn!(error = %message, %state, "job failed permanently"),
                Err(error @ JobError::StaleAttempt { .. }) => {
                    warn!(%error, "job failed after its attempt expired, result dropped")
                }
                Err(error) => error!(%error, "failed to mark job as failed"),
            }
        }
    }
}
