use super::queue::{Job, JobQueue, JobState, SendOptions};
use crate::error::JobError;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// How long finished jobs stay readable through `get_job`.
pub const DEFAULT_FINISHED_RETENTION: Duration = Duration::from_secs(60 * 60);

struct Entry {
    job: Job,
    seq: u64,
    available_at: Instant,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

impl Entry {
    fn is_claimable(&self, queue: &str, now: Instant) -> bool {
        self.job.queue == queue && self.job.state.is_pending() && self.available_at <= now
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.job.state == JobState::Active
            && self.started_at.is_some_and(|started| {
                now.duration_since(started) >= Duration::from_secs(self.job.expire_in_secs)
            })
    }

    /// Count a failed attempt against the retry budget.
    fn record_failure(&mut self, error: &str, exhausted: JobState, now: Instant) -> JobState {
        self.job.last_error = Some(error.to_string());
        self.started_at = None;
        if self.job.retry_count < self.job.retry_limit {
            self.job.retry_count += 1;
            self.job.state = JobState::Retry;
            self.available_at = now + Duration::from_secs(self.job.retry_delay_secs);
        } else {
            self.job.state = exhausted;
        }
        if self.job.state.is_final() {
            self.finished_at = Some(now);
        }
        self.job.state
    }

    /// True while `claimed` is the attempt currently holding this job.
    fn is_held_by(&self, claimed: &Job) -> bool {
        self.job.state == JobState::Active && self.job.retry_count == claimed.retry_count
    }
}

#[derive(Default)]
struct State {
    jobs: HashMap<Uuid, Entry>,
    next_seq: u64,
}

impl State {
    fn prune(&mut self, now: Instant, retention: Duration) {
        let before = self.jobs.len();
        self.jobs.retain(|_, entry| {
            entry
                .finished_at
                .map_or(true, |finished| now.duration_since(finished) < retention)
        });
        let pruned = before - self.jobs.len();
        if pruned > 0 {
            debug!(pruned, "dropped finished jobs");
        }
    }

    fn held_entry(&mut self, claimed: &Job) -> Result<&mut Entry, JobError> {
        let entry = self
            .jobs
            .get_mut(&claimed.id)
            .ok_or_else(|| JobError::Queue(format!("unknown job {}", claimed.id)))?;
        if entry.is_held_by(claimed) {
            Ok(entry)
        } else {
            Err(JobError::StaleAttempt {
                job_id: claimed.id,
                retry_count: claimed.retry_count,
            })
        }
    }
}

/// In-process queue for single-node deployments and tests. Claims happen
/// under one lock, so each job is delivered to exactly one fetch.
///
/// Timing uses `tokio::time`, so paused test clocks drive retry delays and
/// expiry. Completed, failed and expired jobs are dropped once they have
/// been finished for longer than the retention window.
pub struct InMemoryJobQueue {
    state: Mutex<State>,
    retention: Duration,
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::with_retention(DEFAULT_FINISHED_RETENTION)
    }
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            retention,
        }
    }

    /// Every retained job, oldest first.
    pub async fn jobs(&self) -> Vec<Job> {
        let state = self.state.lock().await;
        let mut entries: Vec<&Entry> = state.jobs.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| entry.job.clone()).collect()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn send(
        &self,
        queue: &str,
        payload: JsonValue,
        options: SendOptions,
    ) -> Result<Uuid, JobError> {
        let mut state = self.state.lock().await;
        state.prune(Instant::now(), self.retention);
        let id = Uuid::new_v4();
        let seq = state.next_seq;
        state.next_seq += 1;

        state.jobs.insert(
            id,
            Entry {
                job: Job {
                    id,
                    queue: queue.to_string(),
                    payload,
                    priority: options.priority,
                    state: JobState::Created,
                    retry_count: 0,
                    retry_limit: options.retry_limit,
                    retry_delay_secs: options.retry_delay,
                    expire_in_secs: options.expire_in_seconds,
                    last_error: None,
                    created_at: Utc::now(),
                },
                seq,
                available_at: Instant::now(),
                started_at: None,
                finished_at: None,
            },
        );
        debug!(job_id = %id, queue, priority = options.priority, "job queued");
        Ok(id)
    }

    async fn fetch(&self, queue: &str, batch_size: usize) -> Result<Vec<Job>, JobError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        for entry in state.jobs.values_mut().filter(|entry| entry.is_expired(now)) {
            let next = entry.record_failure("job expired", JobState::Expired, now);
            warn!(job_id = %entry.job.id, state = %next, "active job expired");
        }
        state.prune(now, self.retention);

        let mut ready: Vec<&mut Entry> = state
            .jobs
            .values_mut()
            .filter(|entry| entry.is_claimable(queue, now))
            .collect();
        ready.sort_by(|left, right| {
            right
                .job
                .priority
                .cmp(&left.job.priority)
                .then(left.seq.cmp(&right.seq))
        });

        Ok(ready
            .into_iter()
            .take(batch_size)
            .map(|entry| {
                entry.job.state = JobState::Active;
                entry.started_at = Some(now);
                entry.job.clone()
            })
            .collect())
    }

    async fn complete(&self, job: &Job) -> Result<(), JobError> {
        let mut state = self.state.lock().await;
        let entry = state.held_entry(job)?;
        entry.job.state = JobState::Completed;
        entry.started_at = None;
        entry.finished_at = Some(Instant::now());
        Ok(())
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<JobState, JobError> {
        let mut state = self.state.lock().await;
        let entry = state.held_entry(job)?;
        Ok(entry.record_failure(error, JobState::Failed, Instant::now()))
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, JobError> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&job_id).map(|entry| entry.job.clone()))
    }

    async fn pending_count(&self, queue: &str) -> Result<usize, JobError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|entry| entry.job.queue == queue && entry.job.state.is_pending())
            .count())
    }
}
