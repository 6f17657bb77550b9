//! Queue types shared by every backend.

use crate::cancel::CancellationSignal;
use crate::error::JobError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Per-job delivery options, fixed at send time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOptions {
    /// Higher runs first.
    pub priority: i32,
    /// Failed attempts allowed after the first one.
    pub retry_limit: u32,
    /// Seconds to wait before a failed job becomes claimable again.
    pub retry_delay: u64,
    /// Seconds an active job may run before it is considered lost.
    pub expire_in_seconds: u64,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            retry_limit: 0,
            retry_delay: 0,
            expire_in_seconds: 15 * 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Created,
    Retry,
    Active,
    Completed,
    Failed,
    Expired,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Retry => "retry",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Expired => "expired",
        }
    }

    /// Waiting to be claimed.
    pub fn is_pending(&self) -> bool {
        matches!(self, JobState::Created | JobState::Retry)
    }

    /// No further attempt will be made.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Expired
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = JobError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "created" => Ok(JobState::Created),
            "retry" => Ok(JobState::Retry),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "expired" => Ok(JobState::Expired),
            other => Err(JobError::Queue(format!("unknown job state {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    pub payload: JsonValue,
    pub priority: i32,
    pub state: JobState,
    pub retry_count: u32,
    pub retry_limit: u32,
    pub retry_delay_secs: u64,
    pub expire_in_secs: u64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn options(&self) -> SendOptions {
        SendOptions {
            priority: self.priority,
            retry_limit: self.retry_limit,
            retry_delay: self.retry_delay_secs,
            expire_in_seconds: self.expire_in_secs,
        }
    }
}

/// Durable job storage with exactly-once claiming.
///
/// A claimed job stays `active` until the worker reports it through
/// [`complete`](JobQueue::complete) or [`fail`](JobQueue::fail). A failure
/// moves it to `retry` while its retry budget lasts and to `failed` after.
///
/// Reports carry the job as it was claimed. The claimed `retry_count`
/// identifies the attempt, so a report for an attempt that already expired
/// (and may have been handed to another worker) is rejected with
/// [`JobError::StaleAttempt`] and leaves the job untouched.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn send(
        &self,
        queue: &str,
        payload: JsonValue,
        options: SendOptions,
    ) -> Result<Uuid, JobError>;

    /// Claim up to `batch_size` ready jobs, highest priority first, oldest
    /// first within a priority. No job is handed to two callers.
    async fn fetch(&self, queue: &str, batch_size: usize) -> Result<Vec<Job>, JobError>;

    async fn complete(&self, job: &Job) -> Result<(), JobError>;

    /// Record a failed attempt. Returns the state the job moved to.
    async fn fail(&self, job: &Job, error: &str) -> Result<JobState, JobError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, JobError>;

    /// Jobs in `created` or `retry`.
    async fn pending_count(&self, queue: &str) -> Result<usize, JobError>;
}

/// Work done for one claimed job. An `Err` tells the queue the attempt failed.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job, cancel: CancellationSignal) -> Result<(), JobError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_options_serialize_in_camel_case() {
        let options = SendOptions {
            priority: 5,
            retry_limit: 3,
            retry_delay: 30,
            expire_in_seconds: 3600,
        };
        let json = serde_json::to_value(options).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "priority": 5,
                "retryLimit": 3,
                "retryDelay": 30,
                "expireInSeconds": 3600,
            })
        );
    }

    #[test]
    fn states_round_trip_through_strings() {
        for state in [
            JobState::Created,
            JobState::Retry,
            JobState::Active,
            JobState::Completed,
            JobState::Failed,
            JobState::Expired,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("queued".parse::<JobState>().is_err());
    }
}
