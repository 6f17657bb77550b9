use super::queue::{Job, JobQueue, JobState, SendOptions};
use crate::error::JobError;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use tracing::{debug, warn};
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, queue, payload, priority, state, retry_count, retry_limit, \
     retry_delay_secs, expire_in_secs, last_error, created_at";

/// Postgres-backed queue. Several worker processes may poll the same table;
/// claims use `FOR UPDATE SKIP LOCKED` so each job goes to one of them.
#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fail jobs whose worker has held them longer than `expire_in_secs`.
    async fn expire_stale(&self, queue: &str) -> Result<u64, JobError> {
        let result = sqlx::query(
            "UPDATE index_jobs
             SET state = CASE WHEN retry_count < retry_limit THEN 'retry' ELSE 'expired' END,
                 retry_count = CASE WHEN retry_count < retry_limit THEN retry_count + 1
                                    ELSE retry_count END,
                 start_after = now() + retry_delay_secs * interval '1 second',
                 started_at = NULL,
                 last_error = 'job expired'
             WHERE queue = $1
               AND state = 'active'
               AND started_at + expire_in_secs * interval '1 second' < now()",
        )
        .bind(queue)
        .execute(&self.pool)
        .await?;

        let expired = result.rows_affected();
        if expired > 0 {
            warn!(queue, expired, "expired stale active jobs");
        }
        Ok(expired)
    }
}

fn to_i32(value: u32, field: &str) -> Result<i32, JobError> {
    i32::try_from(value).map_err(|_| JobError::Queue(format!("{field} out of range: {value}")))
}

fn to_i64(value: u64, field: &str) -> Result<i64, JobError> {
    i64::try_from(value).map_err(|_| JobError::Queue(format!("{field} out of range: {value}")))
}

fn stale(job: &Job) -> JobError {
    JobError::StaleAttempt {
        job_id: job.id,
        retry_count: job.retry_count,
    }
}

fn parse_job_row(row: &PgRow) -> Result<Job, JobError> {
    let state: String = row.try_get("state")?;
    let retry_count: i32 = row.try_get("retry_count")?;
    let retry_limit: i32 = row.try_get("retry_limit")?;
    let retry_delay_secs: i64 = row.try_get("retry_delay_secs")?;
    let expire_in_secs: i64 = row.try_get("expire_in_secs")?;

    Ok(Job {
        id: row.try_get("id")?,
        queue: row.try_get("queue")?,
        payload: row.try_get("payload")?,
        priority: row.try_get("priority")?,
        state: state.parse()?,
        retry_count: retry_count.max(0) as u32,
        retry_limit: retry_limit.max(0) as u32,
        retry_delay_secs: retry_delay_secs.max(0) as u64,
        expire_in_secs: expire_in_secs.max(0) as u64,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn send(
        &self,
        queue: &str,
        payload: JsonValue,
        options: SendOptions,
    ) -> Result<Uuid, JobError> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO index_jobs
                 (id, queue, payload, priority, retry_limit, retry_delay_secs, expire_in_secs)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(id)
        .bind(queue)
        .bind(&payload)
        .bind(options.priority)
        .bind(to_i32(options.retry_limit, "retry_limit")?)
        .bind(to_i64(options.retry_delay, "retry_delay")?)
        .bind(to_i64(options.expire_in_seconds, "expire_in_seconds")?)
        .execute(&self.pool)
        .await?;

        debug!(job_id = %id, queue, priority = options.priority, "job queued");
        Ok(id)
    }

    async fn fetch(&self, queue: &str, batch_size: usize) -> Result<Vec<Job>, JobError> {
        self.expire_stale(queue).await?;

        let limit = i64::try_from(batch_size.max(1)).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            "UPDATE index_jobs
             SET state = 'active', started_at = now()
             WHERE id IN (
                 SELECT id FROM index_jobs
                 WHERE queue = $1
                   AND state IN ('created', 'retry')
                   AND start_after <= now()
                 ORDER BY priority DESC, created_at ASC
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(queue)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = rows
            .iter()
            .map(parse_job_row)
            .collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by(|left, right| {
            right
                .priority
                .cmp(&left.priority)
                .then(left.created_at.cmp(&right.created_at))
        });
        Ok(jobs)
    }

    async fn complete(&self, job: &Job) -> Result<(), JobError> {
        let result = sqlx::query(
            "UPDATE index_jobs
             SET state = 'completed', started_at = NULL, completed_at = now()
             WHERE id = $1 AND state = 'active' AND retry_count = $2",
        )
        .bind(job.id)
        .bind(to_i32(job.retry_count, "retry_count")?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(stale(job));
        }
        Ok(())
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<JobState, JobError> {
        let state: Option<String> = sqlx::query_scalar(
            "UPDATE index_jobs
             SET state = CASE WHEN retry_count < retry_limit THEN 'retry' ELSE 'failed' END,
                 retry_count = CASE WHEN retry_count < retry_limit THEN retry_count + 1
                                    ELSE retry_count END,
                 start_after = now() + retry_delay_secs * interval '1 second',
                 completed_at = CASE WHEN retry_count < retry_limit THEN NULL ELSE now() END,
                 started_at = NULL,
                 last_error = $3
             WHERE id = $1 AND state = 'active' AND retry_count = $2
             RETURNING state",
        )
        .bind(job.id)
        .bind(to_i32(job.retry_count, "retry_count")?)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        match state {
            Some(state) => state.parse(),
            None => Err(stale(job)),
        }
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, JobError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM index_jobs WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_job_row).transpose()
    }

    async fn pending_count(&self, queue: &str) -> Result<usize, JobError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM index_jobs WHERE queue = $1 AND state IN ('created', 'retry')",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_options_are_rejected() {
        assert!(to_i32(u32::MAX, "retry_limit").is_err());
        assert_eq!(to_i64(3600, "expire_in_seconds").unwrap(), 3600);
    }
}
