//! Persistent job queue rows.

use super::JobStatus;
use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;
use std::time::Duration;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct QueueJob {
    pub id: i64,
    pub queue_name: String,
    pub task_type: String,
    pub payload: Vec<u8>,
    pub status: JobStatus,
    pub retry_count: i32,
    pub max_retry: i32,
    pub schedule_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

/// A job to enqueue. `schedule_at = None` means "run as soon as possible".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub queue_name: String,
    pub task_type: String,
    pub payload: Vec<u8>,
    pub schedule_at: Option<OffsetDateTime>,
    pub max_retry: i32,
}

impl NewJob {
    pub const DEFAULT_MAX_RETRY: i32 = 3;

    pub fn new(queue_name: &str, task_type: &str, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            queue_name: queue_name.to_string(),
            task_type: task_type.to_string(),
            payload: payload.into(),
            schedule_at: None,
            max_retry: Self::DEFAULT_MAX_RETRY,
        }
    }

    pub fn schedule_at(mut self, at: OffsetDateTime) -> Self {
        self.schedule_at = Some(at);
        self
    }

    /// Non-positive values fall back to [`Self::DEFAULT_MAX_RETRY`].
    pub fn max_retry(mut self, max_retry: i32) -> Self {
        self.max_retry = if max_retry > 0 {
            max_retry
        } else {
            Self::DEFAULT_MAX_RETRY
        };
        self
    }
}

#[derive(Debug, Clone)]
pub struct EnqueueJob {
    pub job: NewJob,
}

impl Processor<EnqueueJob> for DatabaseProcessor {
    type Output = i64;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:EnqueueJob")]
    async fn process(&self, cmd: EnqueueJob) -> Result<i64, sqlx::Error> {
        insert_job(&self.pool, cmd.job).await
    }
}

/// Shared by [`EnqueueJob`] and statements that enqueue inside their own
/// transaction.
pub(crate) async fn insert_job<'e, E>(executor: E, job: NewJob) -> Result<i64, sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query_scalar(
        r#"
        INSERT INTO queue_jobs (queue_name, task_type, payload, status, max_retry, schedule_at)
        VALUES ($1, $2, $3, 'pending', $4, COALESCE($5, NOW()))
        RETURNING id
        "#,
    )
    .bind(job.queue_name)
    .bind(job.task_type)
    .bind(job.payload)
    .bind(job.max_retry)
    .bind(job.schedule_at)
    .fetch_one(executor)
    .await
}

#[derive(Debug, Clone)]
/// Atomically move the oldest due Pending job of a queue to Processing.
///
/// `SKIP LOCKED` lets concurrent workers claim different rows without
/// blocking each other; each row is handed to exactly one of them.
pub struct ClaimNextJob {
    pub queue_name: String,
    pub now: OffsetDateTime,
}

impl Processor<ClaimNextJob> for DatabaseProcessor {
    type Output = Option<QueueJob>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ClaimNextJob")]
    async fn process(&self, query: ClaimNextJob) -> Result<Option<QueueJob>, sqlx::Error> {
        sqlx::query_as::<_, QueueJob>(
            r#"
            UPDATE queue_jobs SET status = 'processing', updated_at = NOW()
            WHERE id = (
                SELECT id FROM queue_jobs
                WHERE queue_name = $1 AND status = 'pending' AND schedule_at <= $2
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(query.queue_name)
        .bind(query.now)
        .fetch_optional(&self.pool)
        .await
    }
}

#[derive(Debug, Clone)]
pub struct CompleteJob {
    pub id: i64,
}

impl Processor<CompleteJob> for DatabaseProcessor {
    type Output = bool;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:CompleteJob")]
    async fn process(&self, cmd: CompleteJob) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE queue_jobs SET status = 'completed', updated_at = NOW() WHERE id = $1",
        )
        .bind(cmd.id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Debug, Clone)]
/// Record a failed attempt: bump the retry count, then either reschedule
/// with linear backoff or mark the job Failed once `max_retry` is reached.
pub struct FailJob {
    pub id: i64,
    pub backoff_unit: Duration,
}

impl Processor<FailJob> for DatabaseProcessor {
    type Output = Option<JobStatus>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:FailJob")]
    async fn process(&self, cmd: FailJob) -> Result<Option<JobStatus>, sqlx::Error> {
        sqlx::query_scalar(
            r#"
            UPDATE queue_jobs
            SET retry_count = retry_count + 1,
                status = CASE WHEN retry_count + 1 >= max_retry
                    THEN 'failed'::job_status ELSE 'pending'::job_status END,
                schedule_at = CASE WHEN retry_count + 1 >= max_retry
                    THEN schedule_at
                    ELSE NOW() + make_interval(secs => (retry_count + 1) * $2) END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING status
            "#,
        )
        .bind(cmd.id)
        .bind(cmd.backoff_unit.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
    }
}

#[derive(Debug, Clone)]
pub struct GetJob {
    pub id: i64,
}

impl Processor<GetJob> for DatabaseProcessor {
    type Output = Option<QueueJob>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetJob")]
    async fn process(&self, query: GetJob) -> Result<Option<QueueJob>, sqlx::Error> {
        sqlx::query_as::<_, QueueJob>("SELECT * FROM queue_jobs WHERE id = $1")
            .bind(query.id)
            .fetch_optional(&self.pool)
            .await
    }
}

#[derive(Debug, Clone)]
/// Hand Processing jobs whose worker went away back to Pending.
pub struct RequeueStaleJobs {
    pub older_than: OffsetDateTime,
}

impl Processor<RequeueStaleJobs> for DatabaseProcessor {
    type Output = u64;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:RequeueStaleJobs")]
    async fn process(&self, cmd: RequeueStaleJobs) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs SET status = 'pending', updated_at = NOW()
            WHERE status = 'processing' AND updated_at < $1
            "#,
        )
        .bind(cmd.older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone)]
pub struct PurgeFinishedJobs {
    pub older_than: OffsetDateTime,
}

impl Processor<PurgeFinishedJobs> for DatabaseProcessor {
    type Output = u64;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:PurgeFinishedJobs")]
    async fn process(&self, cmd: PurgeFinishedJobs) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM queue_jobs
            WHERE status IN ('completed', 'failed') AND updated_at < $1
            "#,
        )
        .bind(cmd.older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
