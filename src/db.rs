use crate::error::StoreError;
use crate::store::{FailureUpdate, JobStore};
use crate::{Job, JobStatus, Priority};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;
use std::sync::Arc;
use tracing::{debug, instrument};

const JOB_COLUMNS: &str = "id, instance_id, queue_name, priority, payload, status, attempts, \
    max_attempts, scheduled_at, dispatched_at, lease_expires_at, created_at, started_at, \
    completed_at, error_message, result";

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    instance_id: Option<String>,
    queue_name: String,
    priority: Priority,
    payload: String,
    status: JobStatus,
    attempts: i32,
    max_attempts: i32,
    scheduled_at: DateTime<Utc>,
    dispatched_at: Option<DateTime<Utc>>,
    lease_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    result: Option<String>,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            id: row.id,
            queue_name: row.queue_name,
            payload: row.payload,
            priority: row.priority,
            scope: row.instance_id,
            durable: true,
            status: row.status,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            created_at: row.created_at,
            scheduled_at: row.scheduled_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            lease_expires_at: row.lease_expires_at,
            dispatched_at: row.dispatched_at,
            error_message: row.error_message,
            result: row.result,
        }
    }
}

/// PostgreSQL connection pool owning the job table and the broker fallback tables.
#[derive(Clone, Debug)]
pub struct DbHandle {
    pool: Arc<PgPool>,
}

impl DbHandle {
    /// Connects and creates the schema if it is missing.
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(DbHandle {
            pool: Arc::new(pool),
        })
    }

    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    fn jobs_query(sql: &str) -> String {
        sql.replace("{columns}", JOB_COLUMNS)
    }
}

#[async_trait]
impl JobStore for DbHandle {
    #[instrument(name = "db.insert_job", skip_all, fields(job_id = %job.id))]
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        debug!("Persisting job");
        sqlx::query(
            "INSERT INTO queue_jobs \
            (id, instance_id, queue_name, priority, payload, status, attempts, max_attempts, \
                scheduled_at, dispatched_at, created_at) \
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(&job.id)
        .bind(&job.scope)
        .bind(&job.queue_name)
        .bind(job.priority)
        .bind(&job.payload)
        .bind(job.status)
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.scheduled_at)
        .bind(job.dispatched_at)
        .bind(job.created_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&Self::jobs_query(
            "SELECT {columns} FROM queue_jobs WHERE id = $1",
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(row.map(Job::from))
    }

    #[instrument(name = "db.begin_job", skip_all, fields(job_id = %id))]
    async fn begin(
        &self,
        id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&Self::jobs_query(
            "UPDATE queue_jobs \
                SET status = 'PROCESSING', \
                started_at = $2, \
                lease_expires_at = $3, \
                dispatched_at = NULL \
            WHERE id = $1 \
                AND status IN ('PENDING', 'RETRY') \
                AND (dispatched_at IS NOT NULL OR scheduled_at <= $2) \
            RETURNING {columns}",
        ))
        .bind(id)
        .bind(now)
        .bind(lease_until)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(row.map(Job::from))
    }

    #[instrument(name = "db.complete_job", skip_all, fields(job_id = %id))]
    async fn complete(
        &self,
        id: &str,
        now: DateTime<Utc>,
        result: Option<&str>,
    ) -> Result<bool, StoreError> {
        let done = sqlx::query(
            "UPDATE queue_jobs \
                SET status = 'COMPLETED', \
                completed_at = $2, \
                lease_expires_at = NULL, \
                result = $3 \
            WHERE id = $1 AND status IN ('PROCESSING', 'RETRY')",
        )
        .bind(id)
        .bind(now)
        .bind(result)
        .execute(&*self.pool)
        .await?;

        Ok(done.rows_affected() == 1)
    }

    #[instrument(name = "db.fail_job", skip_all, fields(job_id = %id, status = %update.status))]
    async fn record_failure(&self, id: &str, update: &FailureUpdate) -> Result<bool, StoreError> {
        let done = sqlx::query(
            "UPDATE queue_jobs \
                SET attempts = $3, \
                status = $4, \
                error_message = $5, \
                scheduled_at = COALESCE($6, scheduled_at), \
                completed_at = CASE WHEN $4 = 'FAILED'::queue_job_status THEN $7 ELSE completed_at END, \
                lease_expires_at = NULL, \
                dispatched_at = NULL \
            WHERE id = $1 \
                AND attempts = $2 \
                AND status IN ('PENDING', 'PROCESSING', 'RETRY')",
        )
        .bind(id)
        .bind(update.expected_attempts)
        .bind(update.attempts)
        .bind(update.status)
        .bind(&update.error_message)
        .bind(update.retry_at)
        .bind(update.at)
        .execute(&*self.pool)
        .await?;

        Ok(done.rows_affected() == 1)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError> {
        debug!("Claiming up to {} due jobs", limit);
        let rows = sqlx::query_as::<_, JobRow>(&Self::jobs_query(
            "UPDATE queue_jobs \
                SET dispatched_at = $1 \
            WHERE id IN ( \
                SELECT id FROM queue_jobs \
                WHERE status IN ('PENDING', 'RETRY') \
                    AND scheduled_at <= $1 \
                    AND (dispatched_at IS NULL OR dispatched_at < $2) \
                ORDER BY priority DESC, scheduled_at ASC \
                LIMIT $3 \
                FOR UPDATE SKIP LOCKED \
            ) \
            RETURNING {columns}",
        ))
        .bind(now)
        .bind(stale_before)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        // RETURNING does not keep the subquery's order.
        let mut jobs: Vec<Job> = rows.into_iter().map(Job::from).collect();
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.scheduled_at.cmp(&b.scheduled_at))
        });
        Ok(jobs)
    }

    async fn expired_leases(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(&Self::jobs_query(
            "SELECT {columns} FROM queue_jobs \
            WHERE status = 'PROCESSING' AND lease_expires_at < $1 \
            ORDER BY lease_expires_at ASC \
            LIMIT $2",
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows.into_iter().map(Job::from).collect())
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let done = sqlx::query(
            "DELETE FROM queue_jobs \
            WHERE status IN ('COMPLETED', 'FAILED') \
                AND COALESCE(completed_at, created_at) < $1",
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await?;

        Ok(done.rows_affected())
    }

    async fn by_scope(
        &self,
        scope: &str,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(&Self::jobs_query(
            "SELECT {columns} FROM queue_jobs \
            WHERE instance_id = $1 \
                AND ($2::queue_job_status IS NULL OR status = $2) \
            ORDER BY created_at ASC",
        ))
        .bind(scope)
        .bind(status)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows.into_iter().map(Job::from).collect())
    }
}
