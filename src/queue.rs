//! Priority job queue over the [`Broker`] and the persisted job table.
//!
//! Each logical queue is split into three physical broker lists, one per
//! [`Priority`]. Immediate jobs go straight onto their list; delayed jobs only
//! get a row and reach the broker once [`JobQueue::process_scheduled_jobs`]
//! finds them due. Durable jobs keep their row in sync through `pop`,
//! `complete` and `fail`; ephemeral jobs exist only in the broker.
//!
//! Delivery is at-least-once. A durable job can be pushed to the broker more
//! than once (redispatch of a lost delivery, a slow worker whose lease was
//! reclaimed); `pop` discards any copy whose row is no longer claimable.

use crate::broker::Broker;
use crate::clock::{Clock, SystemClock};
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::retry::RetryPolicy;
use crate::store::{FailureUpdate, JobStore};
use crate::{Job, JobRequest, JobStatus, Priority};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What travels through the broker lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobEnvelope {
    id: String,
    queue_name: String,
    payload: String,
    priority: Priority,
    scope: Option<String>,
    durable: bool,
    attempts: i32,
    max_attempts: i32,
    created_at: DateTime<Utc>,
}

impl From<&Job> for JobEnvelope {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            queue_name: job.queue_name.clone(),
            payload: job.payload.clone(),
            priority: job.priority,
            scope: job.scope.clone(),
            durable: job.durable,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            created_at: job.created_at,
        }
    }
}

impl JobEnvelope {
    fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: self.id,
            queue_name: self.queue_name,
            payload: self.payload,
            priority: self.priority,
            scope: self.scope,
            durable: self.durable,
            status: JobStatus::Processing,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            created_at: self.created_at,
            scheduled_at: self.created_at,
            started_at: Some(now),
            completed_at: None,
            lease_expires_at: None,
            dispatched_at: None,
            error_message: None,
            result: None,
        }
    }
}

/// Lengths of the physical priority lists, summed over the configured queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub high: u64,
    pub normal: u64,
    pub low: u64,
    pub total: u64,
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Broker list holding `queue_name`'s jobs of the given priority.
pub fn list_key(queue_name: &str, priority: Priority) -> String {
    format!("queues:{}:{}", queue_name, priority.as_str())
}

/// Lists to poll for `queue_names`: every high list first, then normal, then low.
fn list_keys<S: AsRef<str>>(queue_names: &[S]) -> Vec<String> {
    Priority::ALL
        .iter()
        .flat_map(|priority| {
            queue_names
                .iter()
                .map(move |name| list_key(name.as_ref(), *priority))
        })
        .collect()
}

pub struct JobQueue {
    broker: Arc<Broker>,
    store: Arc<dyn JobStore>,
    config: QueueConfig,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("broker", &self.broker)
            .field("store", &"<JobStore>")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .finish()
    }
}

impl JobQueue {
    pub fn new(broker: Arc<Broker>, store: Arc<dyn JobStore>, config: QueueConfig) -> Self {
        let retry = RetryPolicy::new(config.max_attempts, config.retry_base_delay);
        Self {
            broker,
            store,
            config,
            retry,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Whether `pop` waits for work, or returns after a single check (fallback mode).
    pub fn blocking_available(&self) -> bool {
        self.broker.blocking_available()
    }

    /// Enqueues a job and returns its id.
    pub async fn push(&self, request: JobRequest) -> Result<String, QueueError> {
        let now = self.clock.now();
        let mut job = Job {
            id: Uuid::new_v4().to_string(),
            durable: request.is_persisted(),
            queue_name: request.queue_name,
            payload: request.payload,
            priority: request.priority,
            scope: request.scope,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: request.max_attempts.unwrap_or(self.retry.max_attempts),
            created_at: now,
            scheduled_at: now + to_chrono(request.delay),
            started_at: None,
            completed_at: None,
            lease_expires_at: None,
            dispatched_at: None,
            error_message: None,
            result: None,
        };

        if !request.delay.is_zero() {
            self.store.insert(&job).await?;
            info!(
                job_id = %job.id,
                queue = %job.queue_name,
                delay = ?request.delay,
                "Scheduled delayed job"
            );
            return Ok(job.id);
        }

        // The row must exist before a consumer can pop the job.
        if job.durable {
            job.dispatched_at = Some(now);
            self.store.insert(&job).await?;
        }
        self.dispatch(&job).await?;

        debug!(
            job_id = %job.id,
            queue = %job.queue_name,
            priority = %job.priority,
            durable = job.durable,
            "Pushed job"
        );
        Ok(job.id)
    }

    async fn dispatch(&self, job: &Job) -> Result<(), QueueError> {
        let envelope = serde_json::to_string(&JobEnvelope::from(job))?;
        self.broker
            .push(&list_key(&job.queue_name, job.priority), &envelope)
            .await?;
        Ok(())
    }

    /// Takes the next job from `queue_names` (the configured queues when empty),
    /// highest priority first, waiting up to `timeout`.
    ///
    /// Returns `None` on timeout. In fallback mode the broker cannot block and
    /// this returns as soon as the lists are found empty.
    pub async fn pop<S: AsRef<str>>(
        &self,
        queue_names: &[S],
        timeout: Duration,
    ) -> Result<Option<Job>, QueueError> {
        let keys = if queue_names.is_empty() {
            list_keys(&self.config.queues)
        } else {
            list_keys(queue_names)
        };
        let deadline = Instant::now() + timeout;
        let mut first = true;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !first && remaining.is_zero() {
                return Ok(None);
            }
            first = false;

            let Some((key, raw)) = self.broker.blocking_pop(&keys, remaining).await? else {
                return Ok(None);
            };
            let envelope: JobEnvelope = match serde_json::from_str(&raw) {
                Ok(envelope) => envelope,
                Err(err) => {
                    error!(key = %key, error = %err, "Dropping undecodable queue entry");
                    continue;
                }
            };
            if let Some(job) = self.claim(envelope).await? {
                return Ok(Some(job));
            }
        }
    }

    /// Pops from the configured queues.
    pub async fn pop_default(&self, timeout: Duration) -> Result<Option<Job>, QueueError> {
        self.pop::<&str>(&[], timeout).await
    }

    async fn claim(&self, envelope: JobEnvelope) -> Result<Option<Job>, QueueError> {
        let now = self.clock.now();
        if !envelope.durable {
            debug!(job_id = %envelope.id, "Popped ephemeral job");
            return Ok(Some(envelope.into_job(now)));
        }

        let lease_until = now + to_chrono(self.config.lease_duration);
        match self.store.begin(&envelope.id, now, lease_until).await? {
            Some(job) => {
                debug!(job_id = %job.id, attempts = job.attempts, "Popped durable job");
                Ok(Some(job))
            }
            None => {
                debug!(job_id = %envelope.id, "Skipping stale delivery");
                Ok(None)
            }
        }
    }

    /// Marks a popped job COMPLETED. Unknown (ephemeral) jobs are ignored, as
    /// are jobs that were never popped or already finished.
    pub async fn complete(&self, job_id: &str, result: Option<&str>) -> Result<(), QueueError> {
        let now = self.clock.now();
        if self.store.complete(job_id, now, result).await? {
            info!(job_id, "Job completed");
            return Ok(());
        }

        match self.store.get(job_id).await? {
            None => debug!(job_id, "No persisted record, nothing to complete"),
            Some(job) if job.status.is_terminal() => warn!(
                job_id,
                status = %job.status,
                "Job already finished, ignoring completion"
            ),
            Some(job) => warn!(
                job_id,
                status = %job.status,
                "Job was never popped, ignoring completion"
            ),
        }
        Ok(())
    }

    /// Records a failed attempt. The job is retried with linear backoff while
    /// `retry` is set and attempts remain, otherwise it becomes FAILED.
    pub async fn fail(
        &self,
        job_id: &str,
        error_message: &str,
        retry: bool,
    ) -> Result<(), QueueError> {
        let Some(job) = self.store.get(job_id).await? else {
            warn!(
                job_id,
                error = error_message,
                "No persisted record, cannot retry ephemeral job"
            );
            return Ok(());
        };

        self.record_failure(job, error_message, retry).await?;
        Ok(())
    }

    async fn record_failure(
        &self,
        job: Job,
        error_message: &str,
        retry: bool,
    ) -> Result<Option<JobStatus>, QueueError> {
        if job.status.is_terminal() {
            warn!(job_id = %job.id, status = %job.status, "Job already finished, ignoring failure");
            return Ok(None);
        }

        let now = self.clock.now();
        let attempts = job.attempts + 1;
        let update = if retry && self.retry.should_retry(attempts, job.max_attempts) {
            FailureUpdate {
                expected_attempts: job.attempts,
                attempts,
                status: JobStatus::Retry,
                retry_at: Some(now + to_chrono(self.retry.backoff(attempts))),
                error_message: error_message.to_string(),
                at: now,
            }
        } else {
            FailureUpdate {
                expected_attempts: job.attempts,
                attempts,
                status: JobStatus::Failed,
                retry_at: None,
                error_message: error_message.to_string(),
                at: now,
            }
        };

        if !self.store.record_failure(&job.id, &update).await? {
            warn!(job_id = %job.id, "Job changed concurrently, failure not recorded");
            return Ok(None);
        }

        match update.retry_at {
            Some(retry_at) => info!(
                job_id = %job.id,
                attempts,
                max_attempts = job.max_attempts,
                %retry_at,
                error = error_message,
                "Job failed, retry scheduled"
            ),
            None => warn!(
                job_id = %job.id,
                attempts,
                error = error_message,
                "Job failed permanently"
            ),
        }
        Ok(Some(update.status))
    }

    /// The persisted record of a job, if it has one.
    pub async fn job(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        Ok(self.store.get(job_id).await?)
    }

    /// Pushes due PENDING/RETRY rows onto their broker lists. Meant to run periodically.
    pub async fn process_scheduled_jobs(&self) -> Result<usize, QueueError> {
        let now = self.clock.now();
        let stale_before = now - to_chrono(self.config.redispatch_after);
        let due = self
            .store
            .claim_due(now, stale_before, self.config.schedule_batch_size)
            .await?;

        let mut promoted = 0;
        for job in &due {
            match self.dispatch(job).await {
                Ok(()) => promoted += 1,
                Err(err) => error!(job_id = %job.id, error = %err, "Failed to promote job"),
            }
        }

        if promoted > 0 {
            info!(promoted, "Promoted scheduled jobs");
        }
        Ok(promoted)
    }

    /// Treats every PROCESSING job whose lease expired as a failed attempt.
    pub async fn reap_expired_leases(&self) -> Result<usize, QueueError> {
        let now = self.clock.now();
        let expired = self
            .store
            .expired_leases(now, self.config.schedule_batch_size)
            .await?;

        let mut reclaimed = 0;
        for job in expired {
            warn!(job_id = %job.id, lease_expires_at = ?job.lease_expires_at, "Lease expired");
            if self.record_failure(job, "lease expired", true).await?.is_some() {
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    /// Deletes COMPLETED/FAILED rows older than `days`. Other rows are never touched.
    pub async fn cleanup_old_jobs(&self, days: u32) -> Result<u64, QueueError> {
        let cutoff = self.clock.now() - chrono::Duration::days(i64::from(days));
        let deleted = self.store.delete_finished_before(cutoff).await?;
        info!(deleted, days, "Cleaned up finished jobs");
        Ok(deleted)
    }

    /// Jobs waiting in the broker for `queue_name`, across all priorities.
    pub async fn get_queue_length(&self, queue_name: &str) -> Result<u64, QueueError> {
        let mut total = 0;
        for priority in Priority::ALL {
            total += self.broker.length(&list_key(queue_name, priority)).await?;
        }
        Ok(total)
    }

    pub async fn get_queue_stats(&self) -> Result<QueueStats, QueueError> {
        let mut stats = QueueStats::default();
        for queue_name in &self.config.queues {
            for priority in Priority::ALL {
                let len = self.broker.length(&list_key(queue_name, priority)).await?;
                match priority {
                    Priority::High => stats.high += len,
                    Priority::Normal => stats.normal += len,
                    Priority::Low => stats.low += len,
                }
            }
        }
        stats.total = stats.high + stats.normal + stats.low;
        Ok(stats)
    }

    /// Persisted jobs owned by `scope`, oldest first.
    pub async fn get_jobs_by_instance(
        &self,
        scope: &str,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, QueueError> {
        Ok(self.store.by_scope(scope, status).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryStore;
    use crate::clock::ManualClock;
    use crate::store::MemoryJobStore;

    struct Fixture {
        queue: JobQueue,
        broker: Arc<Broker>,
        store: Arc<MemoryJobStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let broker = Arc::new(Broker::single(Arc::new(MemoryStore::new()), "test"));
        let store = Arc::new(MemoryJobStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let config = QueueConfig::default().with_queues(["sync"]);
        let queue =
            JobQueue::new(broker.clone(), store.clone(), config).with_clock(clock.clone());
        Fixture {
            queue,
            broker,
            store,
            clock,
        }
    }

    #[test]
    fn list_keys_are_priority_major() {
        assert_eq!(
            list_keys(&["a", "b"]),
            vec![
                "queues:a:high",
                "queues:b:high",
                "queues:a:normal",
                "queues:b:normal",
                "queues:a:low",
                "queues:b:low",
            ]
        );
    }

    #[tokio::test]
    async fn ephemeral_jobs_leave_no_row() {
        let f = fixture();
        let id = f.queue.push(JobRequest::ephemeral("sync", "x")).await.unwrap();

        assert!(f.store.is_empty());
        let job = f.queue.pop(&["sync"], Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Processing);

        // Completing or failing an unknown job is a no-op.
        f.queue.complete(&id, None).await.unwrap();
        f.queue.fail(&id, "boom", true).await.unwrap();
        assert!(f.queue.job(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn durable_pop_stamps_a_lease() {
        let f = fixture();
        let id = f
            .queue
            .push(JobRequest::durable("sync", "x", Some("instance-1".into())))
            .await
            .unwrap();

        let job = f.queue.pop_default(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(
            job.lease_expires_at,
            Some(f.clock.now() + chrono::Duration::seconds(300))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stale_duplicates_are_skipped() {
        let f = fixture();
        let id = f
            .queue
            .push(JobRequest::durable("sync", "x", None))
            .await
            .unwrap();

        // A second copy of the same job, as left behind by a redispatch.
        let job = f.queue.job(&id).await.unwrap().unwrap();
        f.queue.dispatch(&job).await.unwrap();

        let popped = f.queue.pop(&["sync"], Duration::from_secs(1)).await.unwrap();
        assert_eq!(popped.map(|j| j.id), Some(id.clone()));

        let again = f.queue.pop(&["sync"], Duration::from_secs(1)).await.unwrap();
        assert!(again.is_none());
        assert_eq!(f.queue.get_queue_length("sync").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_entries_are_dropped() {
        let f = fixture();
        f.broker
            .push(&list_key("sync", Priority::High), "not json")
            .await
            .unwrap();
        let id = f.queue.push(JobRequest::ephemeral("sync", "ok")).await.unwrap();

        let job = f.queue.pop(&["sync"], Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(job.id, id);
    }

    #[tokio::test]
    async fn dispatched_rows_are_not_promoted_twice() {
        let f = fixture();
        f.queue
            .push(JobRequest::durable("sync", "x", None))
            .await
            .unwrap();

        assert_eq!(f.queue.process_scheduled_jobs().await.unwrap(), 0);
        assert_eq!(f.queue.get_queue_length("sync").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_deliveries_are_redispatched() {
        let f = fixture();
        let id = f
            .queue
            .push(JobRequest::durable("sync", "x", None))
            .await
            .unwrap();
        // The broker loses the job.
        f.broker.delete(&list_key("sync", Priority::Normal)).await.unwrap();

        f.clock.advance(chrono::Duration::minutes(16));
        assert_eq!(f.queue.process_scheduled_jobs().await.unwrap(), 1);

        let job = f.queue.pop(&["sync"], Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(job.id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_leases_count_as_failed_attempts() {
        let f = fixture();
        let id = f
            .queue
            .push(JobRequest::durable("sync", "x", None).max_attempts(2))
            .await
            .unwrap();
        f.queue.pop(&["sync"], Duration::from_secs(1)).await.unwrap().unwrap();

        f.clock.advance(chrono::Duration::minutes(4));
        assert_eq!(f.queue.reap_expired_leases().await.unwrap(), 0);

        f.clock.advance(chrono::Duration::minutes(2));
        assert_eq!(f.queue.reap_expired_leases().await.unwrap(), 1);
        let job = f.queue.job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Retry);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.error_message.as_deref(), Some("lease expired"));

        // Second crash exhausts the attempts.
        f.clock.advance(chrono::Duration::seconds(61));
        assert_eq!(f.queue.process_scheduled_jobs().await.unwrap(), 1);
        f.queue.pop(&["sync"], Duration::from_secs(1)).await.unwrap().unwrap();
        f.clock.advance(chrono::Duration::minutes(6));
        assert_eq!(f.queue.reap_expired_leases().await.unwrap(), 1);
        assert_eq!(
            f.queue.job(&id).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn promoted_jobs_survive_a_lagging_consumer_clock() {
        let f = fixture();
        let id = f
            .queue
            .push(JobRequest::durable("sync", "x", None).delay(Duration::from_secs(60)))
            .await
            .unwrap();

        // Another process whose clock runs ahead promotes the job.
        let ahead = Arc::new(ManualClock::new(f.clock.now() + chrono::Duration::seconds(90)));
        let promoter = JobQueue::new(
            f.broker.clone(),
            f.store.clone(),
            QueueConfig::default().with_queues(["sync"]),
        )
        .with_clock(ahead);
        assert_eq!(promoter.process_scheduled_jobs().await.unwrap(), 1);

        let job = f.queue.pop(&["sync"], Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn completing_a_job_that_was_never_popped_is_ignored() {
        let f = fixture();
        let id = f
            .queue
            .push(JobRequest::durable("sync", "x", None))
            .await
            .unwrap();

        f.queue.complete(&id, None).await.unwrap();
        assert_eq!(f.queue.job(&id).await.unwrap().unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn retry_false_fails_immediately() {
        let f = fixture();
        let id = f
            .queue
            .push(JobRequest::durable("sync", "x", None))
            .await
            .unwrap();

        f.queue.fail(&id, "bad payload", false).await.unwrap();

        let job = f.queue.job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert!(job.completed_at.is_some());

        // Terminal jobs stay terminal.
        f.queue.fail(&id, "again", true).await.unwrap();
        f.queue.complete(&id, None).await.unwrap();
        let job = f.queue.job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
    }
}
