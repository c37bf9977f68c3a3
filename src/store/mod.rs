//! Persisted job table.
//!
//! Every status change is a single conditional update keyed on the status (and,
//! for failures, the attempt count) the caller observed. When two workers race
//! on the same job exactly one update matches; the loser gets `false`/`None`.

use crate::error::StoreError;
use crate::{Job, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod memory;

pub use self::memory::MemoryJobStore;

/// Outcome of a failed attempt, applied by [`JobStore::record_failure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureUpdate {
    /// Attempts the caller read before computing this update.
    pub expected_attempts: i32,
    pub attempts: i32,
    /// `Retry` or `Failed`.
    pub status: JobStatus,
    /// Next run time for a retry.
    pub retry_at: Option<DateTime<Utc>>,
    pub error_message: String,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &Job) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError>;

    /// PENDING/RETRY → PROCESSING, stamping the lease.
    ///
    /// A row that was dispatched is claimable as is: the dispatcher already
    /// judged it due, and the consumer's clock may lag the dispatcher's.
    /// Undispatched rows must be due at `now`.
    async fn begin(
        &self,
        id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError>;

    /// PROCESSING → COMPLETED. RETRY is accepted too: a worker whose lease was
    /// reclaimed may still finish the job before it runs again.
    async fn complete(
        &self,
        id: &str,
        now: DateTime<Utc>,
        result: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// Any non-terminal status with `attempts == expected_attempts` → RETRY or FAILED.
    async fn record_failure(&self, id: &str, update: &FailureUpdate) -> Result<bool, StoreError>;

    /// Marks up to `limit` due PENDING/RETRY rows as dispatched and returns them.
    ///
    /// Rows already dispatched are only picked up again once their dispatch is
    /// older than `stale_before`. Highest priority first, then oldest schedule.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError>;

    /// PROCESSING rows whose lease ran out before `now`.
    async fn expired_leases(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>, StoreError>;

    /// Deletes COMPLETED/FAILED rows that finished before `cutoff`.
    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn by_scope(
        &self,
        scope: &str,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, StoreError>;
}
