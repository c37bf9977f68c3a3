//! In-memory job store for tests and development.

use super::{FailureUpdate, JobStore};
use crate::error::StoreError;
use crate::{Job, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, Job>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs().is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs();
        if jobs.contains_key(&job.id) {
            return Err(StoreError::InvalidData(format!("job {} already exists", job.id)));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs().get(id).cloned())
    }

    async fn begin(
        &self,
        id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.jobs();
        let Some(job) = jobs.get_mut(id) else {
            return Ok(None);
        };
        let claimable = matches!(job.status, JobStatus::Pending | JobStatus::Retry)
            && (job.dispatched_at.is_some() || job.scheduled_at <= now);
        if !claimable {
            return Ok(None);
        }
        job.status = JobStatus::Processing;
        job.started_at = Some(now);
        job.lease_expires_at = Some(lease_until);
        job.dispatched_at = None;
        Ok(Some(job.clone()))
    }

    async fn complete(
        &self,
        id: &str,
        now: DateTime<Utc>,
        result: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs();
        match jobs.get_mut(id) {
            Some(job) if matches!(job.status, JobStatus::Processing | JobStatus::Retry) => {
                job.status = JobStatus::Completed;
                job.completed_at = Some(now);
                job.lease_expires_at = None;
                job.result = result.map(str::to_string);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_failure(&self, id: &str, update: &FailureUpdate) -> Result<bool, StoreError> {
        let mut jobs = self.jobs();
        let Some(job) = jobs.get_mut(id) else {
            return Ok(false);
        };
        if job.status.is_terminal() || job.attempts != update.expected_attempts {
            return Ok(false);
        }
        job.attempts = update.attempts;
        job.status = update.status;
        job.error_message = Some(update.error_message.clone());
        job.lease_expires_at = None;
        job.dispatched_at = None;
        match update.status {
            JobStatus::Retry => {
                if let Some(retry_at) = update.retry_at {
                    job.scheduled_at = retry_at;
                }
            }
            _ => job.completed_at = Some(update.at),
        }
        Ok(true)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError> {
        let mut jobs = self.jobs();
        let mut due: Vec<&mut Job> = jobs
            .values_mut()
            .filter(|job| {
                matches!(job.status, JobStatus::Pending | JobStatus::Retry)
                    && job.scheduled_at <= now
                    && job.dispatched_at.map_or(true, |at| at < stale_before)
            })
            .collect();
        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.scheduled_at.cmp(&b.scheduled_at))
        });

        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|job| {
                job.dispatched_at = Some(now);
                job.clone()
            })
            .collect())
    }

    async fn expired_leases(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs();
        let mut expired: Vec<Job> = jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Processing
                    && job.lease_expires_at.is_some_and(|at| at < now)
            })
            .cloned()
            .collect();
        expired.sort_by_key(|job| job.lease_expires_at);
        expired.truncate(limit.max(0) as usize);
        Ok(expired)
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut jobs = self.jobs();
        let before = jobs.len();
        jobs.retain(|_, job| {
            !(job.status.is_terminal() && job.completed_at.unwrap_or(job.created_at) < cutoff)
        });
        Ok((before - jobs.len()) as u64)
    }

    async fn by_scope(
        &self,
        scope: &str,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs();
        let mut found: Vec<Job> = jobs
            .values()
            .filter(|job| job.scope.as_deref() == Some(scope))
            .filter(|job| status.map_or(true, |s| job.status == s))
            .cloned()
            .collect();
        found.sort_by_key(|job| job.created_at);
        Ok(found)
    }
}
