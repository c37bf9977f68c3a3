use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};

pub mod broker;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use broker::Broker;
pub use config::QueueConfig;
pub use error::{BrokerError, QueueError, StoreError};
pub use queue::{JobQueue, QueueStats};

/// A request to enqueue work, built by producers and handed to [`JobQueue::push`].
///
/// Durability is chosen explicitly: a durable job is tracked in the persisted job
/// table for its whole lifecycle, an ephemeral one only lives in the broker.
/// Delayed requests are always persisted since the row carries the schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub queue_name: String,
    pub payload: String,
    pub priority: Priority,
    pub scope: Option<String>,
    pub durable: bool,
    pub delay: Duration,
    pub max_attempts: Option<i32>,
}

impl JobRequest {
    pub fn ephemeral(queue_name: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            payload: payload.into(),
            priority: Priority::Normal,
            scope: None,
            durable: false,
            delay: Duration::ZERO,
            max_attempts: None,
        }
    }

    /// `scope` names the owning entity (e.g. a messaging instance) used by audit queries.
    pub fn durable(
        queue_name: impl Into<String>,
        payload: impl Into<String>,
        scope: Option<String>,
    ) -> Self {
        Self {
            scope,
            durable: true,
            ..Self::ephemeral(queue_name, payload)
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn is_delayed(&self) -> bool {
        !self.delay.is_zero()
    }

    /// Whether `push` writes a row to the persisted job table.
    pub fn is_persisted(&self) -> bool {
        self.durable || self.is_delayed()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue_name: String,
    pub payload: String,
    pub priority: Priority,
    pub scope: Option<String>,
    pub durable: bool,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub result: Option<String>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[repr(i16)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
}

impl Priority {
    /// Consumption order: a consumer drains `High` before `Normal` before `Low`.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" | "default" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "queue_job_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Retry,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Retry => "RETRY",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(JobStatus::Pending),
            "PROCESSING" => Ok(JobStatus::Processing),
            "RETRY" => Ok(JobStatus::Retry),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_are_consumed_high_first() {
        assert_eq!(
            Priority::ALL,
            [Priority::High, Priority::Normal, Priority::Low]
        );
        assert!(Priority::High > Priority::Normal && Priority::Normal > Priority::Low);
    }

    #[test]
    fn parses_priorities_and_statuses() {
        assert_eq!("HIGH".parse::<Priority>(), Ok(Priority::High));
        assert_eq!("default".parse::<Priority>(), Ok(Priority::Normal));
        assert!("urgent".parse::<Priority>().is_err());
        assert_eq!("retry".parse::<JobStatus>(), Ok(JobStatus::Retry));
        assert_eq!(JobStatus::Failed.to_string(), "FAILED");
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(!JobStatus::Retry.is_terminal());
    }

    #[test]
    fn delayed_requests_are_always_persisted() {
        let ephemeral = JobRequest::ephemeral("emails", "hello");
        assert!(!ephemeral.is_persisted());

        let delayed = ephemeral.clone().delay(Duration::from_secs(60));
        assert!(delayed.is_persisted());

        let durable = JobRequest::durable("webhooks", "{}", Some("instance-1".into()))
            .priority(Priority::High);
        assert!(durable.is_persisted());
        assert_eq!(durable.priority, Priority::High);
        assert_eq!(durable.scope.as_deref(), Some("instance-1"));
    }
}
