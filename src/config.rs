use std::time::Duration;

/// Tunables shared by the broker facade and the job queue manager.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Namespace prepended to every broker key.
    pub key_prefix: String,
    /// Queue names a consumer polls when it does not name any.
    pub queues: Vec<String>,
    pub max_attempts: i32,
    /// Linear backoff unit: a job retried after its n-th failure waits `n * retry_base_delay`.
    pub retry_base_delay: Duration,
    /// How long a popped durable job may stay PROCESSING before it is reclaimed.
    pub lease_duration: Duration,
    /// Upper bound of rows promoted per `process_scheduled_jobs` call.
    pub schedule_batch_size: i64,
    /// A dispatched row that was never popped is pushed again after this long.
    pub redispatch_after: Duration,
    /// Minimum delay between liveness pings of a fast backend marked down.
    pub reconnect_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            key_prefix: "jobq".to_string(),
            queues: vec!["default".to_string()],
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(60),
            lease_duration: Duration::from_secs(300),
            schedule_batch_size: 100,
            redispatch_after: Duration::from_secs(900),
            reconnect_interval: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }
}
