use crate::queue::JobQueue;
use crate::registry::HandlerRegistry;
use crate::Job;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::*;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Longest a single `pop` may wait for work.
    pub pop_timeout: Duration,
    /// Pause between empty polls when the broker cannot block.
    pub poll_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            pop_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Competing-consumer loop: pop, run the queue's handler, record the outcome.
pub async fn start(
    cancel_token: CancellationToken,
    queue: Arc<JobQueue>,
    registry: Arc<HandlerRegistry>,
    options: WorkerOptions,
) {
    let queue_names = registry.queue_names();
    if queue_names.is_empty() {
        warn!("No handlers registered, worker has nothing to do");
        return;
    }

    loop {
        let idle = tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Worker Cancelled");
                break;
            },
            popped = queue.pop(&queue_names, options.pop_timeout) => {
                match popped {
                    Err(err) => {
                        error!(message = "Error receiving job by worker", error = %err);
                        true
                    },
                    Ok(None) => !queue.blocking_available(),
                    Ok(Some(job)) => {
                        process(&queue, &registry, job).await;
                        false
                    }
                }
            }
        };

        if idle {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Worker Cancelled");
                    break;
                },
                _ = sleep(options.poll_interval) => {},
            }
        }
    }
    info!("Worker stopped.");
}

#[instrument(skip_all, fields(job_id = %job.id, queue = %job.queue_name))]
async fn process(queue: &JobQueue, registry: &HandlerRegistry, job: Job) {
    let handler = match registry.handler(&job.queue_name) {
        Ok(handler) => handler,
        Err(err) => {
            // Retrying cannot make a handler appear.
            record(queue.fail(&job.id, &err.to_string(), false).await);
            return;
        }
    };

    match handler.handle(&job).await {
        Ok(result) => {
            debug!("Job succeeded");
            record(queue.complete(&job.id, result.as_deref()).await);
        }
        Err(err) => {
            debug!(error = %err, "Job failed");
            record(queue.fail(&job.id, &format!("{err:#}"), true).await);
        }
    }
}

fn record(outcome: Result<(), crate::QueueError>) {
    if let Err(err) = outcome {
        error!(error = %err, "Failed to record job outcome");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryStore};
    use crate::registry::JobHandler;
    use crate::store::MemoryJobStore;
    use crate::{JobRequest, JobStatus, QueueConfig};
    use anyhow::anyhow;
    use async_trait::async_trait;

    struct Succeed;

    #[async_trait]
    impl JobHandler for Succeed {
        async fn handle(&self, job: &Job) -> anyhow::Result<Option<String>> {
            Ok(Some(format!("handled {}", job.payload)))
        }
    }

    struct Explode;

    #[async_trait]
    impl JobHandler for Explode {
        async fn handle(&self, _job: &Job) -> anyhow::Result<Option<String>> {
            Err(anyhow!("upstream returned 503"))
        }
    }

    fn queue() -> Arc<JobQueue> {
        let broker = Arc::new(Broker::single(Arc::new(MemoryStore::new()), "test"));
        Arc::new(JobQueue::new(
            broker,
            Arc::new(MemoryJobStore::new()),
            QueueConfig::default(),
        ))
    }

    #[tokio::test]
    async fn records_success_and_failure() {
        let queue = queue();
        let registry = HandlerRegistry::new()
            .register("ok", Succeed)
            .register("broken", Explode);

        let ok = queue.push(JobRequest::durable("ok", "a", None)).await.unwrap();
        let broken = queue.push(JobRequest::durable("broken", "b", None)).await.unwrap();

        for _ in 0..2 {
            let job = queue
                .pop(&registry.queue_names(), Duration::from_secs(1))
                .await
                .unwrap()
                .unwrap();
            process(&queue, &registry, job).await;
        }

        let ok = queue.job(&ok).await.unwrap().unwrap();
        assert_eq!(ok.status, JobStatus::Completed);
        assert_eq!(ok.result.as_deref(), Some("handled a"));

        let broken = queue.job(&broken).await.unwrap().unwrap();
        assert_eq!(broken.status, JobStatus::Retry);
        assert_eq!(broken.error_message.as_deref(), Some("upstream returned 503"));
    }

    #[tokio::test]
    async fn unknown_queue_fails_without_retry() {
        let queue = queue();
        let registry = HandlerRegistry::new().register("ok", Succeed);
        let id = queue
            .push(JobRequest::durable("orphan", "x", None))
            .await
            .unwrap();

        let job = queue
            .pop(&["orphan"], Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        process(&queue, &registry, job).await;

        let job = queue.job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.error_message.as_deref(),
            Some("no handler registered for queue 'orphan'")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_cancel() {
        let queue = queue();
        let registry = Arc::new(HandlerRegistry::new().register("ok", Succeed));
        let cancel_token = CancellationToken::new();

        let worker = tokio::spawn(start(
            cancel_token.clone(),
            queue.clone(),
            registry,
            WorkerOptions::default(),
        ));
        let id = queue.push(JobRequest::durable("ok", "a", None)).await.unwrap();

        while queue.job(&id).await.unwrap().unwrap().status != JobStatus::Completed {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel_token.cancel();
        worker.await.unwrap();
    }
}
