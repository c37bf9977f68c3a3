use crate::queue::JobQueue;
use crate::registry::HandlerRegistry;
use crate::worker::{self, WorkerOptions};
use anyhow::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::*;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub workers: u16,
    pub worker: WorkerOptions,
    /// How often due jobs are promoted and expired leases reclaimed.
    pub schedule_interval: Duration,
    pub cleanup_interval: Duration,
    /// Finished jobs older than this many days are deleted.
    pub retention_days: u32,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            workers: 3,
            worker: WorkerOptions::default(),
            schedule_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(3600),
            retention_days: 7,
        }
    }
}

/// Runs the worker pool and the periodic maintenance until `cancel_token` fires.
pub async fn serve(
    cancel_token: CancellationToken,
    queue: Arc<JobQueue>,
    registry: Arc<HandlerRegistry>,
    options: ServerOptions,
) -> Result<(), Error> {
    info!(
        workers = options.workers,
        queues = ?registry.queue_names(),
        broker = ?queue.broker(),
        "Starting server"
    );

    let mut workers = vec![];
    for n in 0..options.workers {
        let cancel_token = cancel_token.clone();
        let queue = queue.clone();
        let registry = registry.clone();
        let worker_options = options.worker.clone();
        let join_handle = tokio::spawn(
            async move {
                worker::start(cancel_token, queue, registry, worker_options).await;
            }
            .instrument(info_span!("worker", worker = n)),
        );
        workers.push(join_handle);
    }

    let mut schedule_tick = interval(options.schedule_interval);
    schedule_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cleanup_tick = interval(options.cleanup_interval);
    cleanup_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Server Cancelled");
                break;
            },
            _ = schedule_tick.tick() => {
                run_scheduler(&queue).await;
            },
            _ = cleanup_tick.tick() => {
                match queue.cleanup_old_jobs(options.retention_days).await {
                    Ok(_) => {},
                    Err(err) => error!(message = "Failed to clean up old jobs", error = %err),
                }
            }
        }
    }

    // Wait for all workers to complete
    futures::future::join_all(workers)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    info!("Server stopped.");

    Ok(())
}

async fn run_scheduler(queue: &JobQueue) {
    if let Err(err) = queue.process_scheduled_jobs().await {
        error!(message = "Failed to promote scheduled jobs", error = %err);
    }
    if let Err(err) = queue.reap_expired_leases().await {
        error!(message = "Failed to reclaim expired leases", error = %err);
    }
    match queue.broker().purge_expired().await {
        Ok(0) => {}
        Ok(purged) => debug!(purged, "Purged expired broker entries"),
        Err(err) => error!(message = "Failed to purge expired broker entries", error = %err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryStore};
    use crate::clock::ManualClock;
    use crate::registry::JobHandler;
    use crate::store::MemoryJobStore;
    use crate::{Job, JobRequest, JobStatus, QueueConfig};
    use async_trait::async_trait;
    use chrono::Utc;

    struct Upper;

    #[async_trait]
    impl JobHandler for Upper {
        async fn handle(&self, job: &Job) -> anyhow::Result<Option<String>> {
            Ok(Some(job.payload.to_uppercase()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_delayed_jobs_once_due() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let broker = Arc::new(Broker::single(Arc::new(MemoryStore::new()), "test"));
        let queue = Arc::new(
            JobQueue::new(
                broker,
                Arc::new(MemoryJobStore::new()),
                QueueConfig::default().with_queues(["emails"]),
            )
            .with_clock(clock.clone()),
        );
        let registry = Arc::new(HandlerRegistry::new().register("emails", Upper));
        let cancel_token = CancellationToken::new();

        let id = queue
            .push(JobRequest::durable("emails", "hello", None).delay(Duration::from_secs(60)))
            .await
            .unwrap();

        let server = tokio::spawn(serve(
            cancel_token.clone(),
            queue.clone(),
            registry,
            ServerOptions {
                workers: 2,
                ..Default::default()
            },
        ));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(
            queue.job(&id).await.unwrap().unwrap().status,
            JobStatus::Pending
        );

        clock.advance(chrono::Duration::seconds(61));
        let mut job = queue.job(&id).await.unwrap().unwrap();
        while job.status != JobStatus::Completed {
            tokio::time::sleep(Duration::from_secs(1)).await;
            job = queue.job(&id).await.unwrap().unwrap();
        }
        assert_eq!(job.result.as_deref(), Some("HELLO"));

        cancel_token.cancel();
        server.await.unwrap().unwrap();
    }
}
