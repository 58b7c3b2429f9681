//! Background worker pool for file-processing jobs.
//!
//! Polls the queue, runs claimed jobs through the [`Pipeline`] with a
//! bounded number in flight, and settles each outcome: success, reschedule
//! with backoff, or terminal failure (which also flips the file to
//! `failed` with the last error recorded). Shutdown is cooperative via a
//! cancellation token; in-flight jobs drain before the loop exits.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::Error;
use crate::pipeline::Pipeline;
use crate::queue::{ClaimedJob, FailureOutcome, JobQueue};
use crate::store::Store;
use crate::models::FileStatus;

pub struct Worker {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn Store>,
    pipeline: Arc<Pipeline>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn Store>,
        pipeline: Arc<Pipeline>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            store,
            pipeline,
            config,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!(concurrency = self.config.concurrency, "worker starting");

        let mut tasks: JoinSet<()> = JoinSet::new();
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let orphan_age = Duration::from_secs(self.config.orphan_after_secs);

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            // Reap finished tasks; the set length is the in-flight count.
            while tasks.try_join_next().is_some() {}

            // Recover files whose enqueue was lost to a crash.
            match self.queue.requeue_orphans(orphan_age).await {
                Ok(0) => {}
                Ok(n) => info!(count = n, "requeued orphaned pending files"),
                Err(e) => warn!(error = %e, "orphan sweep failed"),
            }

            let free_slots = self.config.concurrency.saturating_sub(tasks.len());
            if free_slots == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => continue,
                }
            }

            let jobs = match self.queue.claim(free_slots).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(error = %e, "failed to claim jobs");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(poll_interval) => continue,
                    }
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => continue,
                }
            }

            debug!(count = jobs.len(), "claimed jobs");

            for job in jobs {
                let queue = self.queue.clone();
                let store = self.store.clone();
                let pipeline = self.pipeline.clone();

                tasks.spawn(async move {
                    run_job(queue, store, pipeline, job).await;
                });
            }
        }

        // Drain in-flight jobs before exiting.
        let in_flight = tasks.len();
        if in_flight > 0 {
            info!(count = in_flight, "waiting for running jobs to finish");
            while tasks.join_next().await.is_some() {}
        }

        info!("worker stopped");
    }
}

/// Run one claimed job and settle its outcome: mark it succeeded, let the
/// queue reschedule a retryable failure, or record terminal failure on
/// both the job and the file.
pub async fn run_job(
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn Store>,
    pipeline: Arc<Pipeline>,
    job: ClaimedJob,
) {
    let job_id = job.id;
    let file_id = job.file_id;

    match pipeline.process(&job).await {
        Ok(()) => {
            if let Err(e) = queue.mark_succeeded(job_id).await {
                error!(job_id = %job_id, error = %e, "failed to mark job succeeded");
            }
        }
        Err(e) => {
            let retryable = e.is_retryable();
            warn!(job_id = %job_id, file_id = %file_id, error = %e, retryable, "job attempt failed");

            let outcome = match queue.mark_failed(job_id, &e.to_string(), retryable).await {
                Ok(outcome) => outcome,
                Err(qe) => {
                    error!(job_id = %job_id, error = %qe, "failed to record job failure");
                    return;
                }
            };

            if outcome == FailureOutcome::Terminal {
                // A vanished file record is fine here: the job raced with a
                // delete, so there is nothing to flip to failed.
                match store
                    .set_file_status(file_id, FileStatus::Failed, Some(&e.to_string()))
                    .await
                {
                    Ok(()) => {}
                    Err(Error::NotFound(_)) => {
                        debug!(file_id = %file_id, "file deleted while job was running");
                    }
                    Err(se) => {
                        error!(file_id = %file_id, error = %se, "failed to record file failure");
                    }
                }
            }
        }
    }
}
