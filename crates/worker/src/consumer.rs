//! Queue consumer: reserves payloads and runs each job on its own task.
//!
//! Concurrency is bounded by a semaphore. A job waiting for `send_after` or
//! sleeping between attempts holds its permit but never blocks other jobs.
//!
//! On shutdown the consumer stops reserving, lets jobs in flight wind down
//! for the grace period, then aborts whatever is left. Jobs that did not
//! finish are not acknowledged and are re-queued on the next start.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use herald_common::types::NotificationJob;
use herald_engine::dead_letter::DeadLetterSink;
use herald_engine::processor::{JobOutcome, JobProcessor};
use herald_engine::timing::sleep_or_cancel;

use crate::queue::JobQueue;

/// Decodes, processes and acknowledges a single reserved payload.
///
/// Storage failures are transient: the payload goes back on the queue after
/// `storage_retry_delay` with its attempt budget untouched. Only malformed
/// payloads and other processing errors are dead-lettered.
#[derive(Clone)]
pub struct PayloadHandler {
    queue: Arc<dyn JobQueue>,
    processor: Arc<JobProcessor>,
    dead_letters: DeadLetterSink,
    storage_retry_delay: Duration,
    shutdown: CancellationToken,
}

impl PayloadHandler {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        processor: Arc<JobProcessor>,
        dead_letters: DeadLetterSink,
        storage_retry_delay: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            processor,
            dead_letters,
            storage_retry_delay,
            shutdown,
        }
    }

    pub async fn handle(&self, payload: Vec<u8>) {
        let job = match decode_job(&payload) {
            Ok(job) => job,
            Err(reason) => {
                tracing::warn!(error = %reason, "Rejecting undecodable job payload");
                self.dead_letters.publish_raw(&payload, &reason).await;
                self.ack(&payload).await;
                return;
            }
        };

        match self.processor.handle(&job).await {
            Ok(JobOutcome::Interrupted { attempts }) => {
                tracing::info!(
                    job_id = %job.job_id,
                    attempts,
                    "Job interrupted by shutdown, left for redelivery"
                );
            }
            Ok(outcome) => {
                tracing::debug!(job_id = %job.job_id, outcome = ?outcome, "Job finished");
                self.ack(&payload).await;
            }
            Err(e) if e.is_storage() => {
                tracing::error!(
                    job_id = %job.job_id,
                    error = %e,
                    retry_in_ms = self.storage_retry_delay.as_millis() as u64,
                    "Storage failure while processing job, re-queueing"
                );
                self.requeue(&job, &payload).await;
            }
            Err(e) => {
                tracing::error!(job_id = %job.job_id, error = %e, "Job processing failed");
                self.dead_letters.publish_job(&job, &e.to_string()).await;
                self.ack(&payload).await;
            }
        }
    }

    /// Back off, then return the payload to the queue. On shutdown it stays
    /// reserved and is recovered on the next start.
    async fn requeue(&self, job: &NotificationJob, payload: &[u8]) {
        if !sleep_or_cancel(self.storage_retry_delay, &self.shutdown).await {
            tracing::info!(job_id = %job.job_id, "Shutdown before re-queue, left for redelivery");
            return;
        }
        if let Err(e) = self.queue.requeue(payload).await {
            tracing::error!(
                job_id = %job.job_id,
                error = %e,
                "Failed to re-queue job, left for redelivery on restart"
            );
        }
    }

    async fn ack(&self, payload: &[u8]) {
        if let Err(e) = self.queue.ack(payload).await {
            tracing::error!(error = %e, "Failed to acknowledge job payload");
        }
    }
}

/// Parse and validate an inbound payload. The error text goes on the dead letter.
fn decode_job(payload: &[u8]) -> Result<NotificationJob, String> {
    let job: NotificationJob = serde_json::from_slice(payload)
        .map_err(|e| format!("Failed to decode notification job: {}", e))?;
    job.validate().map_err(|e| e.to_string())?;
    Ok(job)
}

pub struct JobConsumer {
    queue: Arc<dyn JobQueue>,
    handler: PayloadHandler,
    concurrency: usize,
    poll_interval: Duration,
    shutdown_grace: Duration,
}

impl JobConsumer {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        handler: PayloadHandler,
        concurrency: usize,
        poll_interval: Duration,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            queue,
            handler,
            concurrency,
            poll_interval,
            shutdown_grace,
        }
    }

    /// Consume until `shutdown` fires, then drain in-flight jobs.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        tracing::info!(
            concurrency = self.concurrency,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Job consumer started"
        );

        loop {
            while let Some(result) = tasks.try_join_next() {
                log_task_result(result);
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => permit?,
            };

            match self.queue.reserve().await {
                Ok(Some(payload)) => {
                    let handler = self.handler.clone();
                    tasks.spawn(async move {
                        handler.handle(payload).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    if !sleep_or_cancel(self.poll_interval, &shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(error = %e, "Failed to reserve job from queue");
                    if !sleep_or_cancel(self.poll_interval, &shutdown).await {
                        break;
                    }
                }
            }
        }

        self.drain(tasks).await;
        Ok(())
    }

    async fn drain(&self, mut tasks: JoinSet<()>) {
        if tasks.is_empty() {
            tracing::info!("Job consumer stopped");
            return;
        }

        tracing::info!(
            in_flight = tasks.len(),
            grace_secs = self.shutdown_grace.as_secs(),
            "Waiting for in-flight jobs"
        );

        let deadline = tokio::time::sleep(self.shutdown_grace);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                result = tasks.join_next() => match result {
                    Some(result) => log_task_result(result),
                    None => break,
                },
                _ = &mut deadline => {
                    tracing::warn!(
                        remaining = tasks.len(),
                        "Shutdown grace period elapsed, aborting remaining jobs"
                    );
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }

        tracing::info!("Job consumer stopped");
    }
}

fn log_task_result(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            tracing::error!(error = %e, "Job task panicked");
        }
    }
}
