//! Retry/backoff engine.
//!
//! Drives repeated send attempts for one job against a bounded attempt budget,
//! writing the ledger after every attempt and dead-lettering the job once the
//! budget is spent. Backoff sleeps run on the job's own task.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use herald_common::config::DeliveryConfig;
use herald_common::error::AppError;
use herald_common::types::NotificationJob;

use crate::dead_letter::DeadLetterSink;
use crate::dispatch::AttemptSend;
use crate::ledger::{DeliveryLedger, DeliveryUpdate};
use crate::timing::sleep_or_cancel;

/// Final result of handling one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The ledger already holds a final state for the job.
    Skipped,
    /// The deadline passed before an attempt could be made.
    Expired,
    Sent { attempts: u32 },
    /// Attempt budget exhausted; the job was dead-lettered.
    Failed { attempts: u32 },
    /// Shutdown arrived while the job was waiting; it stays RETRYING.
    Interrupted { attempts: u32 },
}

/// Delay before the attempt that follows attempt number `attempt`.
///
/// `schedule[min(attempt - 1, len - 1)]`: the last entry repeats once the
/// schedule runs out. An empty schedule means no delay.
pub fn backoff_delay(attempt: u32, schedule: &[Duration]) -> Duration {
    let Some(last) = schedule.len().checked_sub(1) else {
        return Duration::ZERO;
    };
    let idx = (attempt.saturating_sub(1) as usize).min(last);
    schedule[idx]
}

pub struct RetryEngine {
    max_attempts: u32,
    backoff_schedule: Vec<Duration>,
    ledger: Arc<dyn DeliveryLedger>,
    dead_letters: DeadLetterSink,
    shutdown: CancellationToken,
}

impl RetryEngine {
    pub fn new(
        config: &DeliveryConfig,
        ledger: Arc<dyn DeliveryLedger>,
        dead_letters: DeadLetterSink,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_schedule: config.backoff_schedule.clone(),
            ledger,
            dead_letters,
            shutdown,
        }
    }

    /// Attempt delivery until success or until `max_attempts` is reached.
    ///
    /// Numbering continues from `starting_attempts`, so attempts made before a
    /// restart count against the same budget.
    pub async fn run(
        &self,
        job: &NotificationJob,
        starting_attempts: u32,
        sender: &dyn AttemptSend,
    ) -> Result<JobOutcome, AppError> {
        if starting_attempts >= self.max_attempts {
            tracing::warn!(
                job_id = %job.job_id,
                attempts = starting_attempts,
                max_attempts = self.max_attempts,
                "Attempt budget already spent, not retrying"
            );
            return Ok(JobOutcome::Failed {
                attempts: starting_attempts,
            });
        }

        let mut attempt = starting_attempts;
        loop {
            attempt += 1;

            match sender.attempt(job).await {
                Ok(()) => {
                    let update = DeliveryUpdate::sent(job, attempt, Utc::now());
                    if let Err(e) = self.ledger.upsert(&update).await {
                        tracing::error!(
                            job_id = %job.job_id,
                            attempt,
                            error = %e,
                            "Notification sent but ledger write failed, job may be re-sent on redelivery"
                        );
                        return Err(e);
                    }

                    tracing::info!(job_id = %job.job_id, attempt, "Job SENT");
                    return Ok(JobOutcome::Sent { attempts: attempt });
                }
                Err(send_error) => {
                    let error = send_error.to_string();
                    let last_attempt = attempt >= self.max_attempts;
                    let update = DeliveryUpdate::failure(job, attempt, error.clone(), last_attempt);

                    if let Err(e) = self.ledger.upsert(&update).await {
                        tracing::error!(
                            job_id = %job.job_id,
                            attempt,
                            status = %update.status,
                            error = %e,
                            "Failed to record delivery failure in ledger"
                        );
                        return Err(e);
                    }

                    tracing::warn!(
                        job_id = %job.job_id,
                        attempt,
                        max_attempts = self.max_attempts,
                        status = %update.status,
                        error = %error,
                        "Delivery attempt failed"
                    );

                    if last_attempt {
                        self.dead_letters.publish_job(job, &error).await;
                        return Ok(JobOutcome::Failed { attempts: attempt });
                    }

                    let delay = backoff_delay(attempt, &self.backoff_schedule);
                    tracing::info!(
                        job_id = %job.job_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying job after backoff"
                    );

                    if !sleep_or_cancel(delay, &self.shutdown).await {
                        tracing::info!(
                            job_id = %job.job_id,
                            attempt,
                            "Shutdown during backoff, job left RETRYING"
                        );
                        return Ok(JobOutcome::Interrupted { attempts: attempt });
                    }
                }
            }
        }
    }
}
