//! Job processor: the delivery pipeline's entry point.
//!
//! For each incoming job:
//! 1. Load the delivery record (if any) from the ledger
//! 2. Skip jobs the ledger already holds in a final state
//! 3. Mark expired jobs EXPIRED without attempting a send
//! 4. Wait for `send_after` on this job's task, capped at `max_send_delay`
//! 5. Hand the job to the retry engine, continuing the existing attempt count

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use herald_common::config::DeliveryConfig;
use herald_common::error::AppError;
use herald_common::types::{DeliveryRecord, NotificationJob};

use crate::dead_letter::DeadLetterSink;
use crate::dispatch::AttemptSend;
use crate::ledger::{DeliveryLedger, DeliveryUpdate, should_skip};
use crate::retry::RetryEngine;
use crate::timing::{is_expired, send_delay, sleep_or_cancel};

pub use crate::retry::JobOutcome;

/// Orchestrates ledger, timing gate and retry engine for one job at a time.
///
/// Holds only read-only configuration and shared handles, so one processor
/// can serve any number of concurrent jobs.
pub struct JobProcessor {
    config: DeliveryConfig,
    ledger: Arc<dyn DeliveryLedger>,
    sender: Arc<dyn AttemptSend>,
    retry: RetryEngine,
    shutdown: CancellationToken,
}

impl JobProcessor {
    pub fn new(
        config: DeliveryConfig,
        ledger: Arc<dyn DeliveryLedger>,
        sender: Arc<dyn AttemptSend>,
        dead_letters: DeadLetterSink,
        shutdown: CancellationToken,
    ) -> Self {
        let retry = RetryEngine::new(&config, ledger.clone(), dead_letters, shutdown.clone());
        Self {
            config,
            ledger,
            sender,
            retry,
            shutdown,
        }
    }

    /// Process one job through the full pipeline.
    ///
    /// Only ledger failures are returned as errors; send failures are handled
    /// by the retry engine and surface as [`JobOutcome::Failed`].
    pub async fn handle(&self, job: &NotificationJob) -> Result<JobOutcome, AppError> {
        let existing = self.ledger.get(job.job_id).await?;

        if let Some(record) = &existing {
            if should_skip(record, self.config.max_attempts) {
                tracing::info!(
                    job_id = %job.job_id,
                    status = %record.status,
                    attempts = record.attempts,
                    "Job already final, skipping"
                );
                return Ok(JobOutcome::Skipped);
            }
        }

        let existing_attempts = existing.as_ref().map(DeliveryRecord::attempt_count).unwrap_or(0);

        if self.expire_if_needed(job, existing_attempts).await? {
            return Ok(JobOutcome::Expired);
        }

        let delay = send_delay(job, Utc::now(), self.config.max_send_delay);
        if !delay.is_zero() {
            tracing::info!(
                job_id = %job.job_id,
                delay_ms = delay.as_millis() as u64,
                send_after = ?job.send_after,
                "Delaying job until send_after"
            );
            if !sleep_or_cancel(delay, &self.shutdown).await {
                tracing::info!(job_id = %job.job_id, "Shutdown while waiting for send_after");
                return Ok(JobOutcome::Interrupted {
                    attempts: existing_attempts,
                });
            }

            // The deadline may have passed while we waited.
            if self.expire_if_needed(job, existing_attempts).await? {
                return Ok(JobOutcome::Expired);
            }
        }

        self.retry
            .run(job, existing_attempts, self.sender.as_ref())
            .await
    }

    /// Write EXPIRED (attempts unchanged) if the job's deadline has passed.
    async fn expire_if_needed(
        &self,
        job: &NotificationJob,
        attempts: u32,
    ) -> Result<bool, AppError> {
        if !is_expired(job, Utc::now()) {
            return Ok(false);
        }

        self.ledger
            .upsert(&DeliveryUpdate::expired(job, attempts))
            .await?;

        tracing::warn!(
            job_id = %job.job_id,
            expires_at = ?job.expires_at,
            attempts,
            "Job EXPIRED"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Duration as ChronoDuration;
    use herald_common::types::{Channel, Contacts, DeliveryStatus};

    use crate::dispatch::{ChannelRegistry, Dispatcher};
    use crate::testing::{
        FixedContacts, MemoryLedger, MemoryTemplates, RecordingDeadLetters, RecordingSender,
        ScriptedAttempt, email_template, make_job,
    };

    fn config(max_attempts: u32) -> DeliveryConfig {
        DeliveryConfig {
            max_attempts,
            backoff_schedule: vec![Duration::from_secs(1), Duration::from_secs(3)],
            max_send_delay: Duration::from_secs(300),
        }
    }

    fn processor(
        max_attempts: u32,
        ledger: Arc<MemoryLedger>,
        sender: Arc<dyn AttemptSend>,
        dlq: Arc<RecordingDeadLetters>,
    ) -> JobProcessor {
        JobProcessor::new(
            config(max_attempts),
            ledger,
            sender,
            DeadLetterSink::new(dlq),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_first_attempt_success() {
        let ledger = Arc::new(MemoryLedger::default());
        let sender = Arc::new(ScriptedAttempt::succeeding());
        let processor = processor(3, ledger.clone(), sender.clone(), Arc::default());
        let job = make_job();

        let outcome = processor.handle(&job).await.unwrap();

        assert_eq!(outcome, JobOutcome::Sent { attempts: 1 });
        let record = ledger.record(job.job_id).unwrap();
        assert_eq!(record.status, DeliveryStatus::Sent);
        assert_eq!(record.attempts, 1);
        assert!(record.sent_at.is_some());
        assert_eq!(ledger.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_second_handle_after_sent_is_noop() {
        let ledger = Arc::new(MemoryLedger::default());
        let sender = Arc::new(ScriptedAttempt::succeeding());
        let processor = processor(3, ledger.clone(), sender.clone(), Arc::default());
        let job = make_job();

        processor.handle(&job).await.unwrap();
        let before = ledger.record(job.job_id).unwrap();

        let outcome = processor.handle(&job).await.unwrap();

        assert_eq!(outcome, JobOutcome::Skipped);
        assert_eq!(sender.calls(), 1);
        assert_eq!(ledger.writes().len(), 1);
        let after = ledger.record(job.job_id).unwrap();
        assert_eq!(after.updated_at, before.updated_at);
    }

    #[tokio::test]
    async fn test_final_failed_record_is_skipped() {
        let job = make_job();
        let ledger = Arc::new(MemoryLedger::with_record(&job, DeliveryStatus::Failed, 3));
        let sender = Arc::new(ScriptedAttempt::succeeding());
        let processor = processor(3, ledger.clone(), sender.clone(), Arc::default());

        assert_eq!(processor.handle(&job).await.unwrap(), JobOutcome::Skipped);
        assert_eq!(sender.calls(), 0);
        assert!(ledger.writes().is_empty());
    }

    #[tokio::test]
    async fn test_expired_job_never_attempted() {
        let ledger = Arc::new(MemoryLedger::default());
        let sender = Arc::new(ScriptedAttempt::succeeding());
        let processor = processor(3, ledger.clone(), sender.clone(), Arc::default());
        let mut job = make_job();
        job.expires_at = Some(Utc::now() - ChronoDuration::minutes(1));

        let outcome = processor.handle(&job).await.unwrap();

        assert_eq!(outcome, JobOutcome::Expired);
        assert_eq!(sender.calls(), 0);
        let record = ledger.record(job.job_id).unwrap();
        assert_eq!(record.status, DeliveryStatus::Expired);
        assert_eq!(record.attempts, 0);
    }

    #[tokio::test]
    async fn test_expiry_keeps_existing_attempts() {
        let mut job = make_job();
        job.expires_at = Some(Utc::now() - ChronoDuration::seconds(1));
        let ledger = Arc::new(MemoryLedger::with_record(&job, DeliveryStatus::Retrying, 2));
        let sender = Arc::new(ScriptedAttempt::succeeding());
        let processor = processor(3, ledger.clone(), sender.clone(), Arc::default());

        assert_eq!(processor.handle(&job).await.unwrap(), JobOutcome::Expired);
        let record = ledger.record(job.job_id).unwrap();
        assert_eq!(record.status, DeliveryStatus::Expired);
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test]
    async fn test_restart_continues_attempt_budget() {
        let job = make_job();
        let ledger = Arc::new(MemoryLedger::with_record(&job, DeliveryStatus::Retrying, 2));
        let dlq = Arc::new(RecordingDeadLetters::default());
        let sender = Arc::new(ScriptedAttempt::always_failing());
        let processor = processor(3, ledger.clone(), sender.clone(), dlq.clone());

        let outcome = processor.handle(&job).await.unwrap();

        assert_eq!(outcome, JobOutcome::Failed { attempts: 3 });
        assert_eq!(sender.calls(), 1);
        assert_eq!(dlq.envelopes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_after_waits_on_job_task() {
        let ledger = Arc::new(MemoryLedger::default());
        let sender = Arc::new(ScriptedAttempt::succeeding());
        let processor = processor(3, ledger.clone(), sender.clone(), Arc::default());
        let mut job = make_job();
        job.send_after = Some(Utc::now() + ChronoDuration::seconds(30));

        let start = tokio::time::Instant::now();
        let outcome = processor.handle(&job).await.unwrap();

        assert_eq!(outcome, JobOutcome::Sent { attempts: 1 });
        let waited = start.elapsed();
        assert!(waited > Duration::from_secs(29) && waited <= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_after_wait_is_capped() {
        let ledger = Arc::new(MemoryLedger::default());
        let sender = Arc::new(ScriptedAttempt::succeeding());
        let processor = processor(3, ledger.clone(), sender.clone(), Arc::default());
        let mut job = make_job();
        job.send_after = Some(Utc::now() + ChronoDuration::days(2));

        let start = tokio::time::Instant::now();
        processor.handle(&job).await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(300));
        assert_eq!(sender.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_send_after_wait() {
        let ledger = Arc::new(MemoryLedger::default());
        let sender = Arc::new(ScriptedAttempt::succeeding());
        let shutdown = CancellationToken::new();
        let processor = JobProcessor::new(
            config(3),
            ledger.clone(),
            sender.clone(),
            DeadLetterSink::new(Arc::new(RecordingDeadLetters::default())),
            shutdown.clone(),
        );
        let mut job = make_job();
        job.send_after = Some(Utc::now() + ChronoDuration::seconds(120));

        shutdown.cancel();
        let outcome = processor.handle(&job).await.unwrap();

        assert_eq!(outcome, JobOutcome::Interrupted { attempts: 0 });
        assert_eq!(sender.calls(), 0);
        assert!(ledger.record(job.job_id).is_none());
    }

    // Real time: Utc::now does not move with a paused tokio clock.
    #[tokio::test]
    async fn test_expiry_rechecked_after_send_after_wait() {
        let ledger = Arc::new(MemoryLedger::default());
        let sender = Arc::new(ScriptedAttempt::succeeding());
        let processor = processor(3, ledger.clone(), sender.clone(), Arc::default());
        let mut job = make_job();
        let now = Utc::now();
        job.expires_at = Some(now + ChronoDuration::milliseconds(200));
        job.send_after = Some(now + ChronoDuration::milliseconds(400));

        let outcome = processor.handle(&job).await.unwrap();

        assert_eq!(outcome, JobOutcome::Expired);
        assert_eq!(sender.calls(), 0);
        let record = ledger.record(job.job_id).unwrap();
        assert_eq!(record.status, DeliveryStatus::Expired);
        assert_eq!(record.attempts, 0);
        assert_eq!(ledger.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_email_counts_as_failed_attempt() {
        let job = make_job();
        let ledger = Arc::new(MemoryLedger::default());
        let dlq = Arc::new(RecordingDeadLetters::default());
        let dispatcher = Dispatcher::new(
            Arc::new(FixedContacts(Contacts {
                user_id: job.user_id,
                ..Default::default()
            })),
            Arc::new(MemoryTemplates::with(email_template("Hi", "Body"))),
            ChannelRegistry::new().register(Channel::Email, Arc::new(RecordingSender::default())),
        );
        let processor = JobProcessor::new(
            DeliveryConfig {
                max_attempts: 1,
                backoff_schedule: Vec::new(),
                max_send_delay: Duration::from_secs(300),
            },
            ledger.clone(),
            Arc::new(dispatcher),
            DeadLetterSink::new(dlq.clone()),
            CancellationToken::new(),
        );

        let outcome = processor.handle(&job).await.unwrap();

        assert_eq!(outcome, JobOutcome::Failed { attempts: 1 });
        let record = ledger.record(job.job_id).unwrap();
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert!(
            record
                .error_message
                .as_deref()
                .is_some_and(|msg| msg.contains("email destination"))
        );
        assert_eq!(dlq.envelopes().len(), 1);
    }
}
