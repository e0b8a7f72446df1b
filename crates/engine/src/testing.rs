//! In-memory collaborators for unit tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{
    Campaign, Channel, Contacts, DeliveryRecord, DeliveryStatus, JobMeta, NotificationJob,
    Priority, Template,
};

use crate::campaign::{CampaignStore, JobPublisher};
use crate::contacts::ContactResolver;
use crate::dead_letter::{DeadLetterEnvelope, DeadLetterTransport};
use crate::dispatch::{AttemptSend, ChannelSender};
use crate::error::DeliveryError;
use crate::ledger::{DeliveryLedger, DeliveryUpdate};
use crate::template::TemplateStore;

pub fn make_job() -> NotificationJob {
    NotificationJob {
        job_id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        channel: Channel::Email,
        template_code: "welcome_email".to_string(),
        locale: "en".to_string(),
        data: serde_json::json!({ "name": "Ann" }),
        meta: JobMeta {
            event_type: "user_registered".to_string(),
            event_id: Some(Uuid::new_v4()),
            campaign_id: None,
            priority: Priority::Normal,
        },
        created_at: Utc::now(),
        send_after: None,
        expires_at: None,
    }
}

pub fn email_template(subject: &str, body: &str) -> Template {
    Template {
        template_code: "welcome_email".to_string(),
        locale: "en".to_string(),
        channel: Channel::Email,
        subject: Some(subject.to_string()),
        body: body.to_string(),
    }
}

// ------------------------------------------------------------------
// Ledger
// ------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryLedger {
    records: Mutex<HashMap<Uuid, DeliveryRecord>>,
    writes: Mutex<Vec<DeliveryUpdate>>,
    fail_on: Mutex<Option<DeliveryStatus>>,
}

impl MemoryLedger {
    pub fn with_record(job: &NotificationJob, status: DeliveryStatus, attempts: i32) -> Self {
        let ledger = Self::default();
        ledger.records.lock().unwrap().insert(
            job.job_id,
            DeliveryRecord {
                job_id: job.job_id,
                user_id: job.user_id,
                channel: job.channel,
                status,
                attempts,
                error_message: None,
                sent_at: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
        );
        ledger
    }

    /// Make every write of `status` fail with a database error.
    pub fn fail_writes_of(&self, status: DeliveryStatus) {
        *self.fail_on.lock().unwrap() = Some(status);
    }

    pub fn record(&self, job_id: Uuid) -> Option<DeliveryRecord> {
        self.records.lock().unwrap().get(&job_id).cloned()
    }

    pub fn writes(&self) -> Vec<DeliveryUpdate> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryLedger for MemoryLedger {
    async fn get(&self, job_id: Uuid) -> Result<Option<DeliveryRecord>, AppError> {
        Ok(self.record(job_id))
    }

    async fn upsert(&self, update: &DeliveryUpdate) -> Result<(), AppError> {
        if *self.fail_on.lock().unwrap() == Some(update.status) {
            return Err(AppError::Database(sqlx::Error::PoolTimedOut));
        }

        self.writes.lock().unwrap().push(update.clone());
        let now = Utc::now();
        let mut records = self.records.lock().unwrap();
        let record = records.entry(update.job_id).or_insert(DeliveryRecord {
            job_id: update.job_id,
            user_id: update.user_id,
            channel: update.channel,
            status: update.status,
            attempts: 0,
            error_message: None,
            sent_at: None,
            created_at: now,
            updated_at: now,
        });
        record.status = update.status;
        record.attempts = record.attempts.max(update.attempts as i32);
        record.error_message = update.error_message.clone();
        record.sent_at = update.sent_at;
        record.updated_at = now;
        Ok(())
    }
}

// ------------------------------------------------------------------
// Dispatch collaborators
// ------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryTemplates {
    templates: Vec<Template>,
}

impl MemoryTemplates {
    pub fn with(template: Template) -> Self {
        Self {
            templates: vec![template],
        }
    }
}

#[async_trait]
impl TemplateStore for MemoryTemplates {
    async fn find(
        &self,
        template_code: &str,
        locale: &str,
        channel: Channel,
    ) -> Result<Option<Template>, AppError> {
        Ok(self
            .templates
            .iter()
            .find(|t| t.template_code == template_code && t.locale == locale && t.channel == channel)
            .cloned())
    }
}

pub struct FixedContacts(pub Contacts);

#[async_trait]
impl ContactResolver for FixedContacts {
    async fn resolve(&self, _user_id: Uuid) -> Contacts {
        self.0.clone()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub destination: String,
    pub subject: String,
    pub body: String,
}

#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<SentMessage>>,
    fail_with: Option<String>,
}

impl RecordingSender {
    pub fn failing(message: &str) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_with: Some(message.to_string()),
        }
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelSender for RecordingSender {
    async fn send(&self, destination: &str, subject: &str, body: &str) -> anyhow::Result<()> {
        if let Some(message) = &self.fail_with {
            anyhow::bail!("{}", message);
        }
        self.sent.lock().unwrap().push(SentMessage {
            destination: destination.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

/// Attempt operation that fails a fixed number of times, then succeeds.
pub struct ScriptedAttempt {
    failures_before_success: Option<u32>,
    calls: AtomicU32,
    call_times: Mutex<Vec<Instant>>,
}

impl ScriptedAttempt {
    pub fn succeeding() -> Self {
        Self::failing_times(0)
    }

    pub fn failing_times(failures: u32) -> Self {
        Self {
            failures_before_success: Some(failures),
            calls: AtomicU32::new(0),
            call_times: Mutex::new(Vec::new()),
        }
    }

    pub fn always_failing() -> Self {
        Self {
            failures_before_success: None,
            calls: AtomicU32::new(0),
            call_times: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Gaps between consecutive calls, in tokio time.
    pub fn gaps(&self) -> Vec<std::time::Duration> {
        let times = self.call_times.lock().unwrap();
        times.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

#[async_trait]
impl AttemptSend for ScriptedAttempt {
    async fn attempt(&self, _job: &NotificationJob) -> Result<(), DeliveryError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.call_times.lock().unwrap().push(Instant::now());

        match self.failures_before_success {
            Some(failures) if call > failures => Ok(()),
            _ => Err(DeliveryError::Send(anyhow::anyhow!("attempt {} failed", call))),
        }
    }
}

// ------------------------------------------------------------------
// Dead letters
// ------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingDeadLetters {
    envelopes: Mutex<Vec<DeadLetterEnvelope>>,
}

impl RecordingDeadLetters {
    pub fn envelopes(&self) -> Vec<DeadLetterEnvelope> {
        self.envelopes.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetterTransport for RecordingDeadLetters {
    async fn publish(&self, envelope: &DeadLetterEnvelope) -> Result<(), AppError> {
        self.envelopes.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}

pub struct FailingDeadLetters;

#[async_trait]
impl DeadLetterTransport for FailingDeadLetters {
    async fn publish(&self, _envelope: &DeadLetterEnvelope) -> Result<(), AppError> {
        Err(AppError::Internal("dead-letter transport unavailable".into()))
    }
}

// ------------------------------------------------------------------
// Campaigns
// ------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryCampaigns {
    campaigns: Mutex<Vec<Campaign>>,
    marked: Mutex<Vec<Uuid>>,
}

impl MemoryCampaigns {
    pub fn with(campaigns: Vec<Campaign>) -> Self {
        Self {
            campaigns: Mutex::new(campaigns),
            marked: Mutex::new(Vec::new()),
        }
    }

    pub fn marked(&self) -> Vec<Uuid> {
        self.marked.lock().unwrap().clone()
    }

    pub fn get(&self, id: Uuid) -> Option<Campaign> {
        self.campaigns
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }
}

#[async_trait]
impl CampaignStore for MemoryCampaigns {
    async fn list_active(&self) -> Result<Vec<Campaign>, AppError> {
        Ok(self
            .campaigns
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.status == herald_common::types::CampaignStatus::Active)
            .cloned()
            .collect())
    }

    async fn mark_triggered(&self, campaign_id: Uuid) -> Result<bool, AppError> {
        use herald_common::types::CampaignStatus;

        let mut campaigns = self.campaigns.lock().unwrap();
        let Some(campaign) = campaigns.iter_mut().find(|c| {
            c.id == campaign_id
                && c.status == CampaignStatus::Active
                && c.max_runs.is_none_or(|max| c.runs_count < max)
        }) else {
            return Ok(false);
        };

        campaign.runs_count += 1;
        campaign.last_triggered_at = Some(Utc::now());
        if campaign.max_runs.is_some_and(|max| campaign.runs_count >= max) {
            campaign.status = CampaignStatus::Inactive;
        }
        self.marked.lock().unwrap().push(campaign_id);
        Ok(true)
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    jobs: Mutex<Vec<NotificationJob>>,
    fail: bool,
}

impl RecordingPublisher {
    pub fn failing() -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn jobs(&self) -> Vec<NotificationJob> {
        self.jobs.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobPublisher for RecordingPublisher {
    async fn publish(&self, job: &NotificationJob) -> Result<(), AppError> {
        if self.fail {
            return Err(AppError::Internal("queue unavailable".into()));
        }
        self.jobs.lock().unwrap().push(job.clone());
        Ok(())
    }
}
