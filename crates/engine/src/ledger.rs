//! Delivery ledger: the persisted per-job delivery record.
//!
//! One row per job id. It is the single source of truth for idempotency and
//! for the attempt budget, so a restarted worker continues where the previous
//! one stopped instead of resetting the count.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{Channel, DeliveryRecord, DeliveryStatus, NotificationJob};

/// Message stored on records that expired before being sent.
pub const EXPIRED_MESSAGE: &str = "notification expired";

/// A full status write for one job, applied with insert-or-update semantics.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryUpdate {
    pub job_id: Uuid,
    pub user_id: Uuid,
    pub channel: Channel,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub error_message: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl DeliveryUpdate {
    pub fn sent(job: &NotificationJob, attempts: u32, sent_at: DateTime<Utc>) -> Self {
        Self {
            job_id: job.job_id,
            user_id: job.user_id,
            channel: job.channel,
            status: DeliveryStatus::Sent,
            attempts,
            error_message: None,
            sent_at: Some(sent_at),
        }
    }

    /// FAILED when `last_attempt`, RETRYING otherwise.
    pub fn failure(job: &NotificationJob, attempts: u32, error: String, last_attempt: bool) -> Self {
        Self {
            job_id: job.job_id,
            user_id: job.user_id,
            channel: job.channel,
            status: if last_attempt {
                DeliveryStatus::Failed
            } else {
                DeliveryStatus::Retrying
            },
            attempts,
            error_message: Some(error),
            sent_at: None,
        }
    }

    pub fn expired(job: &NotificationJob, attempts: u32) -> Self {
        Self {
            job_id: job.job_id,
            user_id: job.user_id,
            channel: job.channel,
            status: DeliveryStatus::Expired,
            attempts,
            error_message: Some(EXPIRED_MESSAGE.to_string()),
            sent_at: None,
        }
    }
}

/// Storage contract for delivery records.
///
/// Implementations must key writes uniquely on the job id; writes for
/// different jobs never conflict and need no cross-job locking.
#[async_trait]
pub trait DeliveryLedger: Send + Sync {
    async fn get(&self, job_id: Uuid) -> Result<Option<DeliveryRecord>, AppError>;

    async fn upsert(&self, update: &DeliveryUpdate) -> Result<(), AppError>;
}

/// Idempotency gate: whether an existing record means the job is already final.
///
/// SENT is always final. FAILED and EXPIRED are final once the attempt budget
/// is spent; below the budget the job is re-evaluated.
pub fn should_skip(record: &DeliveryRecord, max_attempts: u32) -> bool {
    match record.status {
        DeliveryStatus::Sent => true,
        DeliveryStatus::Failed | DeliveryStatus::Expired => record.attempt_count() >= max_attempts,
        DeliveryStatus::Retrying => false,
    }
}

/// Postgres-backed ledger on the `notification_delivery` table.
#[derive(Clone)]
pub struct PgDeliveryLedger {
    pool: PgPool,
}

impl PgDeliveryLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeliveryLedger for PgDeliveryLedger {
    async fn get(&self, job_id: Uuid) -> Result<Option<DeliveryRecord>, AppError> {
        let record: Option<DeliveryRecord> = sqlx::query_as(
            r#"
            SELECT job_id, user_id, channel, status, attempts, error_message,
                   sent_at, created_at, updated_at
            FROM notification_delivery
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn upsert(&self, update: &DeliveryUpdate) -> Result<(), AppError> {
        // Attempts never move backwards, even if a stale writer races a newer one.
        sqlx::query(
            r#"
            INSERT INTO notification_delivery
                (job_id, user_id, channel, status, attempts, error_message, sent_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (job_id) DO UPDATE SET
                status = EXCLUDED.status,
                attempts = GREATEST(notification_delivery.attempts, EXCLUDED.attempts),
                error_message = EXCLUDED.error_message,
                sent_at = EXCLUDED.sent_at,
                updated_at = NOW()
            "#,
        )
        .bind(update.job_id)
        .bind(update.user_id)
        .bind(update.channel.to_string())
        .bind(update.status.to_string())
        .bind(update.attempts as i32)
        .bind(&update.error_message)
        .bind(update.sent_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            job_id = %update.job_id,
            status = %update.status,
            attempts = update.attempts,
            "Delivery record written"
        );

        Ok(())
    }
}
