//! Dead-letter sink for jobs and payloads that cannot be processed further.
//!
//! Publishing is best-effort: a failed publish is logged and dropped. The sink
//! never goes through the retry engine, so a broken dead-letter transport can
//! not feed back into job processing.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};

use herald_common::error::AppError;
use herald_common::types::NotificationJob;

/// What was dead-lettered: a decoded job, or the raw bytes that failed to decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterPayload {
    Job(NotificationJob),
    RawValue(String),
}

/// The record handed to the durable dead-letter transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEnvelope {
    #[serde(flatten)]
    pub payload: DeadLetterPayload,
    pub error_message: Option<String>,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEnvelope {
    /// Partition key: the job id for typed jobs, none for raw payloads.
    pub fn key(&self) -> Option<String> {
        match &self.payload {
            DeadLetterPayload::Job(job) => Some(job.job_id.to_string()),
            DeadLetterPayload::RawValue(_) => None,
        }
    }
}

/// Durable destination for dead-letter envelopes.
#[async_trait]
pub trait DeadLetterTransport: Send + Sync {
    async fn publish(&self, envelope: &DeadLetterEnvelope) -> Result<(), AppError>;
}

/// Entry point used by the pipeline and the inbound consumer.
#[derive(Clone)]
pub struct DeadLetterSink {
    transport: Arc<dyn DeadLetterTransport>,
}

impl DeadLetterSink {
    pub fn new(transport: Arc<dyn DeadLetterTransport>) -> Self {
        Self { transport }
    }

    /// Dead-letter a typed job that exhausted its attempts or blew up.
    pub async fn publish_job(&self, job: &NotificationJob, error_message: &str) {
        let envelope = DeadLetterEnvelope {
            payload: DeadLetterPayload::Job(job.clone()),
            error_message: Some(error_message.to_string()),
            failed_at: Utc::now(),
        };
        self.publish(envelope).await;
    }

    /// Dead-letter an inbound payload that never became a job.
    pub async fn publish_raw(&self, raw: &[u8], error_message: &str) {
        let envelope = DeadLetterEnvelope {
            payload: DeadLetterPayload::RawValue(String::from_utf8_lossy(raw).into_owned()),
            error_message: Some(error_message.to_string()),
            failed_at: Utc::now(),
        };
        self.publish(envelope).await;
    }

    async fn publish(&self, envelope: DeadLetterEnvelope) {
        let key = envelope.key();

        tracing::error!(
            key = key.as_deref().unwrap_or("-"),
            error_message = envelope.error_message.as_deref().unwrap_or(""),
            "Sending message to dead-letter sink"
        );

        if let Err(e) = self.transport.publish(&envelope).await {
            tracing::error!(
                key = key.as_deref().unwrap_or("-"),
                error = %e,
                "Dead-letter publish failed, envelope dropped"
            );
        }
    }
}

/// Dead-letter transport backed by a Redis list (`LPUSH`).
#[derive(Clone)]
pub struct RedisDeadLetterTransport {
    redis: ConnectionManager,
    list_key: String,
}

impl RedisDeadLetterTransport {
    pub fn new(redis: ConnectionManager, list_key: impl Into<String>) -> Self {
        Self {
            redis,
            list_key: list_key.into(),
        }
    }
}

#[async_trait]
impl DeadLetterTransport for RedisDeadLetterTransport {
    async fn publish(&self, envelope: &DeadLetterEnvelope) -> Result<(), AppError> {
        let value = serde_json::to_string(envelope)?;
        let mut redis = self.redis.clone();

        let _: () = redis::cmd("LPUSH")
            .arg(&self.list_key)
            .arg(value)
            .query_async(&mut redis)
            .await?;

        Ok(())
    }
}
