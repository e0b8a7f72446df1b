//! Redis-list job queue with at-least-once reservation.
//!
//! Producers `LPUSH` onto the queue list. A worker reserves a payload by
//! atomically moving it onto its processing list (`LMOVE ... RIGHT LEFT`) and
//! acknowledges it by removing it from there (`LREM`). Payloads left on the
//! processing list when the worker stopped are moved back with
//! [`RedisJobQueue::recover_in_flight`] before consumption starts.

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use herald_common::error::AppError;
use herald_common::types::NotificationJob;
use herald_engine::campaign::JobPublisher;

/// Consumer-side view of the queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Reserve the oldest payload, or `None` when the queue is empty.
    async fn reserve(&self) -> Result<Option<Vec<u8>>, AppError>;

    /// Drop a reserved payload for good.
    async fn ack(&self, payload: &[u8]) -> Result<(), AppError>;

    /// Hand a reserved payload back to the queue for another delivery.
    async fn requeue(&self, payload: &[u8]) -> Result<(), AppError>;
}

#[derive(Clone)]
pub struct RedisJobQueue {
    redis: ConnectionManager,
    queue_key: String,
    processing_key: String,
}

impl RedisJobQueue {
    pub fn new(
        redis: ConnectionManager,
        queue_key: impl Into<String>,
        processing_key: impl Into<String>,
    ) -> Self {
        Self {
            redis,
            queue_key: queue_key.into(),
            processing_key: processing_key.into(),
        }
    }

    /// Move every reserved-but-unacknowledged payload back onto the queue.
    ///
    /// The oldest reservation ends up at the consuming end, so recovered jobs
    /// are picked up first and in their original order.
    pub async fn recover_in_flight(&self) -> Result<usize, AppError> {
        let mut redis = self.redis.clone();
        let mut recovered = 0;

        loop {
            let moved: Option<Vec<u8>> = redis::cmd("LMOVE")
                .arg(&self.processing_key)
                .arg(&self.queue_key)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut redis)
                .await?;

            if moved.is_none() {
                break;
            }
            recovered += 1;
        }

        if recovered > 0 {
            tracing::info!(
                recovered,
                queue = %self.queue_key,
                "Re-queued jobs left in flight by a previous run"
            );
        }
        Ok(recovered)
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn reserve(&self) -> Result<Option<Vec<u8>>, AppError> {
        let mut redis = self.redis.clone();

        let payload: Option<Vec<u8>> = redis::cmd("LMOVE")
            .arg(&self.queue_key)
            .arg(&self.processing_key)
            .arg("RIGHT")
            .arg("LEFT")
            .query_async(&mut redis)
            .await?;

        Ok(payload)
    }

    async fn ack(&self, payload: &[u8]) -> Result<(), AppError> {
        let mut redis = self.redis.clone();

        let removed: i64 = redis::cmd("LREM")
            .arg(&self.processing_key)
            .arg(1)
            .arg(payload)
            .query_async(&mut redis)
            .await?;

        if removed == 0 {
            tracing::warn!(
                processing = %self.processing_key,
                "Acknowledged payload was not on the processing list"
            );
        }
        Ok(())
    }

    async fn requeue(&self, payload: &[u8]) -> Result<(), AppError> {
        let mut redis = self.redis.clone();

        // Newest end of the queue, so other pending jobs go first.
        let _: () = redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(&self.processing_key)
            .arg(1)
            .arg(payload)
            .ignore()
            .cmd("LPUSH")
            .arg(&self.queue_key)
            .arg(payload)
            .ignore()
            .query_async(&mut redis)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl JobPublisher for RedisJobQueue {
    async fn publish(&self, job: &NotificationJob) -> Result<(), AppError> {
        let payload = serde_json::to_string(job)?;
        let mut redis = self.redis.clone();

        let _: () = redis::cmd("LPUSH")
            .arg(&self.queue_key)
            .arg(payload)
            .query_async(&mut redis)
            .await?;

        tracing::debug!(job_id = %job.job_id, queue = %self.queue_key, "Job enqueued");
        Ok(())
    }
}
