use redis::Client;
use redis::aio::ConnectionManager;

use crate::connect::{ConnectRetry, with_retry};

/// Create a Redis connection manager for async operations.
///
/// The manager reconnects on its own and is cheap to clone, so the job queue
/// and the dead-letter transport each hold a clone.
pub async fn create_redis_pool(
    redis_url: &str,
    retry: ConnectRetry,
) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let manager = with_retry("redis", retry, || ConnectionManager::new(client.clone())).await?;

    tracing::info!("Connected to Redis");
    Ok(manager)
}
