//! Bounded retries for connecting to backing services at startup.
//!
//! Containers often start before Postgres or Redis accept connections, so a
//! failed first connect is retried a fixed number of times before giving up.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::config::AppConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl ConnectRetry {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            attempts: config.startup_connect_attempts,
            delay: Duration::from_millis(config.startup_connect_delay_ms),
        }
    }
}

impl Default for ConnectRetry {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_secs(1),
        }
    }
}

/// Run `connect` until it succeeds or `retry.attempts` is used up.
pub async fn with_retry<T, E, F, Fut>(
    service: &str,
    retry: ConnectRetry,
    mut connect: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display + Into<anyhow::Error>,
{
    let mut attempt = 1;
    loop {
        match connect().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < retry.attempts => {
                tracing::warn!(
                    service,
                    attempt,
                    max_attempts = retry.attempts,
                    error = %e,
                    "Connection failed, retrying"
                );
                tokio::time::sleep(retry.delay).await;
                attempt += 1;
            }
            Err(e) => {
                let error: anyhow::Error = e.into();
                return Err(error.context(format!(
                    "{} unreachable after {} attempts",
                    service, attempt
                )));
            }
        }
    }
}
