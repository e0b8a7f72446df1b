use std::path::PathBuf;
use std::time::Duration;

use crate::error::AppError;
use crate::types::Channel;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Redis connection string
    pub redis_url: String,

    /// Redis list the worker consumes jobs from
    pub job_queue_key: String,

    /// Redis list holding jobs reserved by a worker but not yet acknowledged
    pub job_processing_key: String,

    /// Redis list receiving dead-letter envelopes
    pub dlq_key: String,

    /// Queue polling interval in milliseconds when the queue is empty
    pub queue_poll_interval_ms: u64,

    /// Maximum number of jobs processed concurrently by one worker
    pub worker_concurrency: usize,

    /// How long in-flight jobs may keep running after a shutdown signal
    pub shutdown_grace_seconds: u64,

    /// Pause before a job hit by a storage failure goes back on the queue
    pub storage_retry_delay_ms: u64,

    /// Connection attempts for Postgres and Redis at startup (default: 10)
    pub startup_connect_attempts: u32,

    /// Delay between startup connection attempts in milliseconds
    pub startup_connect_delay_ms: u64,

    /// File present while the process is ready to work
    pub ready_file: PathBuf,

    /// File rewritten with the current timestamp on every heartbeat
    pub heartbeat_file: PathBuf,

    /// Heartbeat interval in seconds
    pub heartbeat_interval_seconds: u64,

    /// Delivery pipeline settings
    pub delivery: DeliveryConfig,

    /// Base URL of the auth service used to resolve user contacts
    pub auth_base_url: Option<String>,

    /// Timeout for contact lookups in seconds
    pub auth_timeout_seconds: u64,

    /// SMTP relay host
    pub smtp_host: String,

    /// SMTP relay port
    pub smtp_port: u16,

    /// Email sender address
    pub smtp_from: String,

    /// Campaign scheduler tick interval in seconds
    pub scheduler_poll_interval_seconds: u64,

    /// Channels a triggered campaign fans out to
    pub campaign_channels: Vec<Channel>,

    /// Locale stamped on campaign jobs
    pub campaign_locale: String,
}

/// Immutable settings threaded through the job processor and retry engine.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryConfig {
    /// Total attempt budget per job, across restarts
    pub max_attempts: u32,
    /// Delay before attempt N+1 is `backoff_schedule[min(N-1, len-1)]`
    pub backoff_schedule: Vec<Duration>,
    /// Upper bound on how long a job waits for its `send_after`
    pub max_send_delay: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_schedule: vec![
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(10),
            ],
            max_send_delay: Duration::from_secs(300),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let max_attempts: u32 = std::env::var("MAX_ATTEMPTS")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .map_err(|_| anyhow::anyhow!("MAX_ATTEMPTS must be a valid u32"))?;
        if max_attempts == 0 {
            anyhow::bail!("MAX_ATTEMPTS must be at least 1");
        }

        let backoff_schedule = parse_backoff_schedule(
            &std::env::var("RETRY_DELAYS_SECONDS").unwrap_or_else(|_| "1,3,10".to_string()),
        )?;

        let max_send_delay_seconds: u64 = std::env::var("MAX_SEND_DELAY_SECONDS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .map_err(|_| anyhow::anyhow!("MAX_SEND_DELAY_SECONDS must be a valid u64"))?;

        let worker_concurrency: usize = std::env::var("WORKER_CONCURRENCY")
            .unwrap_or_else(|_| "16".to_string())
            .parse()
            .map_err(|_| anyhow::anyhow!("WORKER_CONCURRENCY must be a valid usize"))?;
        if worker_concurrency == 0 {
            anyhow::bail!("WORKER_CONCURRENCY must be at least 1");
        }

        let startup_connect_attempts: u32 = std::env::var("STARTUP_CONNECT_ATTEMPTS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| anyhow::anyhow!("STARTUP_CONNECT_ATTEMPTS must be a valid u32"))?;
        if startup_connect_attempts == 0 {
            anyhow::bail!("STARTUP_CONNECT_ATTEMPTS must be at least 1");
        }

        let heartbeat_interval_seconds: u64 = std::env::var("HEARTBEAT_INTERVAL_SECONDS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .map_err(|_| anyhow::anyhow!("HEARTBEAT_INTERVAL_SECONDS must be a valid u64"))?;
        if heartbeat_interval_seconds == 0 {
            anyhow::bail!("HEARTBEAT_INTERVAL_SECONDS must be at least 1");
        }

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DB_MAX_CONNECTIONS must be a valid u32"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            job_queue_key: std::env::var("JOB_QUEUE_KEY")
                .unwrap_or_else(|_| "notifications:jobs".to_string()),
            job_processing_key: std::env::var("JOB_PROCESSING_KEY")
                .unwrap_or_else(|_| "notifications:jobs:processing".to_string()),
            dlq_key: std::env::var("DLQ_KEY").unwrap_or_else(|_| "notifications:dlq".to_string()),
            queue_poll_interval_ms: std::env::var("QUEUE_POLL_INTERVAL_MS")
                .unwrap_or_else(|_| "500".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("QUEUE_POLL_INTERVAL_MS must be a valid u64"))?,
            worker_concurrency,
            shutdown_grace_seconds: std::env::var("SHUTDOWN_GRACE_SECONDS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("SHUTDOWN_GRACE_SECONDS must be a valid u64"))?,
            storage_retry_delay_ms: std::env::var("STORAGE_RETRY_DELAY_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("STORAGE_RETRY_DELAY_MS must be a valid u64"))?,
            startup_connect_attempts,
            startup_connect_delay_ms: std::env::var("STARTUP_CONNECT_DELAY_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("STARTUP_CONNECT_DELAY_MS must be a valid u64"))?,
            ready_file: std::env::var("READY_FILE")
                .unwrap_or_else(|_| "/tmp/ready".to_string())
                .into(),
            heartbeat_file: std::env::var("HEARTBEAT_FILE")
                .unwrap_or_else(|_| "/tmp/heartbeat".to_string())
                .into(),
            heartbeat_interval_seconds,
            delivery: DeliveryConfig {
                max_attempts,
                backoff_schedule,
                max_send_delay: Duration::from_secs(max_send_delay_seconds),
            },
            auth_base_url: std::env::var("AUTH_BASE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            auth_timeout_seconds: std::env::var("AUTH_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("AUTH_TIMEOUT_SECONDS must be a valid u64"))?,
            smtp_host: std::env::var("SMTP_HOST").unwrap_or_else(|_| "localhost".to_string()),
            smtp_port: std::env::var("SMTP_PORT")
                .unwrap_or_else(|_| "1025".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("SMTP_PORT must be a valid u16"))?,
            smtp_from: std::env::var("SMTP_FROM")
                .unwrap_or_else(|_| "noreply@example.com".to_string()),
            scheduler_poll_interval_seconds: std::env::var("SCHEDULER_POLL_INTERVAL_SECONDS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .map_err(|_| {
                    anyhow::anyhow!("SCHEDULER_POLL_INTERVAL_SECONDS must be a valid u64")
                })?,
            campaign_channels: parse_channels(
                &std::env::var("CAMPAIGN_CHANNELS").unwrap_or_else(|_| "email".to_string()),
            )?,
            campaign_locale: std::env::var("CAMPAIGN_LOCALE").unwrap_or_else(|_| "ru".to_string()),
        })
    }
}

/// Parse a comma-separated list of delays in seconds (e.g. `"1,3,10"` or `"0.5,2"`).
///
/// An empty list is a configuration error rather than a silent busy-retry.
pub fn parse_backoff_schedule(raw: &str) -> Result<Vec<Duration>, AppError> {
    let parts: Vec<&str> = raw
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();

    if parts.is_empty() {
        return Err(AppError::Config(
            "RETRY_DELAYS_SECONDS is empty. Expected comma-separated numbers, e.g. '1,3,10'"
                .to_string(),
        ));
    }

    parts
        .into_iter()
        .map(|part| {
            let secs: f64 = part.parse().map_err(|_| {
                AppError::Config(format!(
                    "Invalid RETRY_DELAYS_SECONDS entry '{}'. Expected comma-separated numbers",
                    part
                ))
            })?;
            if !secs.is_finite() || secs < 0.0 {
                return Err(AppError::Config(format!(
                    "RETRY_DELAYS_SECONDS entry '{}' must be a non-negative number",
                    part
                )));
            }
            Ok(Duration::from_secs_f64(secs))
        })
        .collect()
}

/// Parse a comma-separated channel list (e.g. `"email,push"`).
pub fn parse_channels(raw: &str) -> Result<Vec<Channel>, AppError> {
    let channels = raw
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<Channel>()
                .map_err(|e| AppError::Config(format!("CAMPAIGN_CHANNELS: {}", e)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if channels.is_empty() {
        return Err(AppError::Config("CAMPAIGN_CHANNELS must name at least one channel".into()));
    }
    Ok(channels)
}
