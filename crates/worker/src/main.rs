use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use herald_common::config::AppConfig;
use herald_common::connect::ConnectRetry;
use herald_common::health::HealthFiles;
use herald_common::{db, redis_pool};
use herald_engine::JobProcessor;
use herald_engine::contacts::AuthContactResolver;
use herald_engine::dead_letter::{DeadLetterSink, RedisDeadLetterTransport};
use herald_engine::dispatch::Dispatcher;
use herald_engine::ledger::PgDeliveryLedger;
use herald_engine::template::PgTemplateStore;
use herald_notifier::SmtpEmailSender;
use herald_worker::consumer::{JobConsumer, PayloadHandler};
use herald_worker::queue::RedisJobQueue;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_worker=info,herald_engine=info".into()),
        )
        .json()
        .init();

    tracing::info!("Herald worker starting...");

    let config = AppConfig::from_env()?;
    let health = HealthFiles::from_config(&config);
    health.clear_ready().await;

    let retry = ConnectRetry::from_config(&config);
    let pool = db::create_pool(&config.database_url, config.db_max_connections, retry).await?;
    db::migrate(&pool).await?;

    let redis = redis_pool::create_redis_pool(&config.redis_url, retry).await?;

    let queue = Arc::new(RedisJobQueue::new(
        redis.clone(),
        config.job_queue_key.clone(),
        config.job_processing_key.clone(),
    ));
    queue.recover_in_flight().await?;

    let dead_letters = DeadLetterSink::new(Arc::new(RedisDeadLetterTransport::new(
        redis,
        config.dlq_key.clone(),
    )));

    let contacts = AuthContactResolver::new(
        config.auth_base_url.clone(),
        Duration::from_secs(config.auth_timeout_seconds),
    )?;
    if config.auth_base_url.is_none() {
        tracing::warn!("AUTH_BASE_URL not set, using synthesized contacts");
    }

    let email = SmtpEmailSender::new(&config.smtp_host, config.smtp_port, &config.smtp_from)?;
    let registry = herald_notifier::default_registry(Arc::new(email));
    tracing::info!(
        channels = ?registry.channels().collect::<Vec<_>>(),
        "Channel senders registered"
    );
    let dispatcher = Dispatcher::new(
        Arc::new(contacts),
        Arc::new(PgTemplateStore::new(pool.clone())),
        registry,
    );

    let shutdown = CancellationToken::new();
    let processor = JobProcessor::new(
        config.delivery.clone(),
        Arc::new(PgDeliveryLedger::new(pool.clone())),
        Arc::new(dispatcher),
        dead_letters.clone(),
        shutdown.clone(),
    );

    tracing::info!(
        max_attempts = config.delivery.max_attempts,
        backoff_schedule = ?config.delivery.backoff_schedule,
        max_send_delay_secs = config.delivery.max_send_delay.as_secs(),
        "Delivery pipeline configured"
    );

    let consumer = JobConsumer::new(
        queue.clone(),
        PayloadHandler::new(
            queue,
            Arc::new(processor),
            dead_letters,
            Duration::from_millis(config.storage_retry_delay_ms),
            shutdown.clone(),
        ),
        config.worker_concurrency,
        Duration::from_millis(config.queue_poll_interval_ms),
        Duration::from_secs(config.shutdown_grace_seconds),
    );

    // Cancel on Ctrl+C; the consumer drains in-flight jobs before returning
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Received shutdown signal, stopping gracefully...");
        signal_token.cancel();
    });

    let heartbeat = tokio::spawn(health.clone().heartbeat_loop(
        Duration::from_secs(config.heartbeat_interval_seconds),
        shutdown.clone(),
    ));
    health.mark_ready().await;

    let result = consumer.run(shutdown.clone()).await;

    health.clear_ready().await;
    shutdown.cancel();
    if let Err(e) = heartbeat.await {
        tracing::warn!(error = %e, "Heartbeat task ended abnormally");
    }
    pool.close().await;
    result?;
    tracing::info!("Herald worker stopped.");
    Ok(())
}
