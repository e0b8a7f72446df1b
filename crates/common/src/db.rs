use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::connect::{ConnectRetry, with_retry};

/// Create a PostgreSQL connection pool shared by every in-flight job.
///
/// The ledger, template and campaign stores all borrow from this pool; rows are
/// keyed by job or campaign id, so concurrent jobs never contend on a row.
pub async fn create_pool(
    database_url: &str,
    max_connections: u32,
    retry: ConnectRetry,
) -> anyhow::Result<PgPool> {
    let pool = with_retry("postgres", retry, || {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(database_url)
    })
    .await?;

    tracing::info!(max_connections, "Connected to PostgreSQL");
    Ok(pool)
}

/// Apply the workspace migrations.
pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}
