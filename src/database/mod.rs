pub mod error;
pub mod in_memory;
pub mod repository;
pub mod stk_transaction_repository;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{error as log_error, info, warn};

use self::error::DatabaseError;
use crate::config::DatabaseConfig;

pub use in_memory::InMemoryTransactionStore;
pub use repository::TransactionStore;
pub use stk_transaction_repository::PgTransactionStore;

/// Idle connections are recycled after this long unless `DB_IDLE_TIMEOUT` says otherwise.
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;

fn pool_options(config: &DatabaseConfig) -> PgPoolOptions {
    let idle_timeout = config.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS);
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections.min(config.max_connections))
        .acquire_timeout(Duration::from_secs(config.connection_timeout))
        .idle_timeout((idle_timeout > 0).then(|| Duration::from_secs(idle_timeout)))
}

/// Connect the pool backing the transaction store.
pub async fn init_pool(config: &DatabaseConfig) -> Result<PgPool, DatabaseError> {
    info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        acquire_timeout_secs = config.connection_timeout,
        "connecting transaction store pool"
    );

    let pool = pool_options(config).connect(&config.url).await.map_err(|e| {
        log_error!(error = %e, "failed to connect transaction store pool");
        DatabaseError::from_sqlx(e)
    })?;

    info!("transaction store pool ready");
    Ok(pool)
}

/// Apply pending schema migrations from `migrations/`
pub async fn run_migrations(pool: &PgPool) -> Result<(), DatabaseError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations applied");
    Ok(())
}

/// Connection pool health check
pub async fn health_check(pool: &PgPool) -> Result<(), DatabaseError> {
    sqlx::query("SELECT 1").fetch_one(pool).await.map_err(|e| {
        warn!("Health check failed: {}", e);
        DatabaseError::from_sqlx(e)
    })?;

    Ok(())
}
