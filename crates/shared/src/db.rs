//! Database utilities and connection management
//!
//! The pool is created once by each binary's entry point and handed to every
//! billing component; components never open or close connections themselves.

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

use crate::error::PixmeterResult;
use std::{str::FromStr, time::Duration};

/// Pool sizing and timeouts
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Applied to every connection as `statement_timeout`
    pub statement_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            statement_timeout: Duration::from_secs(30),
        }
    }
}

/// Create a database connection pool
pub async fn create_pool(database_url: &str, settings: &PoolSettings) -> PixmeterResult<PgPool> {
    let options = PgConnectOptions::from_str(database_url)?.options([(
        "statement_timeout",
        settings.statement_timeout.as_millis().to_string(),
    )]);

    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(0)
        .acquire_timeout(settings.acquire_timeout)
        .idle_timeout(Duration::from_secs(60))
        .max_lifetime(Duration::from_secs(1800))
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Create a database connection pool for migrations with longer timeout
/// Uses single connection since migrations run sequentially
pub async fn create_migration_pool(database_url: &str) -> PixmeterResult<PgPool> {
    let options = PgConnectOptions::from_str(database_url)?;

    let pool = PgPoolOptions::new()
        .max_connections(1)
        .min_connections(0)
        .acquire_timeout(Duration::from_secs(120))
        .idle_timeout(Duration::from_secs(30))
        .max_lifetime(Duration::from_secs(180))
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> PixmeterResult<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}
