//! Error types for Pixmeter

use thiserror::Error;

/// Errors raised while bootstrapping shared infrastructure (pool, migrations)
#[derive(Debug, Error)]
pub enum PixmeterError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type PixmeterResult<T> = Result<T, PixmeterError>;
