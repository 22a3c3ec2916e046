//! Connection pool and table bootstrap for the records store

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::config::DatabaseConfig;

/// Database operation errors with contextual information
#[derive(Error, Debug)]
pub enum DbError {
    /// SQL query or connection error
    #[error("Database query failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Database configuration is invalid
    #[error("Database configuration error: {0}. Check DATABASE_URL and connection settings.")]
    Config(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Table the batch writer upserts into.
pub const RECORDS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    id    BIGINT PRIMARY KEY,
    name  TEXT NOT NULL,
    email TEXT NOT NULL,
    phone TEXT NOT NULL
)
"#;

fn pool_options(config: &DatabaseConfig) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
}

/// Connect eagerly; fails if the database is unreachable.
pub async fn create_pool(config: &DatabaseConfig) -> DbResult<PgPool> {
    let pool = pool_options(config).connect(&config.url).await?;

    tracing::info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Database connection pool created"
    );

    Ok(pool)
}

/// Build a pool that connects on first use.
///
/// The broker uses this so that an unreachable broker database shows up as a
/// registration failure (retried) rather than a startup failure.
pub fn create_lazy_pool(url: &str, config: &DatabaseConfig) -> DbResult<PgPool> {
    let options =
        PgConnectOptions::from_str(url).map_err(|e| DbError::Config(e.to_string()))?;
    Ok(pool_options(config).min_connections(0).connect_lazy_with(options))
}

/// Create the records table if it does not exist yet.
pub async fn ensure_schema(pool: &PgPool) -> DbResult<()> {
    sqlx::query(RECORDS_TABLE_DDL).execute(pool).await?;
    tracing::debug!("records table ready");
    Ok(())
}

pub async fn health_check(pool: &PgPool) -> DbResult<()> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map(|_| ())
        .map_err(DbError::from)
}
