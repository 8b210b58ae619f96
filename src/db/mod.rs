//! Database module for persistent storage of event rows and read models.
//!
//! This module provides SQLite-based storage for:
//! - Raw decoded events from every chain (audit trail, exactly-once keyed)
//! - Checkpoints, stakes, pool states, token prices
//! - Payment requests and matched transfers
//!
//! # Architecture
//!
//! - `models`: Data structures that map to database tables
//! - `repository`: CRUD operations and ingestion transactions
//! - Connection pooling with SQLite WAL mode for concurrency
//! - Migration system for schema versioning; migrations are forward-only

use std::str::FromStr;
use std::time::Duration;

use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    SqlitePool,
};
use tracing::{info, warn};

use crate::error::LedgerError;

pub mod models;
pub mod repository;

/// Creates a SQLite connection pool with optimized settings.
///
/// # Configuration
///
/// - **WAL mode**: Enables concurrent readers during writes
/// - **Busy timeout**: 30 seconds to handle lock contention
/// - **Max connections**: 5 (suitable for a single-machine backend)
/// - **Min connections**: 1 (keep one connection warm)
///
/// # Errors
///
/// Returns a database error if the URL does not parse, the connection cannot
/// be established, or migrations fail.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool, LedgerError> {
    info!(database_url, "Connecting to database");

    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| {
            LedgerError::database(
                format!("Failed to parse database URL: {database_url}"),
                Some(Box::new(e)),
            )
        })?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(30));

    // An in-memory SQLite database is private to its connection; a pool of
    // them would be a pool of unrelated databases. One connection keeps
    // test databases coherent.
    let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options)
        .await
        .map_err(|e| {
            LedgerError::database(
                format!("Failed to connect to database at {database_url}"),
                Some(Box::new(e)),
            )
        })?;

    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await
        .map_err(|e| {
            LedgerError::database("Failed to enable foreign keys".to_string(), Some(Box::new(e)))
        })?;

    info!("Running database migrations");
    run_migrations(&pool).await?;
    info!("Database migrations complete");

    Ok(pool)
}

/// Connect to the primary database, falling back to the secondary when the
/// primary is unreachable.
///
/// # Errors
///
/// Returns the primary's error when no fallback is configured, or the
/// fallback's error when both fail.
pub async fn create_pool_with_fallback(
    primary: &str,
    fallback: Option<&str>,
) -> Result<SqlitePool, LedgerError> {
    match create_pool(primary).await {
        Ok(pool) => Ok(pool),
        Err(primary_err) => match fallback {
            Some(url) => {
                warn!(error = %primary_err, "Primary database unavailable, trying fallback");
                create_pool(url).await
            }
            None => Err(primary_err),
        },
    }
}

/// Runs database migrations to ensure schema is up-to-date.
///
/// Applies all pending migrations from the `migrations/` directory, in
/// order; safe to run multiple times.
///
/// # Errors
///
/// Returns a database error when a migration fails to apply.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), LedgerError> {
    sqlx::migrate!("./migrations").run(pool).await.map_err(|e| {
        LedgerError::database(
            "Failed to run database migrations".to_string(),
            Some(Box::new(e)),
        )
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_pool_and_migrations() {
        let pool = create_pool("sqlite::memory:")
            .await
            .expect("Failed to create pool");

        let result: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type='table'")
                .fetch_one(&pool)
                .await
                .expect("Failed to query tables");

        // Core tables plus the migration history table.
        assert!(result.0 >= 12, "Expected at least 12 tables, got {}", result.0);
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = create_pool("sqlite::memory:")
            .await
            .expect("Failed to create pool");

        run_migrations(&pool)
            .await
            .expect("Second migration run should be a no-op");
    }

    #[tokio::test]
    async fn test_fallback_used_when_primary_unreachable() {
        let pool = create_pool_with_fallback("sqlite:/nonexistent-dir/x.db", Some("sqlite::memory:"))
            .await
            .expect("Fallback should connect");

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .expect("Fallback pool should be usable");
    }
}
