//! Database layer for the collector
//!
//! Provides:
//! - Row models for sources, articles and comments
//! - Repository for source bookkeeping and reads
//! - A transactional write handle for one source's batch
//! - Connection pool management for the embedded SQLite store

pub mod models;
mod repository;
mod write_tx;

pub use repository::Repository;
pub use write_tx::WriteTx;

use crate::config::DatabaseConfig;
use crate::errors::{AppError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Database connection pool wrapper
#[derive(Clone)]
pub struct DbPool {
    pool: SqlitePool,
}

impl DbPool {
    /// Open (creating if needed) the database file and run migrations
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!(path = %config.path, "Opening collector database...");

        if let Some(parent) = Path::new(&config.path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(AppError::Store)?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        info!(
            max_connections = config.max_connections,
            "Database ready"
        );

        Ok(Self { pool })
    }

    pub fn inner(&self) -> &SqlitePool {
        &self.pool
    }

    /// Ping the database to check connectivity
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
