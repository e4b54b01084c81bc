//! Repository for collector data access
//!
//! Source status columns (`status`, `last_run_at`, `last_success_at`,
//! `last_error`) are written only from here, one row per statement, and
//! never inside a batch transaction.

use crate::db::models::*;
use crate::db::{DbPool, WriteTx};
use crate::errors::{AppError, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

const SOURCE_COLUMNS: &str = "id, type, config, external_id, last_run_at, last_success_at, \
                              last_error, status, created_at";

/// Repository for data access operations
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> &SqlitePool {
        self.pool.inner()
    }

    /// Ping the database
    pub async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    // ========================================================================
    // Source Operations
    // ========================================================================

    /// Every source, in insertion order
    pub async fn list_all_sources(&self) -> Result<Vec<Source>> {
        let rows = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources ORDER BY rowid"
        ))
        .fetch_all(self.conn())
        .await?;

        rows.iter().map(source_from_row).collect()
    }

    pub async fn get_source(&self, id: Uuid) -> Result<Option<Source>> {
        let row = sqlx::query(&format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(self.conn())
            .await?;

        row.as_ref().map(source_from_row).transpose()
    }

    /// Insert a source. Fails on a duplicate `(type, external_id)`.
    pub async fn create_source(&self, new: &NewSource) -> Result<Source> {
        let id = Uuid::new_v4();
        let config = serde_json::to_string(&new.config)?;

        sqlx::query(
            r#"
            INSERT INTO sources (id, type, config, external_id, status, created_at)
            VALUES (?1, ?2, ?3, ?4, 'idle', ?5)
            "#,
        )
        .bind(id.to_string())
        .bind(new.source_type.as_str())
        .bind(config)
        .bind(&new.external_id)
        .bind(Utc::now())
        .execute(self.conn())
        .await?;

        self.get_source(id).await?.ok_or_else(|| AppError::Internal {
            message: format!("source {id} vanished after insert"),
        })
    }

    /// Delete a source together with its articles and comments
    pub async fn delete_source(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sources WHERE id = ?1")
            .bind(id.to_string())
            .execute(self.conn())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_source_status(&self, id: Uuid, status: SourceStatus) -> Result<()> {
        sqlx::query("UPDATE sources SET status = ?1 WHERE id = ?2")
            .bind(status.as_str())
            .bind(id.to_string())
            .execute(self.conn())
            .await?;
        debug!(source_id = %id, status = status.as_str(), "Source status updated");
        Ok(())
    }

    /// Stamp a successful run and clear any previous error
    pub async fn record_success(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sources
            SET last_run_at = ?1, last_success_at = ?1, last_error = NULL
            WHERE id = ?2
            "#,
        )
        .bind(at)
        .bind(id.to_string())
        .execute(self.conn())
        .await?;
        Ok(())
    }

    /// Stamp a failed run. `last_success_at` is left untouched.
    pub async fn record_error(&self, id: Uuid, at: DateTime<Utc>, message: &str) -> Result<()> {
        sqlx::query("UPDATE sources SET last_run_at = ?1, last_error = ?2 WHERE id = ?3")
            .bind(at)
            .bind(message)
            .bind(id.to_string())
            .execute(self.conn())
            .await?;
        Ok(())
    }

    /// Latest `last_run_at` across all sources
    pub async fn last_run_at_max(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            r#"
            SELECT last_run_at FROM sources
            WHERE last_run_at IS NOT NULL
            ORDER BY last_run_at DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(self.conn())
        .await?;

        match row {
            Some(row) => Ok(row.try_get::<Option<DateTime<Utc>>, _>("last_run_at")?),
            None => Ok(None),
        }
    }

    /// Return rows left `running` by a crashed process to `idle`.
    /// Reporting is left to the caller.
    pub async fn reset_running_sources(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE sources SET status = 'idle' WHERE status = 'running'")
            .execute(self.conn())
            .await?;
        Ok(result.rows_affected())
    }

    // ========================================================================
    // Batch Writes
    // ========================================================================

    /// Open the transaction that holds one source's articles and comments
    pub async fn begin_write(&self) -> Result<WriteTx> {
        let tx = self.conn().begin().await?;
        Ok(WriteTx::new(tx))
    }

    // ========================================================================
    // Article / Comment Reads
    // ========================================================================

    pub async fn list_articles(&self, source_id: Uuid) -> Result<Vec<Article>> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_id, external_id, title, author, content, url,
                   written_at, metadata, created_at
            FROM articles
            WHERE source_id = ?1
            ORDER BY written_at DESC, rowid
            "#,
        )
        .bind(source_id.to_string())
        .fetch_all(self.conn())
        .await?;

        rows.iter().map(article_from_row).collect()
    }

    /// Comments of one article in insertion order, so parents precede children
    pub async fn list_comments(&self, article_id: Uuid) -> Result<Vec<Comment>> {
        let rows = sqlx::query(
            r#"
            SELECT id, article_id, external_id, author, content, written_at, parent_id, depth
            FROM comments
            WHERE article_id = ?1
            ORDER BY rowid
            "#,
        )
        .bind(article_id.to_string())
        .fetch_all(self.conn())
        .await?;

        rows.iter().map(comment_from_row).collect()
    }

    pub async fn count_articles(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM articles")
            .fetch_one(self.conn())
            .await?;
        Ok(count)
    }

    pub async fn count_comments(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM comments")
            .fetch_one(self.conn())
            .await?;
        Ok(count)
    }
}

// ============================================================================
// Row mapping
// ============================================================================

pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| AppError::Internal {
        message: format!("corrupt uuid {raw:?} in store: {e}"),
    })
}

fn parse_json(raw: &str) -> serde_json::Value {
    // A malformed blob surfaces later as ConfigInvalid for that one source
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn source_from_row(row: &SqliteRow) -> Result<Source> {
    let id: String = row.try_get("id")?;
    let config: String = row.try_get("config")?;
    let status: Option<String> = row.try_get("status")?;

    Ok(Source {
        id: parse_uuid(&id)?,
        source_type: row.try_get("type")?,
        config: parse_json(&config),
        external_id: row.try_get("external_id")?,
        last_run_at: row.try_get("last_run_at")?,
        last_success_at: row.try_get("last_success_at")?,
        last_error: row.try_get("last_error")?,
        status: SourceStatus::parse(status.as_deref().unwrap_or_default()),
        created_at: row.try_get("created_at")?,
    })
}

fn article_from_row(row: &SqliteRow) -> Result<Article> {
    let id: String = row.try_get("id")?;
    let source_id: String = row.try_get("source_id")?;
    let metadata: String = row.try_get("metadata")?;

    Ok(Article {
        id: parse_uuid(&id)?,
        source_id: parse_uuid(&source_id)?,
        external_id: row.try_get("external_id")?,
        title: row.try_get("title")?,
        author: row.try_get("author")?,
        content: row.try_get("content")?,
        url: row.try_get("url")?,
        written_at: row.try_get("written_at")?,
        metadata: parse_json(&metadata),
        created_at: row.try_get("created_at")?,
    })
}

fn comment_from_row(row: &SqliteRow) -> Result<Comment> {
    let id: String = row.try_get("id")?;
    let article_id: String = row.try_get("article_id")?;
    let parent_id: Option<String> = row.try_get("parent_id")?;
    let depth: i64 = row.try_get("depth")?;

    Ok(Comment {
        id: parse_uuid(&id)?,
        article_id: parse_uuid(&article_id)?,
        external_id: row.try_get("external_id")?,
        author: row.try_get("author")?,
        content: row.try_get("content")?,
        written_at: row.try_get("written_at")?,
        parent_id: parent_id.as_deref().map(parse_uuid).transpose()?,
        depth: u32::try_from(depth).unwrap_or_default(),
    })
}
