//! Transactional write handle for one source's fetch results

use crate::db::models::{Article, Comment};
use crate::db::repository::parse_uuid;
use crate::errors::Result;
use sqlx::{Sqlite, Transaction};
use std::collections::HashMap;
use uuid::Uuid;

/// All articles and comments of one source run, committed or discarded together
///
/// Fetchers mint fresh ids on every run. When a row already exists under
/// its natural key the stored id wins, and later comment rows in the same
/// transaction are rewritten to point at the stored ids. Dropping the
/// handle without `commit` rolls back.
pub struct WriteTx {
    tx: Transaction<'static, Sqlite>,
    article_ids: HashMap<Uuid, Uuid>,
    comment_ids: HashMap<Uuid, Uuid>,
}

impl WriteTx {
    pub(crate) fn new(tx: Transaction<'static, Sqlite>) -> Self {
        Self {
            tx,
            article_ids: HashMap::new(),
            comment_ids: HashMap::new(),
        }
    }

    /// UPSERT keyed on `(source_id, external_id)`
    pub async fn upsert_articles(&mut self, articles: &[Article]) -> Result<usize> {
        for article in articles {
            let metadata = serde_json::to_string(&article.metadata)?;
            let stored: String = sqlx::query_scalar(
                r#"
                INSERT INTO articles
                    (id, source_id, external_id, title, author, content, url, written_at, metadata, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(source_id, external_id) DO UPDATE SET
                    title = excluded.title,
                    author = excluded.author,
                    content = excluded.content,
                    url = excluded.url,
                    written_at = excluded.written_at,
                    metadata = excluded.metadata
                RETURNING id
                "#,
            )
            .bind(article.id.to_string())
            .bind(article.source_id.to_string())
            .bind(&article.external_id)
            .bind(&article.title)
            .bind(&article.author)
            .bind(&article.content)
            .bind(&article.url)
            .bind(article.written_at)
            .bind(metadata)
            .bind(article.created_at)
            .fetch_one(&mut *self.tx)
            .await?;

            self.article_ids.insert(article.id, parse_uuid(&stored)?);
        }
        Ok(articles.len())
    }

    /// UPSERT keyed on `(article_id, external_id)`
    ///
    /// Parents must come before their children in `comments`.
    pub async fn upsert_comments(&mut self, comments: &[Comment]) -> Result<usize> {
        for comment in comments {
            let article_id = self
                .article_ids
                .get(&comment.article_id)
                .copied()
                .unwrap_or(comment.article_id);
            let parent_id = comment
                .parent_id
                .map(|p| self.comment_ids.get(&p).copied().unwrap_or(p));

            let stored: String = sqlx::query_scalar(
                r#"
                INSERT INTO comments
                    (id, article_id, external_id, author, content, written_at, parent_id, depth)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(article_id, external_id) DO UPDATE SET
                    author = excluded.author,
                    content = excluded.content,
                    written_at = excluded.written_at,
                    parent_id = excluded.parent_id,
                    depth = excluded.depth
                RETURNING id
                "#,
            )
            .bind(comment.id.to_string())
            .bind(article_id.to_string())
            .bind(&comment.external_id)
            .bind(&comment.author)
            .bind(&comment.content)
            .bind(comment.written_at)
            .bind(parent_id.map(|p| p.to_string()))
            .bind(i64::from(comment.depth))
            .fetch_one(&mut *self.tx)
            .await?;

            self.comment_ids.insert(comment.id, parse_uuid(&stored)?);
        }
        Ok(comments.len())
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
