//! Article entity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A normalised post, story or paper
///
/// `(source_id, external_id)` is the natural key. On re-ingestion every
/// field except `id` and `created_at` is overwritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: Uuid,
    pub source_id: Uuid,
    pub external_id: String,
    pub title: String,
    pub author: String,
    pub content: String,
    pub url: String,
    pub written_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
