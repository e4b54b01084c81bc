//! Comment entity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One node of a flattened comment tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub article_id: Uuid,
    pub external_id: String,
    pub author: String,
    pub content: String,
    pub written_at: DateTime<Utc>,

    /// `None` iff `depth == 0`
    pub parent_id: Option<Uuid>,

    pub depth: u32,
}

impl Comment {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}
