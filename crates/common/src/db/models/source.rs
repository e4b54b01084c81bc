//! Source entity

use crate::errors::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Upstream families the collector knows how to fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Reddit,
    #[serde(rename = "hackernews")]
    HackerNews,
    SemanticScholar,
}

impl SourceType {
    pub const ALL: [SourceType; 3] = [
        SourceType::Reddit,
        SourceType::HackerNews,
        SourceType::SemanticScholar,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Reddit => "reddit",
            SourceType::HackerNews => "hackernews",
            SourceType::SemanticScholar => "semantic_scholar",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reddit" => Ok(SourceType::Reddit),
            "hackernews" => Ok(SourceType::HackerNews),
            "semantic_scholar" => Ok(SourceType::SemanticScholar),
            other => Err(AppError::config_invalid(format!(
                "unknown source type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Idle,
    Running,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Idle => "idle",
            SourceStatus::Running => "running",
        }
    }

    /// Anything other than `running` reads back as idle
    pub fn parse(raw: &str) -> Self {
        if raw == "running" {
            SourceStatus::Running
        } else {
            SourceStatus::Idle
        }
    }
}

/// An ingestion target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,

    /// Kept as the stored string; an unknown type fails only this source
    pub source_type: String,

    /// Opaque JSON interpreted by the matching fetcher
    pub config: serde_json::Value,

    pub external_id: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub status: SourceStatus,
    pub created_at: DateTime<Utc>,
}

impl Source {
    /// Lower bound for items worth fetching on the next run
    pub fn since(&self) -> DateTime<Utc> {
        self.last_success_at.unwrap_or(DateTime::UNIX_EPOCH)
    }

    pub fn has_error(&self) -> bool {
        self.last_error.as_deref().is_some_and(|e| !e.is_empty())
    }
}

/// Insert payload used by the CRUD side of the service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSource {
    pub source_type: SourceType,
    pub external_id: String,
    pub config: serde_json::Value,
}

/// Next firing of the global collection schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub source_id: String,
    pub source_type: String,
    pub next_run: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl ScheduleEntry {
    pub fn global(next_run: DateTime<Utc>, last_run_at: Option<DateTime<Utc>>) -> Self {
        Self {
            source_id: "global".to_string(),
            source_type: "all".to_string(),
            next_run,
            last_run_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_type_round_trip() {
        for ty in SourceType::ALL {
            assert_eq!(ty.as_str().parse::<SourceType>().unwrap(), ty);
        }
        assert!("mastodon".parse::<SourceType>().is_err());
    }

    #[test]
    fn test_source_type_serde_matches_column_value() {
        let json = serde_json::to_string(&SourceType::HackerNews).unwrap();
        assert_eq!(json, "\"hackernews\"");
        let json = serde_json::to_string(&SourceType::SemanticScholar).unwrap();
        assert_eq!(json, "\"semantic_scholar\"");
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(SourceStatus::parse("running"), SourceStatus::Running);
        assert_eq!(SourceStatus::parse("idle"), SourceStatus::Idle);
        assert_eq!(SourceStatus::parse(""), SourceStatus::Idle);
    }
}
