//! Fetcher plugin contract and factory
//!
//! A fetcher turns one `Source` into a batch of articles and comments.
//! Each implementation decodes its own slice of `Source.config`; the
//! scheduler never looks inside it.

pub mod hackernews;
pub mod reddit;
pub mod semantic_scholar;

use crate::http::{build_client, RetryPolicy, UpstreamClient};
use crate::ratelimit::RateLimitRegistry;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use newsloom_common::config::{AppConfig, Credentials, EndpointsConfig};
use newsloom_common::db::models::{Article, Comment, Source, SourceType};
use newsloom_common::errors::{AppError, Result};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use validator::Validate;

pub use hackernews::HackerNewsFetcher;
pub use reddit::RedditFetcher;
pub use semantic_scholar::SemanticScholarFetcher;

/// Everything one source run produced
#[derive(Debug, Default, Clone)]
pub struct FetchBatch {
    pub articles: Vec<Article>,
    pub comments: Vec<Comment>,
}

impl FetchBatch {
    pub fn is_empty(&self) -> bool {
        self.articles.is_empty() && self.comments.is_empty()
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    fn source_type(&self) -> SourceType;

    /// Check the decoded config. Runs before any network call.
    fn validate(&self) -> Result<()>;

    /// Fetch items newer than `since`. Output is complete or an error.
    async fn fetch(&self, cancel: &CancellationToken, since: DateTime<Utc>) -> Result<FetchBatch>;
}

/// Shared collaborators handed to every fetcher
#[derive(Clone)]
pub struct FetcherDeps {
    pub http: reqwest::Client,
    pub limiters: Arc<RateLimitRegistry>,
    pub retry: RetryPolicy,
    pub credentials: Arc<Credentials>,
    pub endpoints: Arc<EndpointsConfig>,
    pub max_comment_depth: u32,
}

impl FetcherDeps {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            http: build_client(&config.http)?,
            limiters: Arc::new(RateLimitRegistry::from_config(&config.rate_limits)),
            retry: RetryPolicy::from_config(&config.http),
            credentials: Arc::new(config.credentials.clone()),
            endpoints: Arc::new(config.endpoints.clone()),
            max_comment_depth: config.server.max_comment_depth,
        })
    }

    /// HTTP client throttled by the shared bucket of `source_type`
    pub fn upstream(&self, source_type: SourceType) -> UpstreamClient {
        UpstreamClient::new(self.http.clone(), self.limiters.get(source_type), self.retry)
    }
}

/// Build the fetcher matching `source.source_type` and validate its config
pub fn build_fetcher(source: &Source, deps: &FetcherDeps) -> Result<Box<dyn Fetcher>> {
    let source_type: SourceType = source.source_type.parse()?;
    let fetcher: Box<dyn Fetcher> = match source_type {
        SourceType::Reddit => Box::new(RedditFetcher::new(source, deps)?),
        SourceType::HackerNews => Box::new(HackerNewsFetcher::new(source, deps)?),
        SourceType::SemanticScholar => Box::new(SemanticScholarFetcher::new(source, deps)?),
    };
    fetcher.validate()?;
    Ok(fetcher)
}

/// Decode a fetcher's config blob; any mismatch is `ConfigInvalid`
pub(crate) fn decode_config<T: DeserializeOwned>(source: &Source) -> Result<T> {
    serde_json::from_value(source.config.clone()).map_err(|e| {
        AppError::config_invalid(format!("{} config: {e}", source.source_type))
    })
}

pub(crate) fn check<T: Validate>(config: &T) -> Result<()> {
    config
        .validate()
        .map_err(|e| AppError::config_invalid(e.to_string()))
}

/// Unix seconds to UTC, clamping garbage to the epoch
pub(crate) fn unix_time(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use newsloom_common::db::models::SourceStatus;
    use serde_json::json;
    use uuid::Uuid;

    fn source(source_type: &str, config: serde_json::Value) -> Source {
        Source {
            id: Uuid::new_v4(),
            source_type: source_type.to_string(),
            config,
            external_id: Some("x".to_string()),
            last_run_at: None,
            last_success_at: None,
            last_error: None,
            status: SourceStatus::Idle,
            created_at: Utc::now(),
        }
    }

    fn deps() -> FetcherDeps {
        FetcherDeps::from_config(&AppConfig::default()).unwrap()
    }

    #[test]
    fn test_factory_dispatches_on_type() {
        let deps = deps();
        let reddit = source("reddit", json!({"subreddit": "rust", "user_agent": "t/1"}));
        assert_eq!(build_fetcher(&reddit, &deps).unwrap().source_type(), SourceType::Reddit);

        let hn = source("hackernews", json!({"item_type": "top"}));
        assert_eq!(build_fetcher(&hn, &deps).unwrap().source_type(), SourceType::HackerNews);

        let s2 = source("semantic_scholar", json!({"mode": "search", "query": "llm"}));
        assert_eq!(
            build_fetcher(&s2, &deps).unwrap().source_type(),
            SourceType::SemanticScholar
        );
    }

    #[test]
    fn test_factory_rejects_unknown_type() {
        let err = build_fetcher(&source("mastodon", json!({})), &deps()).err().unwrap();
        assert!(matches!(err, AppError::ConfigInvalid { .. }));
    }

    #[test]
    fn test_factory_rejects_malformed_config() {
        let err = build_fetcher(&source("reddit", json!("not an object")), &deps())
            .err()
            .unwrap();
        assert!(matches!(err, AppError::ConfigInvalid { .. }));
    }

    #[test]
    fn test_unix_time() {
        assert_eq!(unix_time(0), DateTime::UNIX_EPOCH);
        assert_eq!(unix_time(1_700_000_000).timestamp(), 1_700_000_000);
    }
}
