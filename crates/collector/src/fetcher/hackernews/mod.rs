//! Hacker News story fetcher
//!
//! Stories come from the Firebase API. Comments go through the hybrid
//! ingester in [`comments`]: scrape the item page first, walk the API when
//! the page cannot be trusted.

pub mod comments;

use super::{check, decode_config, unix_time, FetchBatch, Fetcher, FetcherDeps};
use crate::http::{Request, UpstreamClient};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use comments::{comments_from_api, comments_from_html, fetch_item, CommentLimits};
use newsloom_common::db::models::{Article, Comment, Source, SourceType};
use newsloom_common::errors::Result;
use newsloom_common::metrics::record_hn_strategy;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

const HN_ITEM_URL: &str = "https://news.ycombinator.com/item?id=";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    #[default]
    Top,
    New,
    Best,
    Ask,
    Show,
    Job,
}

impl ItemType {
    fn as_str(&self) -> &'static str {
        match self {
            ItemType::Top => "top",
            ItemType::New => "new",
            ItemType::Best => "best",
            ItemType::Ask => "ask",
            ItemType::Show => "show",
            ItemType::Job => "job",
        }
    }
}

fn default_limit() -> usize {
    30
}

fn default_max_depth() -> u32 {
    3
}

fn default_max_comments() -> usize {
    100
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct HackerNewsConfig {
    #[serde(default)]
    pub item_type: ItemType,

    #[serde(default = "default_limit")]
    #[validate(range(min = 1, max = 100, message = "limit must be between 1 and 100"))]
    pub limit: usize,

    #[serde(default)]
    pub min_score: i64,

    #[serde(default)]
    pub min_comments: i64,

    #[serde(default)]
    pub include_comments: bool,

    #[serde(default = "default_max_depth")]
    #[validate(range(max = 10, message = "max_comment_depth must be at most 10"))]
    pub max_comment_depth: u32,

    #[serde(default = "default_max_comments")]
    #[validate(range(min = 1, max = 500, message = "max_comments_per_article must be between 1 and 500"))]
    pub max_comments_per_article: usize,

    /// Skip the HTML path entirely
    #[serde(default)]
    pub force_api_mode: bool,
}

/// One item from `/v0/item/{id}.json`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HnItem {
    pub id: u64,
    #[serde(default, rename = "type")]
    pub item_type: Option<String>,
    #[serde(default)]
    pub by: Option<String>,
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub descendants: i64,
    #[serde(default)]
    pub kids: Vec<u64>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub dead: bool,
}

pub struct HackerNewsFetcher {
    source_id: Uuid,
    config: HackerNewsConfig,
    client: UpstreamClient,
    api_base: String,
    web_base: String,
    global_max_depth: u32,
}

impl HackerNewsFetcher {
    pub fn new(source: &Source, deps: &FetcherDeps) -> Result<Self> {
        Ok(Self {
            source_id: source.id,
            config: decode_config(source)?,
            client: deps.upstream(SourceType::HackerNews),
            api_base: deps.endpoints.hackernews_api.trim_end_matches('/').to_string(),
            web_base: deps.endpoints.hackernews_web.trim_end_matches('/').to_string(),
            global_max_depth: deps.max_comment_depth,
        })
    }

    /// Comments are off when either knob says so
    fn comment_limits(&self) -> Option<CommentLimits> {
        if !self.config.include_comments || self.global_max_depth == 0 {
            return None;
        }
        Some(CommentLimits {
            max_depth: self.config.max_comment_depth.min(self.global_max_depth),
            max_per_article: self.config.max_comments_per_article,
        })
    }

    async fn story_ids(&self, cancel: &CancellationToken) -> Result<Vec<u64>> {
        let request = Request::get(format!(
            "{}/v0/{}stories.json",
            self.api_base,
            self.config.item_type.as_str()
        ));
        let ids: Option<Vec<u64>> = self.client.get_json(cancel, &request).await?;
        Ok(ids.unwrap_or_default())
    }

    /// HTML first, API on any failure. Errors from both paths leave the story
    /// without comments.
    async fn story_comments(
        &self,
        cancel: &CancellationToken,
        story: &HnItem,
        article_id: Uuid,
        limits: CommentLimits,
    ) -> Result<Vec<Comment>> {
        if !self.config.force_api_mode {
            match self.comments_via_html(cancel, story.id, article_id, limits).await {
                Ok(comments) => {
                    record_hn_strategy("html", true);
                    debug!(story_id = story.id, count = comments.len(), "Comments scraped from item page");
                    return Ok(comments);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    record_hn_strategy("html", false);
                    warn!(story_id = story.id, error = %e, "HTML comment scrape failed, falling back to API");
                }
            }
        }

        match comments_from_api(&self.client, cancel, &self.api_base, &story.kids, article_id, limits).await {
            Ok(comments) => {
                record_hn_strategy("api", true);
                Ok(comments)
            }
            Err(e) => {
                if !e.is_cancelled() {
                    record_hn_strategy("api", false);
                }
                Err(e)
            }
        }
    }

    async fn comments_via_html(
        &self,
        cancel: &CancellationToken,
        story_id: u64,
        article_id: Uuid,
        limits: CommentLimits,
    ) -> Result<Vec<Comment>> {
        let request = Request::get(format!("{}/item", self.web_base)).query("id", story_id);
        let html = self.client.get_text(cancel, &request).await?;
        // Html is !Send, keep the parse off any await point
        comments_from_html(&html, story_id, article_id, limits)
    }

    fn story_to_article(&self, story: &HnItem) -> Article {
        let url = story
            .url
            .clone()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| format!("{HN_ITEM_URL}{}", story.id));

        Article {
            id: Uuid::new_v4(),
            source_id: self.source_id,
            external_id: story.id.to_string(),
            title: story.title.clone().unwrap_or_default(),
            author: story.by.clone().unwrap_or_default(),
            content: story.text.clone().unwrap_or_default(),
            url,
            written_at: unix_time(story.time),
            metadata: json!({
                "hn_id": story.id,
                "hn_type": story.item_type.clone().unwrap_or_default(),
                "descendants": story.descendants,
                "score": story.score,
                "by": story.by.clone().unwrap_or_default(),
            }),
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
impl Fetcher for HackerNewsFetcher {
    fn source_type(&self) -> SourceType {
        SourceType::HackerNews
    }

    fn validate(&self) -> Result<()> {
        check(&self.config)
    }

    #[instrument(skip(self, cancel), fields(source_id = %self.source_id, item_type = self.config.item_type.as_str()))]
    async fn fetch(&self, cancel: &CancellationToken, since: DateTime<Utc>) -> Result<FetchBatch> {
        self.validate()?;

        let mut ids = self.story_ids(cancel).await?;
        ids.truncate(self.config.limit);
        let limits = self.comment_limits();
        let mut batch = FetchBatch::default();

        for id in ids {
            let story = match fetch_item(&self.client, cancel, &self.api_base, id).await {
                Ok(Some(item)) => item,
                Ok(None) => continue,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(story_id = id, error = %e, "Failed to fetch story, skipping");
                    continue;
                }
            };
            if story.deleted || story.dead {
                continue;
            }
            if !matches!(story.item_type.as_deref(), Some("story" | "job" | "poll")) {
                continue;
            }

            if unix_time(story.time) < since {
                // The "new" feed is chronological, nothing further down is newer
                if self.config.item_type == ItemType::New {
                    break;
                }
                continue;
            }
            if story.score < self.config.min_score || story.descendants < self.config.min_comments {
                continue;
            }

            let article = self.story_to_article(&story);
            if let Some(limits) = limits.filter(|_| !story.kids.is_empty()) {
                match self.story_comments(cancel, &story, article.id, limits).await {
                    Ok(comments) => batch.comments.extend(comments),
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => warn!(story_id = id, error = %e, "Both comment strategies failed, keeping story"),
                }
            }
            batch.articles.push(article);
        }

        info!(
            articles = batch.articles.len(),
            comments = batch.comments.len(),
            "Hacker News fetch complete"
        );
        Ok(batch)
    }
}
