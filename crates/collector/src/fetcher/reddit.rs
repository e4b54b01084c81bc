//! Reddit listing + comment tree fetcher

use super::{check, decode_config, unix_time, FetchBatch, Fetcher, FetcherDeps};
use crate::http::{Request, UpstreamClient};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use newsloom_common::db::models::{Article, Comment, Source, SourceType};
use newsloom_common::errors::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use validator::{Validate, ValidationError};

const PAGE_SIZE: u32 = 100;
const REDDIT_WEB: &str = "https://www.reddit.com";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedditSort {
    #[default]
    Hot,
    New,
    Top,
    Rising,
}

impl RedditSort {
    fn as_str(&self) -> &'static str {
        match self {
            RedditSort::Hot => "hot",
            RedditSort::New => "new",
            RedditSort::Top => "top",
            RedditSort::Rising => "rising",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeFilter {
    Hour,
    Day,
    Week,
    Month,
    Year,
    All,
}

impl TimeFilter {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "hour" => Some(TimeFilter::Hour),
            "day" => Some(TimeFilter::Day),
            "week" => Some(TimeFilter::Week),
            "month" => Some(TimeFilter::Month),
            "year" => Some(TimeFilter::Year),
            "all" => Some(TimeFilter::All),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            TimeFilter::Hour => "hour",
            TimeFilter::Day => "day",
            TimeFilter::Week => "week",
            TimeFilter::Month => "month",
            TimeFilter::Year => "year",
            TimeFilter::All => "all",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_time_filter"))]
pub struct RedditConfig {
    #[serde(default)]
    #[validate(length(min = 1, message = "subreddit is required"))]
    pub subreddit: String,

    #[serde(default)]
    pub sort: RedditSort,

    /// Only read when `sort` is `top`, ignored otherwise
    #[serde(default)]
    pub time_filter: Option<String>,

    /// 0 falls back to 100
    #[serde(default)]
    pub limit: u32,

    #[serde(default)]
    pub min_score: i64,

    #[serde(default)]
    pub min_comments: i64,

    #[serde(default)]
    #[validate(length(min = 1, message = "user_agent is required"))]
    pub user_agent: String,
}

fn validate_time_filter(config: &RedditConfig) -> std::result::Result<(), ValidationError> {
    match config.time_filter.as_deref() {
        Some(value) if config.sort == RedditSort::Top && !value.is_empty() && TimeFilter::parse(value).is_none() => {
            let mut err = ValidationError::new("time_filter_invalid");
            err.message = Some(format!("unknown time_filter {value:?}").into());
            Err(err)
        }
        _ => Ok(()),
    }
}

impl RedditConfig {
    fn effective_time_filter(&self) -> Option<TimeFilter> {
        if self.sort != RedditSort::Top {
            return None;
        }
        self.time_filter.as_deref().and_then(TimeFilter::parse)
    }

    fn effective_limit(&self) -> u32 {
        if self.limit == 0 {
            100
        } else {
            self.limit
        }
    }
}

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<ListingChild>,
    #[serde(default)]
    after: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListingChild {
    data: RedditPost,
}

#[derive(Debug, Deserialize)]
struct RedditPost {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    selftext: String,
    #[serde(default)]
    author: String,
    #[serde(default)]
    created_utc: f64,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    num_comments: i64,
    #[serde(default)]
    permalink: String,
    #[serde(default)]
    subreddit: String,
}

pub struct RedditFetcher {
    source_id: Uuid,
    config: RedditConfig,
    client: UpstreamClient,
    base_url: String,
    max_comment_depth: u32,
}

impl RedditFetcher {
    pub fn new(source: &Source, deps: &FetcherDeps) -> Result<Self> {
        // Listings are read anonymously; the OAuth credentials stay unused for now
        Ok(Self {
            source_id: source.id,
            config: decode_config(source)?,
            client: deps.upstream(SourceType::Reddit),
            base_url: deps.endpoints.reddit_base.trim_end_matches('/').to_string(),
            max_comment_depth: deps.max_comment_depth,
        })
    }

    async fn fetch_page(
        &self,
        cancel: &CancellationToken,
        after: Option<&str>,
        limit: u32,
    ) -> Result<ListingData> {
        let mut request = Request::get(format!(
            "{}/r/{}/{}.json",
            self.base_url,
            self.config.subreddit,
            self.config.sort.as_str()
        ))
        .query("limit", limit)
        .user_agent(&self.config.user_agent);

        if let Some(after) = after {
            request = request.query("after", after);
        }
        if let Some(filter) = self.config.effective_time_filter() {
            request = request.query("t", filter.as_str());
        }

        let listing: Listing = self.client.get_json(cancel, &request).await?;
        Ok(listing.data)
    }

    async fn fetch_comments(
        &self,
        cancel: &CancellationToken,
        post_id: &str,
        article_id: Uuid,
    ) -> Result<Vec<Comment>> {
        let request = Request::get(format!("{}/comments/{}.json", self.base_url, post_id))
            .user_agent(&self.config.user_agent);
        let response: Value = self.client.get_json(cancel, &request).await?;

        // [post listing, comment listing]
        let mut comments = Vec::new();
        if let Some(listing) = response.as_array().and_then(|parts| parts.get(1)) {
            collect_comments(listing, article_id, None, 0, self.max_comment_depth, &mut comments);
        }
        Ok(comments)
    }

    fn post_to_article(&self, post: &RedditPost) -> Article {
        Article {
            id: Uuid::new_v4(),
            source_id: self.source_id,
            external_id: post.id.clone(),
            title: post.title.clone(),
            author: post.author.clone(),
            content: post.selftext.clone(),
            url: format!("{REDDIT_WEB}{}", post.permalink),
            written_at: unix_time(post.created_utc as i64),
            metadata: json!({
                "score": post.score,
                "num_comments": post.num_comments,
                "subreddit": post.subreddit,
            }),
            created_at: Utc::now(),
        }
    }
}

/// Walk a comment listing depth-first, keeping only `t1` entries up to `max_depth`
fn collect_comments(
    listing: &Value,
    article_id: Uuid,
    parent_id: Option<Uuid>,
    depth: u32,
    max_depth: u32,
    out: &mut Vec<Comment>,
) {
    if depth > max_depth {
        return;
    }
    let Some(children) = listing
        .pointer("/data/children")
        .and_then(Value::as_array)
    else {
        return;
    };

    for child in children {
        if child.get("kind").and_then(Value::as_str) != Some("t1") {
            continue;
        }
        let Some(data) = child.get("data") else {
            continue;
        };
        let id = data.get("id").and_then(Value::as_str).unwrap_or_default();
        let body = data.get("body").and_then(Value::as_str).unwrap_or_default();
        if id.is_empty() || body.is_empty() {
            continue;
        }

        let comment = Comment {
            id: Uuid::new_v4(),
            article_id,
            external_id: id.to_string(),
            author: data
                .get("author")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            content: body.to_string(),
            written_at: unix_time(
                data.get("created_utc")
                    .and_then(Value::as_f64)
                    .unwrap_or_default() as i64,
            ),
            parent_id,
            depth,
        };
        let comment_id = comment.id;
        out.push(comment);

        // "replies" is an empty string when there are none
        if let Some(replies) = data.get("replies").filter(|r| r.is_object()) {
            collect_comments(replies, article_id, Some(comment_id), depth + 1, max_depth, out);
        }
    }
}

#[async_trait]
impl Fetcher for RedditFetcher {
    fn source_type(&self) -> SourceType {
        SourceType::Reddit
    }

    fn validate(&self) -> Result<()> {
        check(&self.config)
    }

    #[instrument(skip(self, cancel), fields(source_id = %self.source_id, subreddit = %self.config.subreddit))]
    async fn fetch(&self, cancel: &CancellationToken, since: DateTime<Utc>) -> Result<FetchBatch> {
        self.validate()?;

        let mut batch = FetchBatch::default();
        let mut remaining = self.config.effective_limit();
        let mut after: Option<String> = None;

        while remaining > 0 {
            let page = self
                .fetch_page(cancel, after.as_deref(), remaining.min(PAGE_SIZE))
                .await?;
            if page.children.is_empty() {
                break;
            }
            let page_len = page.children.len() as u32;

            for child in &page.children {
                let post = &child.data;
                if unix_time(post.created_utc as i64) < since {
                    continue;
                }
                if post.score < self.config.min_score || post.num_comments < self.config.min_comments {
                    continue;
                }

                let article = self.post_to_article(post);
                if self.max_comment_depth > 0 && post.num_comments > 0 {
                    match self.fetch_comments(cancel, &post.id, article.id).await {
                        Ok(comments) => batch.comments.extend(comments),
                        Err(e) if e.is_cancelled() => return Err(e),
                        Err(e) => warn!(post_id = %post.id, error = %e, "Failed to fetch comments, keeping post"),
                    }
                }
                batch.articles.push(article);
            }

            remaining = remaining.saturating_sub(page_len);
            after = page.after.filter(|a| !a.is_empty());
            if after.is_none() {
                break;
            }
            debug!(remaining, "Fetching next listing page");
        }

        info!(
            articles = batch.articles.len(),
            comments = batch.comments.len(),
            "Reddit fetch complete"
        );
        Ok(batch)
    }
}
