//! Semantic Scholar search / recommendations fetcher

use super::{check, decode_config, FetchBatch, Fetcher, FetcherDeps};
use crate::http::{Request, UpstreamClient};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use newsloom_common::db::models::{Article, Source, SourceType};
use newsloom_common::errors::Result;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;
use validator::{Validate, ValidationError};

const PAGE_SIZE: usize = 100;
const OFFSET_CEILING: usize = 10_000;
const PAPER_FIELDS: &str = "paperId,title,abstract,year,citationCount,url,authors";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum S2Mode {
    Search,
    Recommendations,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_mode_fields"))]
pub struct SemanticScholarConfig {
    pub mode: S2Mode,

    #[serde(default)]
    pub query: Option<String>,

    #[serde(default)]
    pub paper_id: Option<String>,

    /// Passed through to the search API, e.g. "2019-2023"
    #[serde(default)]
    pub year: Option<String>,

    /// 0 falls back to 100
    #[serde(default)]
    #[validate(range(max = 10000, message = "max_results must be at most 10000"))]
    pub max_results: usize,

    #[serde(default)]
    pub min_citations: i64,
}

fn validate_mode_fields(config: &SemanticScholarConfig) -> std::result::Result<(), ValidationError> {
    let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
    match config.mode {
        S2Mode::Search if !present(&config.query) => {
            let mut err = ValidationError::new("query_required");
            err.message = Some("query is required for search mode".into());
            Err(err)
        }
        S2Mode::Recommendations if !present(&config.paper_id) => {
            let mut err = ValidationError::new("paper_id_required");
            err.message = Some("paper_id is required for recommendations mode".into());
            Err(err)
        }
        _ => Ok(()),
    }
}

impl SemanticScholarConfig {
    fn effective_max(&self) -> usize {
        if self.max_results == 0 {
            100
        } else {
            self.max_results
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    next: Option<u64>,
    #[serde(default)]
    data: Vec<Paper>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecommendationsResponse {
    #[serde(default)]
    recommended_papers: Vec<Paper>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Paper {
    paper_id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, rename = "abstract")]
    abstract_text: Option<String>,
    #[serde(default)]
    year: Option<i32>,
    #[serde(default)]
    citation_count: Option<i64>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    authors: Vec<Author>,
}

#[derive(Debug, Deserialize)]
struct Author {
    #[serde(default)]
    name: Option<String>,
}

pub struct SemanticScholarFetcher {
    source_id: Uuid,
    config: SemanticScholarConfig,
    client: UpstreamClient,
    base_url: String,
    api_key: Option<String>,
}

impl SemanticScholarFetcher {
    pub fn new(source: &Source, deps: &FetcherDeps) -> Result<Self> {
        Ok(Self {
            source_id: source.id,
            config: decode_config(source)?,
            client: deps.upstream(SourceType::SemanticScholar),
            base_url: deps
                .endpoints
                .semantic_scholar_api
                .trim_end_matches('/')
                .to_string(),
            api_key: deps
                .credentials
                .semantic_scholar_api_key
                .clone()
                .filter(|k| !k.is_empty()),
        })
    }

    fn authorize(&self, request: Request) -> Request {
        match &self.api_key {
            Some(key) => request.header("x-api-key", key.clone()),
            None => request,
        }
    }

    async fn search(&self, cancel: &CancellationToken, query: &str) -> Result<Vec<Paper>> {
        let max = self.config.effective_max();
        let mut papers: Vec<Paper> = Vec::new();
        let mut offset = 0usize;

        while papers.len() < max {
            let mut request = Request::get(format!("{}/graph/v1/paper/search", self.base_url))
                .query("query", query)
                .query("offset", offset)
                .query("limit", PAGE_SIZE)
                .query("fields", PAPER_FIELDS);
            if let Some(year) = self.config.year.as_deref().filter(|y| !y.is_empty()) {
                request = request.query("year", year);
            }

            let page: SearchResponse = self
                .client
                .get_json(cancel, &self.authorize(request))
                .await?;
            if page.data.is_empty() {
                break;
            }

            offset += page.data.len();
            papers.extend(page.data);
            debug!(offset, collected = papers.len(), "Search page fetched");

            if page.next.unwrap_or(0) == 0 || offset >= OFFSET_CEILING {
                break;
            }
        }

        papers.truncate(max);
        Ok(papers)
    }

    async fn recommendations(&self, cancel: &CancellationToken, paper_id: &str) -> Result<Vec<Paper>> {
        let request = Request::get(format!(
            "{}/recommendations/v1/papers/forpaper/{}",
            self.base_url, paper_id
        ))
        .query("fields", PAPER_FIELDS)
        .query("limit", self.config.effective_max());

        let response: RecommendationsResponse = self
            .client
            .get_json(cancel, &self.authorize(request))
            .await?;
        Ok(response.recommended_papers)
    }

    fn paper_to_article(&self, paper: Paper) -> Article {
        let authors: Vec<String> = paper.authors.into_iter().filter_map(|a| a.name).collect();
        let year = paper.year.filter(|y| *y > 0);

        Article {
            id: Uuid::new_v4(),
            source_id: self.source_id,
            external_id: paper.paper_id,
            title: paper.title.unwrap_or_default(),
            author: authors.first().cloned().unwrap_or_default(),
            content: paper.abstract_text.unwrap_or_default(),
            url: paper.url.unwrap_or_default(),
            written_at: year_start(year),
            metadata: json!({
                "citations": paper.citation_count.unwrap_or(0),
                "year": year.map(|y| y.to_string()).unwrap_or_default(),
                "authors": authors,
            }),
            created_at: Utc::now(),
        }
    }
}

/// Jan 1st of `year`, or the epoch when unknown
fn year_start(year: Option<i32>) -> DateTime<Utc> {
    year.and_then(|y| Utc.with_ymd_and_hms(y, 1, 1, 0, 0, 0).single())
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Papers only carry a year, so `since` is compared at year granularity
fn is_recent_enough(year: Option<i32>, since: DateTime<Utc>) -> bool {
    match year.filter(|y| *y > 0) {
        Some(y) => y >= since.year(),
        None => true,
    }
}

#[async_trait]
impl Fetcher for SemanticScholarFetcher {
    fn source_type(&self) -> SourceType {
        SourceType::SemanticScholar
    }

    fn validate(&self) -> Result<()> {
        check(&self.config)
    }

    #[instrument(skip(self, cancel), fields(source_id = %self.source_id, mode = ?self.config.mode))]
    async fn fetch(&self, cancel: &CancellationToken, since: DateTime<Utc>) -> Result<FetchBatch> {
        self.validate()?;

        if since > Utc::now() {
            debug!("since is in the future, nothing to fetch");
            return Ok(FetchBatch::default());
        }

        let papers = match self.config.mode {
            S2Mode::Search => {
                let query = self.config.query.as_deref().unwrap_or_default();
                self.search(cancel, query).await?
            }
            S2Mode::Recommendations => {
                let paper_id = self.config.paper_id.as_deref().unwrap_or_default();
                self.recommendations(cancel, paper_id).await?
            }
        };
        let fetched = papers.len();

        let articles: Vec<Article> = papers
            .into_iter()
            .filter(|p| p.citation_count.unwrap_or(0) >= self.config.min_citations)
            .filter(|p| is_recent_enough(p.year, since))
            .map(|p| self.paper_to_article(p))
            .collect();

        info!(fetched, kept = articles.len(), "Semantic Scholar fetch complete");
        Ok(FetchBatch {
            articles,
            comments: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_requires_query() {
        let config: SemanticScholarConfig = serde_json::from_value(json!({"mode": "search"})).unwrap();
        let err = check(&config).unwrap_err();
        assert!(err.to_string().contains("query is required"));
    }

    #[test]
    fn test_recommendations_requires_paper_id() {
        let config: SemanticScholarConfig =
            serde_json::from_value(json!({"mode": "recommendations", "query": "x"})).unwrap();
        assert!(check(&config).is_err());

        let config: SemanticScholarConfig =
            serde_json::from_value(json!({"mode": "recommendations", "paper_id": "abc"})).unwrap();
        assert!(check(&config).is_ok());
        assert_eq!(config.effective_max(), 100);
    }

    #[test]
    fn test_max_results_is_bounded() {
        let config: SemanticScholarConfig =
            serde_json::from_value(json!({"mode": "search", "query": "llm", "max_results": 10001})).unwrap();
        let err = check(&config).unwrap_err();
        assert!(err.to_string().contains("max_results must be at most 10000"));

        let config: SemanticScholarConfig =
            serde_json::from_value(json!({"mode": "search", "query": "llm", "max_results": 10000})).unwrap();
        assert!(check(&config).is_ok());
    }

    #[test]
    fn test_unknown_mode_fails_decode() {
        let result: std::result::Result<SemanticScholarConfig, _> =
            serde_json::from_value(json!({"mode": "browse"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_year_start() {
        assert_eq!(year_start(Some(2021)), Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(year_start(None), DateTime::UNIX_EPOCH);
    }

    #[test]
    fn test_is_recent_enough() {
        let since = Utc.with_ymd_and_hms(2022, 6, 1, 0, 0, 0).unwrap();
        assert!(is_recent_enough(Some(2022), since));
        assert!(is_recent_enough(Some(2024), since));
        assert!(!is_recent_enough(Some(2021), since));
        assert!(is_recent_enough(None, since));
        assert!(is_recent_enough(Some(1990), DateTime::UNIX_EPOCH));
    }
}
