//! Hacker News comment trees
//!
//! Two strategies, both all-or-nothing per story:
//!
//! 1. Scrape the item page. One request returns the whole thread as a flat,
//!    DFS-ordered list of rows whose indent encodes depth. The page is
//!    checked for layout drift and pagination before anything is trusted.
//! 2. Walk the API breadth-first, one request per comment. Slow but
//!    structurally safe, so it is the fallback.

use super::HnItem;
use crate::http::{Request, UpstreamClient};
use chrono::{DateTime, NaiveDateTime, Utc};
use newsloom_common::db::models::Comment;
use newsloom_common::errors::{AppError, Result};
use regex_lite::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// HN indents each level with a spacer image this many pixels wide
const INDENT_PX: u32 = 40;

/// Parsed rows below this share of the rendered rows are logged as suspicious
const MIN_PARSE_RATIO: f64 = 0.8;

const SKIPPED_BODIES: [&str; 3] = ["[dead]", "[flagged]", "[deleted]"];

/// Bounds applied to one story's comment tree
#[derive(Debug, Clone, Copy)]
pub struct CommentLimits {
    /// Deepest level kept, inclusive
    pub max_depth: u32,
    pub max_per_article: usize,
}

/// One comment row lifted from the item page
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapedComment {
    pub external_id: String,
    pub author: String,
    pub text_html: String,
    pub depth: u32,
    pub written_at: DateTime<Utc>,
}

struct Selectors {
    comment_row: Selector,
    indent: Selector,
    indent_img: Selector,
    author: Selector,
    age: Selector,
    body: Selector,
    comment_form: Selector,
    more_link: Selector,
}

impl Selectors {
    fn new() -> Result<Self> {
        Ok(Self {
            comment_row: selector("tr.athing.comtr")?,
            indent: selector("td.ind")?,
            indent_img: selector("td.ind img")?,
            author: selector("a.hnuser")?,
            age: selector("span.age")?,
            body: selector("div.commtext")?,
            comment_form: selector("form[method='post'][action='comment']")?,
            more_link: selector("a.morelink")?,
        })
    }
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| AppError::Internal {
        message: format!("bad selector {css:?}: {e}"),
    })
}

// ============================================================================
// Strategy A: HTML
// ============================================================================

/// Turn a fetched item page into a comment tree, or fail with drift
pub fn comments_from_html(
    html: &str,
    story_id: u64,
    article_id: Uuid,
    limits: CommentLimits,
) -> Result<Vec<Comment>> {
    let selectors = Selectors::new()?;
    let doc = Html::parse_document(html);

    validate_structure(&doc, story_id, &selectors)?;

    let rendered_rows = doc.select(&selectors.comment_row).count();
    let scraped = parse_rows(&doc, &selectors);
    let comments = build_tree(&scraped, article_id, limits)?;

    if rendered_rows > 0 && scraped.is_empty() {
        return Err(AppError::drift(format!(
            "found {rendered_rows} comment rows but parsed 0"
        )));
    }
    if !scraped.is_empty() && comments.is_empty() {
        return Err(AppError::drift(format!(
            "parsed {} comments but built 0",
            scraped.len()
        )));
    }
    if rendered_rows > 0 && (scraped.len() as f64) < rendered_rows as f64 * MIN_PARSE_RATIO {
        warn!(
            story_id,
            rendered_rows,
            parsed = scraped.len(),
            "Significant comment loss while parsing item page"
        );
    }

    Ok(comments)
}

/// Check that the page still looks like a complete HN item page
pub fn validate_html_structure(html: &str, story_id: u64) -> Result<()> {
    let selectors = Selectors::new()?;
    validate_structure(&Html::parse_document(html), story_id, &selectors)
}

fn validate_structure(doc: &Html, story_id: u64, selectors: &Selectors) -> Result<()> {
    // Ids that start with a digit need the attribute form
    let story_row = selector(&format!("tr.athing[id=\"{story_id}\"]"))?;
    if doc.select(&story_row).next().is_none() {
        return Err(AppError::drift(format!("story row {story_id} not found")));
    }
    if doc.select(&selectors.comment_form).next().is_none() {
        return Err(AppError::drift("comment form not found"));
    }
    if doc.select(&selectors.more_link).next().is_some() {
        return Err(AppError::drift("thread is paginated"));
    }
    if let Some(first) = doc.select(&selectors.comment_row).next() {
        if first.select(&selectors.indent).next().is_none() {
            return Err(AppError::drift("comment row has no indent column"));
        }
        if first.select(&selectors.body).next().is_none() {
            return Err(AppError::drift("comment row has no commtext"));
        }
    }
    Ok(())
}

/// Parse every well-formed, live comment row in document order
pub fn parse_comment_rows(html: &str) -> Result<Vec<ScrapedComment>> {
    let selectors = Selectors::new()?;
    Ok(parse_rows(&Html::parse_document(html), &selectors))
}

fn parse_rows(doc: &Html, selectors: &Selectors) -> Vec<ScrapedComment> {
    doc.select(&selectors.comment_row)
        .filter_map(|row| parse_row(row, selectors))
        .collect()
}

fn parse_row(row: ElementRef<'_>, selectors: &Selectors) -> Option<ScrapedComment> {
    let external_id = row.value().attr("id").filter(|id| !id.is_empty())?;

    let depth = row
        .select(&selectors.indent_img)
        .next()
        .and_then(|img| img.value().attr("width"))
        .and_then(|w| w.trim().parse::<u32>().ok())?
        / INDENT_PX;

    let author: String = row.select(&selectors.author).next()?.text().collect();
    if author.is_empty() {
        return None;
    }

    let title = row.select(&selectors.age).next()?.value().attr("title")?;
    let Some(written_at) = parse_age_title(title) else {
        warn!(external_id, title, "Unparseable comment timestamp");
        return None;
    };

    let body = row.select(&selectors.body).next()?;
    let visible: String = body.text().collect();
    if SKIPPED_BODIES.contains(&visible.trim()) {
        return None;
    }
    let text_html = body.inner_html().trim().to_string();
    if text_html.is_empty() {
        return None;
    }

    Some(ScrapedComment {
        external_id: external_id.to_string(),
        author,
        text_html,
        depth,
        written_at,
    })
}

/// `span.age[title]` looks like "2025-11-22T21:50:13 1763848213"
fn parse_age_title(title: &str) -> Option<DateTime<Utc>> {
    let iso = Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}").ok()?;
    let prefix = iso.find(title.trim())?.as_str();
    NaiveDateTime::parse_from_str(prefix, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Rebuild parent links from a DFS-ordered flat list using a depth stack
///
/// `stack[d]` holds the id last emitted at depth `d`. Emitting at depth `d`
/// truncates the stack to `d` first, so a jump back up the tree can never
/// attach to a stale deeper entry.
pub fn build_tree(
    scraped: &[ScrapedComment],
    article_id: Uuid,
    limits: CommentLimits,
) -> Result<Vec<Comment>> {
    let mut comments: Vec<Comment> = Vec::new();
    let mut stack: Vec<Uuid> = Vec::new();

    for row in scraped {
        if comments.len() >= limits.max_per_article {
            break;
        }
        if row.depth > limits.max_depth {
            continue;
        }

        let depth = row.depth as usize;
        let parent_id = if depth == 0 {
            None
        } else {
            match stack.get(depth - 1) {
                Some(parent) => Some(*parent),
                None => {
                    return Err(AppError::drift(format!(
                        "orphaned comment at depth {} (external_id={}): parent at depth {} not found",
                        row.depth,
                        row.external_id,
                        row.depth - 1
                    )));
                }
            }
        };

        let id = Uuid::new_v4();
        stack.truncate(depth);
        stack.push(id);

        comments.push(Comment {
            id,
            article_id,
            external_id: row.external_id.clone(),
            author: row.author.clone(),
            content: row.text_html.clone(),
            written_at: row.written_at,
            parent_id,
            depth: row.depth,
        });
    }

    Ok(comments)
}

// ============================================================================
// Strategy B: API breadth-first walk
// ============================================================================

/// Fetch a story's comments item by item, level by level
///
/// Null, deleted, dead and non-comment items are skipped together with
/// their subtrees. Any other failure abandons the whole walk.
pub async fn comments_from_api(
    client: &UpstreamClient,
    cancel: &CancellationToken,
    api_base: &str,
    root_kids: &[u64],
    article_id: Uuid,
    limits: CommentLimits,
) -> Result<Vec<Comment>> {
    let mut comments: Vec<Comment> = Vec::new();
    let mut queue: VecDeque<(u64, Option<Uuid>, u32)> =
        root_kids.iter().map(|id| (*id, None, 0)).collect();

    while let Some((hn_id, parent_id, depth)) = queue.pop_front() {
        if comments.len() >= limits.max_per_article {
            break;
        }
        if depth > limits.max_depth {
            continue;
        }

        let Some(item) = fetch_item(client, cancel, api_base, hn_id).await? else {
            continue;
        };
        if item.deleted || item.dead || item.item_type.as_deref() != Some("comment") {
            continue;
        }

        let id = Uuid::new_v4();
        comments.push(Comment {
            id,
            article_id,
            external_id: item.id.to_string(),
            author: item.by.unwrap_or_default(),
            content: item.text.unwrap_or_default(),
            written_at: crate::fetcher::unix_time(item.time),
            parent_id,
            depth,
        });

        if depth < limits.max_depth {
            queue.extend(item.kids.iter().map(|kid| (*kid, Some(id), depth + 1)));
        }
    }

    debug!(count = comments.len(), "API comment walk complete");
    Ok(comments)
}

/// `GET /v0/item/{id}.json`; the API answers `null` for unknown ids
pub(crate) async fn fetch_item(
    client: &UpstreamClient,
    cancel: &CancellationToken,
    api_base: &str,
    id: u64,
) -> Result<Option<HnItem>> {
    let request = Request::get(format!("{api_base}/v0/item/{id}.json"));
    client.get_json(cancel, &request).await
}
