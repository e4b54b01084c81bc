//! End-to-end scheduler runs against a mock Reddit

mod common;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{Timelike, Utc};
use common::{spawn_server, TestEnv};
use newsloom_collector::SchedulerState;
use newsloom_common::db::models::{SourceStatus, SourceType};
use newsloom_common::errors::AppError;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_test::{assert_err, assert_ok};

#[derive(Clone, Default)]
struct RedditMock {
    listing_hits: Arc<AtomicUsize>,
    comment_hits: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
}

/// Far enough ahead that no `since` filter drops it
fn future_ts() -> f64 {
    (Utc::now().timestamp() + 3600) as f64
}

fn post(id: &str, subreddit: &str, num_comments: i64) -> Value {
    scored_post(id, subreddit, 10, num_comments)
}

fn scored_post(id: &str, subreddit: &str, score: i64, num_comments: i64) -> Value {
    json!({
        "kind": "t3",
        "data": {
            "id": id,
            "title": format!("Post {id}"),
            "selftext": "body",
            "author": "gopher",
            "created_utc": future_ts(),
            "score": score,
            "num_comments": num_comments,
            "permalink": format!("/r/{subreddit}/comments/{id}/"),
            "subreddit": subreddit
        }
    })
}

fn listing(children: Vec<Value>, after: Option<&str>) -> Value {
    json!({"kind": "Listing", "data": {"children": children, "after": after}})
}

fn comment(id: &str, body: &str, replies: Value) -> Value {
    json!({
        "kind": "t1",
        "data": {"id": id, "body": body, "author": "commenter", "created_utc": future_ts(), "replies": replies}
    })
}

async fn subreddit_listing(
    State(mock): State<RedditMock>,
    Path((subreddit, _sort)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    mock.listing_hits.fetch_add(1, Ordering::SeqCst);

    match subreddit.as_str() {
        "golang" => Json(listing(
            vec![post("p1", "golang", 2), post("p2", "golang", 0)],
            None,
        ))
        .into_response(),
        "paged" => {
            let body = if query.contains_key("after") {
                listing(vec![post("c", "paged", 0), post("d", "paged", 0)], None)
            } else {
                listing(vec![post("a", "paged", 0), post("b", "paged", 0)], Some("t3_b"))
            };
            Json(body).into_response()
        }
        "scored" => {
            let body = if query.contains_key("after") {
                listing(
                    vec![scored_post("s3", "scored", 80, 0), scored_post("s4", "scored", 60, 2)],
                    None,
                )
            } else {
                listing(
                    vec![scored_post("s1", "scored", 100, 3), scored_post("s2", "scored", 10, 5)],
                    Some("t3_s2"),
                )
            };
            Json(body).into_response()
        }
        "flaky" if mock.failing.load(Ordering::SeqCst) => {
            (StatusCode::NOT_FOUND, "no such subreddit").into_response()
        }
        "flaky" => Json(listing(vec![post("f1", "flaky", 0)], None)).into_response(),
        "slow" => {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Json(listing(vec![], None)).into_response()
        }
        _ => Json(listing(vec![], None)).into_response(),
    }
}

async fn post_comments(State(mock): State<RedditMock>, Path(_file): Path<String>) -> Json<Value> {
    mock.comment_hits.fetch_add(1, Ordering::SeqCst);
    let replies = listing(vec![comment("c2", "reply", json!(""))], None);
    Json(json!([
        listing(vec![post("p1", "golang", 2)], None),
        listing(
            vec![
                comment("c1", "root comment", replies),
                json!({"kind": "more", "data": {"id": "m1", "children": ["x"]}})
            ],
            None
        )
    ]))
}

async fn reddit_server(mock: RedditMock) -> String {
    let app = Router::new()
        .route("/r/{subreddit}/{sort}", get(subreddit_listing))
        .route("/comments/{file}", get(post_comments))
        .with_state(mock);
    spawn_server(app).await
}

fn reddit_config(subreddit: &str, limit: u32) -> Value {
    json!({"subreddit": subreddit, "limit": limit, "user_agent": "newsloom-test/1.0"})
}

#[tokio::test]
async fn test_reddit_run_upserts_articles_and_comments() {
    let mock = RedditMock::default();
    let env = TestEnv::new(&reddit_server(mock.clone()).await).await;
    let source = env
        .add_source(SourceType::Reddit, "golang", reddit_config("golang", 2))
        .await;

    let summary = env.scheduler().run_tick().await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.articles, 2);
    assert_eq!(summary.comments, 2);
    assert_eq!(mock.listing_hits.load(Ordering::SeqCst), 1);
    assert_eq!(mock.comment_hits.load(Ordering::SeqCst), 1);

    let articles = env.repo.list_articles(source.id).await.unwrap();
    assert_eq!(articles.len(), 2);
    let p1 = articles.iter().find(|a| a.external_id == "p1").unwrap();
    assert_eq!(p1.title, "Post p1");
    assert_eq!(p1.url, "https://www.reddit.com/r/golang/comments/p1/");
    assert_eq!(p1.metadata["subreddit"], "golang");

    let comments = env.repo.list_comments(p1.id).await.unwrap();
    assert_eq!(comments.len(), 2);
    assert_eq!(comments[0].external_id, "c1");
    assert!(comments[0].parent_id.is_none());
    assert_eq!(comments[1].parent_id, Some(comments[0].id));
    assert_eq!(comments[1].depth, 1);

    let stored = env.source(source.id).await;
    assert_eq!(stored.status, SourceStatus::Idle);
    assert!(stored.last_run_at.is_some());
    assert!(stored.last_success_at.is_some());
    assert!(stored.last_error.is_none());
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let env = TestEnv::new(&reddit_server(RedditMock::default()).await).await;
    let source = env
        .add_source(SourceType::Reddit, "golang", reddit_config("golang", 2))
        .await;
    let scheduler = env.scheduler();

    scheduler.run_tick().await.unwrap();
    let first = env.repo.list_articles(source.id).await.unwrap();
    scheduler.run_tick().await.unwrap();
    let second = env.repo.list_articles(source.id).await.unwrap();

    assert_eq!(env.repo.count_articles().await.unwrap(), 2);
    assert_eq!(env.repo.count_comments().await.unwrap(), 2);
    for article in &first {
        let again = second
            .iter()
            .find(|a| a.external_id == article.external_id)
            .unwrap();
        assert_eq!(again.id, article.id);
    }
}

#[tokio::test]
async fn test_sources_of_one_type_share_a_bucket() {
    let mock = RedditMock::default();
    let env = TestEnv::with_config(&reddit_server(mock.clone()).await, |config| {
        config.rate_limits.reddit_delay_ms = 200;
        config.rate_limits.burst = 1;
    })
    .await;
    env.add_source(SourceType::Reddit, "paged-a", reddit_config("paged", 4))
        .await;
    env.add_source(SourceType::Reddit, "paged-b", reddit_config("paged", 4))
        .await;

    let started = Instant::now();
    let summary = env.scheduler().run_tick().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.articles, 8);
    assert_eq!(mock.listing_hits.load(Ordering::SeqCst), 4);
    // Four requests through a one-token bucket refilling every 200ms
    assert!(elapsed >= Duration::from_millis(550), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn test_failure_is_recorded_and_cleared_by_next_success() {
    let mock = RedditMock::default();
    mock.failing.store(true, Ordering::SeqCst);
    let env = TestEnv::new(&reddit_server(mock.clone()).await).await;
    let source = env
        .add_source(SourceType::Reddit, "flaky", reddit_config("flaky", 10))
        .await;
    let scheduler = env.scheduler();

    let summary = scheduler.run_tick().await.unwrap();
    assert_eq!(summary.failed, 1);

    let stored = env.source(source.id).await;
    assert_eq!(stored.status, SourceStatus::Idle);
    assert!(stored.last_run_at.is_some());
    assert!(stored.last_success_at.is_none());
    assert!(stored.last_error.as_deref().unwrap().contains("404"));
    assert_eq!(env.repo.count_articles().await.unwrap(), 0);

    mock.failing.store(false, Ordering::SeqCst);
    let summary = scheduler.run_tick().await.unwrap();
    assert_eq!(summary.succeeded, 1);

    let stored = env.source(source.id).await;
    assert!(stored.last_error.is_none());
    assert!(stored.last_success_at.is_some());
    assert_eq!(env.repo.count_articles().await.unwrap(), 1);
}

#[tokio::test]
async fn test_invalid_config_fails_only_that_source() {
    let env = TestEnv::new(&reddit_server(RedditMock::default()).await).await;
    let broken = env
        .add_source(SourceType::Reddit, "broken", json!({"user_agent": "x"}))
        .await;
    let good = env
        .add_source(SourceType::Reddit, "golang", reddit_config("golang", 2))
        .await;

    let summary = env.scheduler().run_tick().await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, 1);

    let broken = env.source(broken.id).await;
    assert!(broken.last_error.unwrap().contains("subreddit is required"));
    assert!(env.source(good.id).await.last_error.is_none());
}

#[tokio::test]
async fn test_slow_source_times_out() {
    let env = TestEnv::with_config(&reddit_server(RedditMock::default()).await, |config| {
        config.server.source_timeout_secs = 1;
    })
    .await;
    let source = env
        .add_source(SourceType::Reddit, "slow", reddit_config("slow", 10))
        .await;

    let summary = env.scheduler().run_tick().await.unwrap();
    assert_eq!(summary.failed, 1);

    let stored = env.source(source.id).await;
    assert_eq!(stored.status, SourceStatus::Idle);
    assert!(stored.last_error.unwrap().contains("timed out after 1s"));
}

#[tokio::test]
async fn test_stop_cancels_in_flight_work() {
    let env = TestEnv::new(&reddit_server(RedditMock::default()).await).await;
    let source = env
        .add_source(SourceType::Reddit, "slow", reddit_config("slow", 10))
        .await;
    let scheduler = env.scheduler();

    scheduler.start().await.unwrap();
    scheduler.run_now().unwrap();
    assert!(
        env.wait_for_status(source.id, SourceStatus::Running, Duration::from_secs(5))
            .await
    );

    let started = Instant::now();
    scheduler.stop(Duration::from_secs(10)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
    assert!(!scheduler.is_running());

    let stored = env.source(source.id).await;
    assert_eq!(stored.status, SourceStatus::Idle);
    assert!(stored.last_error.is_none());
    assert!(stored.last_success_at.is_none());
}

#[tokio::test]
async fn test_overlapping_ticks_are_rejected() {
    let env = TestEnv::new(&reddit_server(RedditMock::default()).await).await;
    env.add_source(SourceType::Reddit, "slow", reddit_config("slow", 10))
        .await;
    let scheduler = env.scheduler();
    scheduler.start().await.unwrap();

    scheduler.run_now().unwrap();
    assert!(scheduler.is_running());
    assert!(matches!(scheduler.run_now(), Err(AppError::SchedulerOverlap)));
    assert!(matches!(
        scheduler.run_tick().await,
        Err(AppError::SchedulerOverlap)
    ));

    scheduler.stop(Duration::from_secs(10)).await.unwrap();
}

#[tokio::test]
async fn test_lifecycle_transitions() {
    let env = TestEnv::new(&reddit_server(RedditMock::default()).await).await;

    let scheduler = env.scheduler();
    assert_eq!(scheduler.state(), SchedulerState::Created);
    assert_ok!(scheduler.start().await);
    assert_eq!(scheduler.state(), SchedulerState::Started);
    assert!(matches!(
        scheduler.start().await,
        Err(AppError::Scheduler { .. })
    ));

    assert_ok!(scheduler.stop(Duration::from_secs(5)).await);
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
    assert_err!(scheduler.run_now());
    // Stopping twice is a no-op
    assert_ok!(scheduler.stop(Duration::from_secs(5)).await);

    let never_started = env.scheduler();
    assert_ok!(never_started.stop(Duration::from_secs(5)).await);
    assert_eq!(never_started.state(), SchedulerState::Stopped);
}

#[tokio::test]
async fn test_start_resets_sources_left_running() {
    let env = TestEnv::new(&reddit_server(RedditMock::default()).await).await;
    let source = env
        .add_source(SourceType::Reddit, "golang", reddit_config("golang", 2))
        .await;
    env.repo
        .update_source_status(source.id, SourceStatus::Running)
        .await
        .unwrap();

    let scheduler = env.scheduler();
    scheduler.start().await.unwrap();
    assert_eq!(env.source(source.id).await.status, SourceStatus::Idle);
    scheduler.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_get_schedule_follows_last_run() {
    let env = TestEnv::new(&reddit_server(RedditMock::default()).await).await;
    let scheduler = env.scheduler();

    let before = Utc::now();
    let entry = scheduler.get_schedule().await.unwrap();
    assert_eq!(entry.source_id, "global");
    assert!(entry.last_run_at.is_none());
    assert!(entry.next_run > before);
    assert_eq!(entry.next_run.minute(), 0);
    assert_eq!(entry.next_run.hour() % 6, 0);

    env.add_source(SourceType::Reddit, "golang", reddit_config("golang", 2))
        .await;
    scheduler.run_tick().await.unwrap();

    let entry = scheduler.get_schedule().await.unwrap();
    let last_run_at = entry.last_run_at.unwrap();
    assert!(entry.next_run > last_run_at);
}

#[tokio::test]
async fn test_reddit_score_and_comment_floors_apply_across_pages() {
    let mock = RedditMock::default();
    let env = TestEnv::new(&reddit_server(mock.clone()).await).await;
    let mut config = reddit_config("scored", 0);
    config["min_score"] = json!(50);
    config["min_comments"] = json!(1);
    let source = env.add_source(SourceType::Reddit, "scored", config).await;

    let summary = env.scheduler().run_tick().await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(mock.listing_hits.load(Ordering::SeqCst), 2);

    let mut ids: Vec<String> = env
        .repo
        .list_articles(source.id)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.external_id)
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["s1", "s4"]);
    // Comments are only requested for posts that passed the floors
    assert_eq!(mock.comment_hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_reddit_posts_older_than_last_success_are_skipped() {
    let mock = RedditMock::default();
    let env = TestEnv::new(&reddit_server(mock.clone()).await).await;
    let source = env
        .add_source(SourceType::Reddit, "golang", reddit_config("golang", 10))
        .await;
    // Listing posts are an hour ahead, the last success is a day ahead
    env.repo
        .record_success(source.id, Utc::now() + chrono::Duration::days(1))
        .await
        .unwrap();

    let summary = env.scheduler().run_tick().await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.articles, 0);
    assert_eq!(mock.listing_hits.load(Ordering::SeqCst), 1);
    assert_eq!(mock.comment_hits.load(Ordering::SeqCst), 0);
    assert!(env.repo.list_articles(source.id).await.unwrap().is_empty());
}
