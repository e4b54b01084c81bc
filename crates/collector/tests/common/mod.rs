//! Shared helpers for collector integration tests

#![allow(dead_code)]

use axum::Router;
use newsloom_collector::{FetcherDeps, Scheduler, SchedulerSettings};
use newsloom_common::config::{AppConfig, EndpointsConfig};
use newsloom_common::db::models::{NewSource, Source, SourceStatus, SourceType};
use newsloom_common::{DbPool, Repository};
use serde_json::Value;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

/// A throwaway database plus a config pointing every upstream at one mock
pub struct TestEnv {
    pub config: AppConfig,
    pub repo: Repository,
    _dir: TempDir,
}

impl TestEnv {
    pub async fn new(base_url: &str) -> Self {
        Self::with_config(base_url, |_| {}).await
    }

    pub async fn with_config(base_url: &str, customize: impl FnOnce(&mut AppConfig)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");

        let mut config = AppConfig::default();
        config.database.path = dir
            .path()
            .join("collector.db")
            .to_string_lossy()
            .into_owned();
        config.rate_limits.reddit_delay_ms = 0;
        config.rate_limits.hackernews_delay_ms = 0;
        config.rate_limits.semantic_scholar_delay_ms = 0;
        config.http.timeout_secs = 5;
        config.http.initial_backoff_ms = 10;
        config.http.max_retry_elapsed_secs = 2;
        config.server.source_timeout_secs = 30;
        config.endpoints = EndpointsConfig {
            reddit_base: base_url.to_string(),
            hackernews_api: base_url.to_string(),
            hackernews_web: base_url.to_string(),
            semantic_scholar_api: base_url.to_string(),
        };
        customize(&mut config);

        let pool = DbPool::new(&config.database).await.expect("open database");
        Self {
            config,
            repo: Repository::new(pool),
            _dir: dir,
        }
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.repo.clone(),
            FetcherDeps::from_config(&self.config).expect("fetcher deps"),
            SchedulerSettings::from_config(&self.config),
        )
    }

    pub async fn add_source(&self, source_type: SourceType, external_id: &str, config: Value) -> Source {
        self.repo
            .create_source(&NewSource {
                source_type,
                external_id: external_id.to_string(),
                config,
            })
            .await
            .expect("create source")
    }

    pub async fn source(&self, id: Uuid) -> Source {
        self.repo
            .get_source(id)
            .await
            .expect("get source")
            .expect("source exists")
    }

    /// Poll until the source reports `status` or the deadline passes
    pub async fn wait_for_status(&self, id: Uuid, status: SourceStatus, deadline: Duration) -> bool {
        let start = tokio::time::Instant::now();
        while start.elapsed() < deadline {
            if self.source(id).await.status == status {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

/// Serve `app` on an ephemeral port and return its base URL
pub async fn spawn_server(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let address = listener.local_addr().expect("local addr should exist");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server should run");
    });
    format!("http://{address}")
}
