//! Outbound HTTP for fetchers
//!
//! Every attempt first takes a token from the type's shared bucket, so
//! retries are throttled exactly like first attempts. Transient failures
//! (network errors, timeouts, 5xx, 429) are retried with exponential
//! back-off; any other non-2xx is permanent.

use crate::ratelimit::SharedLimiter;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use newsloom_common::config::HttpConfig;
use newsloom_common::errors::{AppError, Result};
use newsloom_common::metrics::record_upstream_request;
use reqwest::header::{HeaderMap, RETRY_AFTER, USER_AGENT};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry budget for one logical request
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_elapsed: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &HttpConfig) -> Self {
        Self {
            initial_interval: Duration::from_millis(config.initial_backoff_ms),
            max_elapsed: Duration::from_secs(config.max_retry_elapsed_secs),
        }
    }

    fn backoff(&self) -> backoff::ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_elapsed_time(Some(self.max_elapsed))
            .build()
    }
}

/// Build the process-wide reqwest client
pub fn build_client(config: &HttpConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .user_agent(config.user_agent.clone())
        .build()
        .map_err(|e| AppError::Internal {
            message: format!("failed to build HTTP client: {e}"),
        })
}

/// A GET request description
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub url: String,
    pub query: Vec<(&'static str, String)>,
    pub headers: Vec<(&'static str, String)>,
    pub user_agent: Option<String>,
}

impl Request {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn query(mut self, key: &'static str, value: impl ToString) -> Self {
        self.query.push((key, value.to_string()));
        self
    }

    pub fn header(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((key, value.into()));
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }
}

/// Rate-limited, retrying HTTP client bound to one source type
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    limiter: Arc<SharedLimiter>,
    retry: RetryPolicy,
}

impl UpstreamClient {
    pub fn new(client: reqwest::Client, limiter: Arc<SharedLimiter>, retry: RetryPolicy) -> Self {
        Self {
            client,
            limiter,
            retry,
        }
    }

    /// GET and return the body as text
    pub async fn get_text(&self, cancel: &CancellationToken, request: &Request) -> Result<String> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AppError::Cancelled),
            result = self.get_with_retry(cancel, request) => result,
        }
    }

    /// GET and decode a JSON body
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        request: &Request,
    ) -> Result<T> {
        let body = self.get_text(cancel, request).await?;
        serde_json::from_str(&body).map_err(|e| {
            AppError::upstream(None, format!("failed to decode response from {}: {e}", request.url))
        })
    }

    async fn get_with_retry(&self, cancel: &CancellationToken, request: &Request) -> Result<String> {
        let mut backoff = self.retry.backoff();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.attempt(cancel, request).await {
                Ok(body) => return Ok(body),
                Err(err) if err.is_retryable() => {
                    let Some(interval) = backoff.next_backoff() else {
                        warn!(url = %request.url, attempt, error = %err, "Retry budget exhausted");
                        return Err(err);
                    };
                    let wait = err.retry_after().map_or(interval, |ra| ra.max(interval));
                    debug!(
                        url = %request.url,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "Transient upstream error, backing off"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt(&self, cancel: &CancellationToken, request: &Request) -> Result<String> {
        self.limiter.wait(cancel).await?;
        let source_type = self.limiter.source_type().as_str();

        let mut builder = self.client.get(&request.url).query(&request.query);
        for (key, value) in &request.headers {
            builder = builder.header(*key, value);
        }
        if let Some(agent) = &request.user_agent {
            builder = builder.header(USER_AGENT, agent);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                record_upstream_request(source_type, 0);
                return Err(classify_send_error(&request.url, e));
            }
        };

        let status = response.status();
        record_upstream_request(source_type, status.as_u16());

        if status.is_success() {
            return response
                .text()
                .await
                .map_err(|e| AppError::transient(format!("failed to read body from {}: {e}", request.url), None));
        }

        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(&request.url, status, retry_after, &body))
    }
}

fn classify_send_error(url: &str, err: reqwest::Error) -> AppError {
    if err.is_builder() {
        AppError::upstream(None, format!("invalid request to {url}: {err}"))
    } else {
        AppError::transient(format!("request to {url} failed: {err}"), None)
    }
}

fn classify_status(
    url: &str,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> AppError {
    let snippet: String = body.chars().take(200).collect();
    let message = format!("HTTP {} from {url}: {snippet}", status.as_u16());

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        AppError::transient(message, retry_after)
    } else {
        AppError::upstream(Some(status.as_u16()), message)
    }
}

/// Retry-After in its delta-seconds form
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
