//! Metrics for collection runs
//!
//! Names share the `newsloom_collector` prefix. Nothing is exported unless
//! the binary installs a recorder.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all collector metrics
pub const METRICS_PREFIX: &str = "newsloom_collector";

/// Buckets for one source run (seconds); runs are bounded by the source timeout
pub const SOURCE_RUN_BUCKETS: &[f64] = &[
    0.5,
    1.0,
    2.5,
    5.0,
    10.0,
    30.0,
    60.0,
    120.0,
    300.0,
];

/// Register all metric descriptions
pub fn register_metrics() {
    describe_counter!(
        format!("{}_ticks_total", METRICS_PREFIX),
        Unit::Count,
        "Collection ticks by outcome"
    );

    describe_gauge!(
        format!("{}_tick_running", METRICS_PREFIX),
        Unit::Count,
        "1 while a collection tick is in flight"
    );

    describe_counter!(
        format!("{}_source_runs_total", METRICS_PREFIX),
        Unit::Count,
        "Source runs by type and outcome"
    );

    describe_histogram!(
        format!("{}_source_run_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Wall time of one source run"
    );

    describe_counter!(
        format!("{}_articles_upserted_total", METRICS_PREFIX),
        Unit::Count,
        "Articles written by type"
    );

    describe_counter!(
        format!("{}_comments_upserted_total", METRICS_PREFIX),
        Unit::Count,
        "Comments written by type"
    );

    describe_counter!(
        format!("{}_upstream_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Outbound HTTP requests by type and status class"
    );

    describe_counter!(
        format!("{}_hn_comment_strategy_total", METRICS_PREFIX),
        Unit::Count,
        "HN comment ingestion by strategy and outcome"
    );

    tracing::info!("Metrics registered");
}

/// Times one source run and records its outcome
pub struct SourceRunMetrics {
    start: Instant,
    source_type: String,
}

impl SourceRunMetrics {
    pub fn start(source_type: &str) -> Self {
        Self {
            start: Instant::now(),
            source_type: source_type.to_string(),
        }
    }

    /// `outcome` is one of success, error, cancelled
    pub fn finish(self, outcome: &'static str) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_source_runs_total", METRICS_PREFIX),
            "type" => self.source_type.clone(),
            "outcome" => outcome
        )
        .increment(1);

        histogram!(
            format!("{}_source_run_duration_seconds", METRICS_PREFIX),
            "type" => self.source_type
        )
        .record(duration);
    }
}

pub fn record_tick(outcome: &'static str) {
    counter!(
        format!("{}_ticks_total", METRICS_PREFIX),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn set_tick_running(running: bool) {
    gauge!(format!("{}_tick_running", METRICS_PREFIX)).set(if running { 1.0 } else { 0.0 });
}

pub fn record_upserts(source_type: &str, articles: usize, comments: usize) {
    counter!(
        format!("{}_articles_upserted_total", METRICS_PREFIX),
        "type" => source_type.to_string()
    )
    .increment(articles as u64);

    counter!(
        format!("{}_comments_upserted_total", METRICS_PREFIX),
        "type" => source_type.to_string()
    )
    .increment(comments as u64);
}

/// `status` is the HTTP status, or 0 when no response arrived
pub fn record_upstream_request(source_type: &str, status: u16) {
    let class = match status {
        0 => "network",
        200..=299 => "2xx",
        429 => "429",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    };
    counter!(
        format!("{}_upstream_requests_total", METRICS_PREFIX),
        "type" => source_type.to_string(),
        "status" => class
    )
    .increment(1);
}

pub fn record_hn_strategy(strategy: &'static str, success: bool) {
    counter!(
        format!("{}_hn_comment_strategy_total", METRICS_PREFIX),
        "strategy" => strategy,
        "outcome" => if success { "success" } else { "failure" }
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_run_buckets_sorted() {
        let mut prev = 0.0;
        for &bucket in SOURCE_RUN_BUCKETS {
            assert!(bucket > prev);
            prev = bucket;
        }
        // Default source timeout must land in a bucket
        assert!(SOURCE_RUN_BUCKETS.contains(&300.0));
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        let run = SourceRunMetrics::start("reddit");
        run.finish("success");
        record_tick("completed");
        record_upstream_request("hackernews", 503);
        record_hn_strategy("html", false);
    }
}
