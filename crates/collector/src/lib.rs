//! Newsloom Collector
//!
//! Periodically pulls posts and comment threads from Reddit, Hacker News and
//! Semantic Scholar and upserts them into the shared store:
//! - `scheduler`: cron ticks, per-type concurrency, per-source outcomes
//! - `fetcher`: one plugin per upstream behind a common trait
//! - `http`: rate-limited, retrying upstream client
//! - `ratelimit`: one token bucket per source type

pub mod fetcher;
pub mod http;
pub mod ratelimit;
pub mod scheduler;

pub use fetcher::{build_fetcher, FetchBatch, Fetcher, FetcherDeps};
pub use ratelimit::RateLimitRegistry;
pub use scheduler::{Scheduler, SchedulerSettings, SchedulerState, SourceOutcome, TickSummary};
