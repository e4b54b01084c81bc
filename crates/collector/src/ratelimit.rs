//! Per-type token buckets shared by every source of that type

use governor::{
    clock::QuantaClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use newsloom_common::config::RateLimitConfig;
use newsloom_common::db::models::SourceType;
use newsloom_common::errors::{AppError, Result};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Direct (unkeyed) token bucket
pub type TypeRateLimiter = RateLimiter<NotKeyed, InMemoryState, QuantaClock>;

/// Bucket for one source type. A zero delay means no limiting.
pub struct SharedLimiter {
    source_type: SourceType,
    limiter: Option<TypeRateLimiter>,
}

impl SharedLimiter {
    pub fn new(source_type: SourceType, delay: Duration, burst: u32) -> Self {
        let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        let limiter = Quota::with_period(delay)
            .map(|quota| RateLimiter::direct(quota.allow_burst(burst)));

        Self {
            source_type,
            limiter,
        }
    }

    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    /// Suspend until a token is available or `cancel` fires
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(limiter) = &self.limiter else {
            return if cancel.is_cancelled() {
                Err(AppError::Cancelled)
            } else {
                Ok(())
            };
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AppError::Cancelled),
            _ = limiter.until_ready() => Ok(()),
        }
    }
}

/// One long-lived limiter per source type, built once at startup
pub struct RateLimitRegistry {
    limiters: HashMap<SourceType, Arc<SharedLimiter>>,
}

impl RateLimitRegistry {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        let mut limiters = HashMap::new();
        for source_type in SourceType::ALL {
            let delay_ms = match source_type {
                SourceType::Reddit => config.reddit_delay_ms,
                SourceType::HackerNews => config.hackernews_delay_ms,
                SourceType::SemanticScholar => config.semantic_scholar_delay_ms,
            };
            info!(
                source_type = %source_type,
                delay_ms,
                burst = config.burst,
                "Rate limiter configured"
            );
            limiters.insert(
                source_type,
                Arc::new(SharedLimiter::new(
                    source_type,
                    Duration::from_millis(delay_ms),
                    config.burst,
                )),
            );
        }
        Self { limiters }
    }

    /// The shared bucket for `source_type`
    pub fn get(&self, source_type: SourceType) -> Arc<SharedLimiter> {
        match self.limiters.get(&source_type) {
            Some(limiter) => Arc::clone(limiter),
            // from_config covers every variant
            None => Arc::new(SharedLimiter::new(source_type, Duration::ZERO, 1)),
        }
    }
}
