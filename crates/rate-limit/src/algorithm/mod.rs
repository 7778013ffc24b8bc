//! Limiting algorithms.
//!
//! Every algorithm counts against keys below the identifier key handed to it,
//! `{prefix}:id:{identifier}`, usually with a bucket suffix. They hold no state of
//! their own: counters live in the store, or in the ephemeral cache for the cached
//! fixed window.

mod cached_fixed_window;
mod fixed_window;
mod multi_region;
mod sliding_window;
mod token_bucket;

use std::sync::Arc;

use config::AlgorithmConfig;
use tokio_util::task::TaskTracker;

pub use cached_fixed_window::CachedFixedWindow;
pub use fixed_window::FixedWindow;
pub use multi_region::{MultiRegionFixedWindow, MultiRegionSlidingWindow};
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

use crate::cache::EphemeralCache;
use crate::clock::Clock;
use crate::error::RateLimitError;
use crate::region::RegionCoordinator;
use crate::response::{RateLimitResponse, Remaining};
use crate::script::{RESET_KEYS, reset_pattern};
use crate::storage::Store;

/// Everything an algorithm may touch while deciding.
#[derive(Clone)]
pub struct Context {
    /// The primary store.
    pub store: Arc<dyn Store>,
    /// The limiter's ephemeral cache, if enabled.
    pub cache: Option<Arc<EphemeralCache>>,
    /// Source of the current time.
    pub clock: Arc<dyn Clock>,
    /// Tracks background work so the host can wait for it.
    pub tasks: TaskTracker,
}

/// A limiting algorithm.
#[async_trait::async_trait]
pub trait Algorithm: Send + Sync {
    /// Name of the algorithm as written in the configuration.
    fn name(&self) -> &'static str;

    /// The number of requests a fresh identifier may make.
    fn tokens(&self) -> u64;

    /// Whether the algorithm refuses to run without an ephemeral cache.
    fn requires_cache(&self) -> bool {
        false
    }

    /// Take `rate` tokens for `key`.
    async fn limit(&self, ctx: &Context, key: &str, rate: u64) -> Result<RateLimitResponse, RateLimitError>;

    /// Tokens left for `key`, without taking any.
    async fn get_remaining(&self, ctx: &Context, key: &str) -> Result<Remaining, RateLimitError>;

    /// Forget everything counted for `key`.
    async fn reset_tokens(&self, ctx: &Context, key: &str) -> Result<(), RateLimitError>;
}

/// Build the configured algorithm.
///
/// With `regions`, the window algorithms replicate across every region.
pub fn from_config(
    config: &AlgorithmConfig,
    regions: Option<RegionCoordinator>,
) -> Result<Arc<dyn Algorithm>, RateLimitError> {
    let algorithm: Arc<dyn Algorithm> = match (config, regions) {
        (AlgorithmConfig::FixedWindow { limit, window }, None) => Arc::new(FixedWindow::new(*limit, window.as_duration())),
        (AlgorithmConfig::SlidingWindow { limit, window }, None) => {
            Arc::new(SlidingWindow::new(*limit, window.as_duration()))
        }
        (
            AlgorithmConfig::TokenBucket {
                refill_rate,
                interval,
                max_tokens,
            },
            None,
        ) => Arc::new(TokenBucket::new(*refill_rate, interval.as_duration(), *max_tokens)),
        (AlgorithmConfig::CachedFixedWindow { limit, window }, None) => {
            Arc::new(CachedFixedWindow::new(*limit, window.as_duration()))
        }
        (AlgorithmConfig::FixedWindow { limit, window }, Some(regions)) => {
            Arc::new(MultiRegionFixedWindow::new(regions, *limit, window.as_duration()))
        }
        (AlgorithmConfig::SlidingWindow { limit, window }, Some(regions)) => {
            Arc::new(MultiRegionSlidingWindow::new(regions, *limit, window.as_duration()))
        }
        (config, Some(_)) => {
            return Err(RateLimitError::Config(format!(
                "The {} algorithm is not supported in multi-region mode",
                config.name()
            )));
        }
    };

    Ok(algorithm)
}

/// Delete `key` and its bucket keys in `store` and drop cached state for it.
pub(crate) async fn reset_keys(ctx: &Context, store: &dyn Store, key: &str) -> Result<(), RateLimitError> {
    if let Some(cache) = &ctx.cache {
        cache.pop_matching(key);
    }

    store
        .exec(&RESET_KEYS, &[key.to_string()], &[reset_pattern(key)])
        .await?;

    Ok(())
}

pub(crate) fn millis(duration: std::time::Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX).max(1)
}

pub(crate) fn signed(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
