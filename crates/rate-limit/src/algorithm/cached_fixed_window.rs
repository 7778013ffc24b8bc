use std::time::Duration;

use super::{Algorithm, Context, millis, reset_keys, signed};
use crate::cache::EphemeralCache;
use crate::error::RateLimitError;
use crate::response::{RateLimitResponse, Remaining};
use crate::script::{FIXED_WINDOW_LIMIT, FIXED_WINDOW_REMAINING};
use crate::storage::decode;

/// A fixed window decided from a local counter.
///
/// The first request of a bucket seeds the local counter from the store. Later
/// requests count locally and answer at once; allowed ones are replayed to the
/// store in the background, which raises the local counter to the shared count.
/// Instances therefore agree only eventually.
#[derive(Debug, Clone)]
pub struct CachedFixedWindow {
    limit: i64,
    window: i64,
}

impl CachedFixedWindow {
    /// Allow `limit` requests per `window`.
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit: signed(limit),
            window: millis(window),
        }
    }

    fn cache<'a>(&self, ctx: &'a Context) -> Result<&'a std::sync::Arc<EphemeralCache>, RateLimitError> {
        ctx.cache.as_ref().ok_or(RateLimitError::MissingCache { algorithm: self.name() })
    }
}

#[async_trait::async_trait]
impl Algorithm for CachedFixedWindow {
    fn name(&self) -> &'static str {
        "cached_fixed_window"
    }

    fn tokens(&self) -> u64 {
        self.limit as u64
    }

    fn requires_cache(&self) -> bool {
        true
    }

    async fn limit(&self, ctx: &Context, key: &str, rate: u64) -> Result<RateLimitResponse, RateLimitError> {
        let cache = self.cache(ctx)?;

        let bucket = ctx.clock.now().div_euclid(self.window);
        let reset = (bucket + 1) * self.window;

        let bucket_key = format!("{key}:{bucket}");
        let args = [self.window.to_string(), rate.to_string()];

        if cache.get(&bucket_key).is_some() {
            let used = cache.incr(&bucket_key, signed(rate));
            let success = used <= self.limit;

            let mut response = RateLimitResponse::new(success, self.limit, self.limit - used, reset);

            if success {
                let store = ctx.store.clone();
                let cache = cache.clone();

                response.pending.push(ctx.tasks.spawn(async move {
                    let reply = store.exec(&FIXED_WINDOW_LIMIT, &[bucket_key.clone()], &args).await?;
                    let shared: i64 = decode(&FIXED_WINDOW_LIMIT, &reply)?;

                    cache.raise(&bucket_key, shared);

                    Ok::<_, RateLimitError>(())
                }));
            }

            return Ok(response);
        }

        let reply = ctx.store.exec(&FIXED_WINDOW_LIMIT, &[bucket_key.clone()], &args).await?;
        let used: i64 = decode(&FIXED_WINDOW_LIMIT, &reply)?;

        cache.raise(&bucket_key, used);

        Ok(RateLimitResponse::new(used <= self.limit, self.limit, self.limit - used, reset))
    }

    async fn get_remaining(&self, ctx: &Context, key: &str) -> Result<Remaining, RateLimitError> {
        let cache = self.cache(ctx)?;

        let bucket = ctx.clock.now().div_euclid(self.window);
        let reset = (bucket + 1) * self.window;
        let bucket_key = format!("{key}:{bucket}");

        if let Some(used) = cache.get(&bucket_key) {
            return Ok(Remaining::new(self.limit - used, reset));
        }

        let reply = ctx.store.exec(&FIXED_WINDOW_REMAINING, &[bucket_key], &[]).await?;
        let used: i64 = decode(&FIXED_WINDOW_REMAINING, &reply)?;

        Ok(Remaining::new(self.limit - used, reset))
    }

    async fn reset_tokens(&self, ctx: &Context, key: &str) -> Result<(), RateLimitError> {
        self.cache(ctx)?;

        reset_keys(ctx, ctx.store.as_ref(), key).await
    }
}
