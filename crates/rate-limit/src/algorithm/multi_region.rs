use std::time::Duration;

use uuid::Uuid;

use super::{Algorithm, Context, millis, signed};
use crate::error::RateLimitError;
use crate::region::{Membership, RegionCoordinator, RegionReplies, membership};
use crate::response::{RateLimitResponse, Remaining};
use crate::script::{
    REGION_FIXED_WINDOW_LIMIT, REGION_HASH_FIELDS, REGION_SLIDING_WINDOW_LIMIT, REGION_SLIDING_WINDOW_REMAINING,
};
use crate::storage::decode;

/// A fixed window replicated across regions.
///
/// Each request is recorded as a unique id in a hash, so regions can be merged
/// by union. Decisions use the first region to answer.
#[derive(Clone)]
pub struct MultiRegionFixedWindow {
    regions: RegionCoordinator,
    limit: i64,
    window: i64,
}

impl MultiRegionFixedWindow {
    /// Allow `limit` requests per `window` across `regions`.
    pub fn new(regions: RegionCoordinator, limit: u64, window: Duration) -> Self {
        Self {
            regions,
            limit: signed(limit),
            window: millis(window),
        }
    }
}

#[async_trait::async_trait]
impl Algorithm for MultiRegionFixedWindow {
    fn name(&self) -> &'static str {
        "fixed_window"
    }

    fn tokens(&self) -> u64 {
        self.limit as u64
    }

    async fn limit(&self, ctx: &Context, key: &str, rate: u64) -> Result<RateLimitResponse, RateLimitError> {
        let bucket = ctx.clock.now().div_euclid(self.window);
        let reset = (bucket + 1) * self.window;
        let bucket_key = format!("{key}:{bucket}");

        let args = vec![request_id(), self.window.to_string(), rate.to_string()];

        let (reply, replies) = self
            .regions
            .race(&ctx.tasks, &REGION_FIXED_WINDOW_LIMIT, vec![bucket_key.clone()], args)
            .await?;

        let fields = decode(&REGION_FIXED_WINDOW_LIMIT, &reply)?;
        let used: i64 = membership(&REGION_FIXED_WINDOW_LIMIT, fields)?.values().sum();

        let mut response = RateLimitResponse::new(used <= self.limit, self.limit, self.limit - used, reset);

        let regions = self.regions.clone();
        let (limit, window) = (self.limit, self.window);

        response.pending.push(ctx.tasks.spawn(async move {
            let memberships = collect(replies, |value| {
                let fields = decode(&REGION_FIXED_WINDOW_LIMIT, &value).ok()?;
                membership(&REGION_FIXED_WINDOW_LIMIT, fields).ok()
            })
            .await?;

            regions.backfill(&bucket_key, memberships, limit, window).await
        }));

        Ok(response)
    }

    async fn get_remaining(&self, ctx: &Context, key: &str) -> Result<Remaining, RateLimitError> {
        let bucket = ctx.clock.now().div_euclid(self.window);
        let keys = vec![format!("{key}:{bucket}")];

        let (reply, _) = self.regions.race(&ctx.tasks, &REGION_HASH_FIELDS, keys, Vec::new()).await?;

        let fields = decode(&REGION_HASH_FIELDS, &reply)?;
        let used: i64 = membership(&REGION_HASH_FIELDS, fields)?.values().sum();

        Ok(Remaining::new(self.limit - used, (bucket + 1) * self.window))
    }

    async fn reset_tokens(&self, ctx: &Context, key: &str) -> Result<(), RateLimitError> {
        if let Some(cache) = &ctx.cache {
            cache.pop_matching(key);
        }

        self.regions.reset(key).await
    }
}

/// A sliding window replicated across regions.
#[derive(Clone)]
pub struct MultiRegionSlidingWindow {
    regions: RegionCoordinator,
    limit: i64,
    window: i64,
}

impl MultiRegionSlidingWindow {
    /// Allow about `limit` requests in any `window` across `regions`.
    pub fn new(regions: RegionCoordinator, limit: u64, window: Duration) -> Self {
        Self {
            regions,
            limit: signed(limit),
            window: millis(window),
        }
    }

    fn keys(&self, key: &str, now: i64) -> (i64, Vec<String>) {
        let bucket = now.div_euclid(self.window);
        (bucket, vec![format!("{key}:{bucket}"), format!("{key}:{}", bucket - 1)])
    }

    fn weigh(&self, previous: &Membership, now: i64) -> i64 {
        let previous: i64 = previous.values().sum();
        previous * (self.window - now.rem_euclid(self.window)) / self.window
    }
}

type SlidingReply = (Vec<String>, Vec<String>, i64);

#[async_trait::async_trait]
impl Algorithm for MultiRegionSlidingWindow {
    fn name(&self) -> &'static str {
        "sliding_window"
    }

    fn tokens(&self) -> u64 {
        self.limit as u64
    }

    async fn limit(&self, ctx: &Context, key: &str, rate: u64) -> Result<RateLimitResponse, RateLimitError> {
        let now = ctx.clock.now();
        let (bucket, keys) = self.keys(key, now);
        let current_key = keys[0].clone();
        let request_id = request_id();
        let cost = signed(rate);

        let args = vec![
            self.limit.to_string(),
            now.to_string(),
            self.window.to_string(),
            request_id.clone(),
            rate.to_string(),
        ];

        let (reply, replies) = self
            .regions
            .race(&ctx.tasks, &REGION_SLIDING_WINDOW_LIMIT, keys, args)
            .await?;

        let (current, previous, allowed): SlidingReply = decode(&REGION_SLIDING_WINDOW_LIMIT, &reply)?;
        let current = membership(&REGION_SLIDING_WINDOW_LIMIT, current)?;
        let previous = membership(&REGION_SLIDING_WINDOW_LIMIT, previous)?;

        let success = allowed == 1;
        let used = current.values().sum::<i64>() + self.weigh(&previous, now) + if success { cost } else { 0 };

        let reset = (bucket + 1) * self.window;
        let mut response = RateLimitResponse::new(success, self.limit, self.limit - used, reset);

        let regions = self.regions.clone();
        let (limit, ttl) = (self.limit, self.window * 2 + 1000);

        response.pending.push(ctx.tasks.spawn(async move {
            let memberships = collect(replies, |value| {
                let (current, _, allowed): SlidingReply = decode(&REGION_SLIDING_WINDOW_LIMIT, &value).ok()?;
                let mut current = membership(&REGION_SLIDING_WINDOW_LIMIT, current).ok()?;

                if allowed == 1 {
                    current.insert(request_id.clone(), cost);
                }

                Some(current)
            })
            .await?;

            regions.backfill(&current_key, memberships, limit, ttl).await
        }));

        Ok(response)
    }

    async fn get_remaining(&self, ctx: &Context, key: &str) -> Result<Remaining, RateLimitError> {
        let now = ctx.clock.now();
        let (bucket, keys) = self.keys(key, now);

        let (reply, _) = self
            .regions
            .race(&ctx.tasks, &REGION_SLIDING_WINDOW_REMAINING, keys, Vec::new())
            .await?;

        let (current, previous): (Vec<String>, Vec<String>) = decode(&REGION_SLIDING_WINDOW_REMAINING, &reply)?;
        let current = membership(&REGION_SLIDING_WINDOW_REMAINING, current)?;
        let previous = membership(&REGION_SLIDING_WINDOW_REMAINING, previous)?;

        let used = current.values().sum::<i64>() + self.weigh(&previous, now);

        Ok(Remaining::new(self.limit - used, (bucket + 1) * self.window))
    }

    async fn reset_tokens(&self, ctx: &Context, key: &str) -> Result<(), RateLimitError> {
        if let Some(cache) = &ctx.cache {
            cache.pop_matching(key);
        }

        self.regions.reset(key).await
    }
}

fn request_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Wait for every region and turn each successful reply into its membership.
async fn collect(
    replies: tokio::task::JoinHandle<RegionReplies>,
    parse: impl Fn(redis::Value) -> Option<Membership>,
) -> Result<Vec<Option<Membership>>, RateLimitError> {
    let replies = replies.await?;

    Ok(replies.into_iter().map(|reply| reply.and_then(&parse)).collect())
}
