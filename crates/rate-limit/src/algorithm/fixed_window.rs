use std::time::Duration;

use super::{Algorithm, Context, millis, reset_keys, signed};
use crate::error::RateLimitError;
use crate::response::{RateLimitResponse, Remaining};
use crate::script::{FIXED_WINDOW_LIMIT, FIXED_WINDOW_REMAINING};
use crate::storage::decode;

/// Counts requests in fixed, non-overlapping windows.
///
/// The bucket is `floor(now / window)` and resets at `(bucket + 1) * window`.
#[derive(Debug, Clone)]
pub struct FixedWindow {
    limit: i64,
    window: i64,
}

impl FixedWindow {
    /// Allow `limit` requests per `window`.
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit: signed(limit),
            window: millis(window),
        }
    }

    fn bucket(&self, now: i64) -> i64 {
        now.div_euclid(self.window)
    }
}

#[async_trait::async_trait]
impl Algorithm for FixedWindow {
    fn name(&self) -> &'static str {
        "fixed_window"
    }

    fn tokens(&self) -> u64 {
        self.limit as u64
    }

    async fn limit(&self, ctx: &Context, key: &str, rate: u64) -> Result<RateLimitResponse, RateLimitError> {
        let bucket = self.bucket(ctx.clock.now());

        let keys = [format!("{key}:{bucket}")];
        let args = [self.window.to_string(), rate.to_string()];

        let reply = ctx.store.exec(&FIXED_WINDOW_LIMIT, &keys, &args).await?;
        let used: i64 = decode(&FIXED_WINDOW_LIMIT, &reply)?;

        let reset = (bucket + 1) * self.window;

        Ok(RateLimitResponse::new(used <= self.limit, self.limit, self.limit - used, reset))
    }

    async fn get_remaining(&self, ctx: &Context, key: &str) -> Result<Remaining, RateLimitError> {
        let bucket = self.bucket(ctx.clock.now());

        let reply = ctx
            .store
            .exec(&FIXED_WINDOW_REMAINING, &[format!("{key}:{bucket}")], &[])
            .await?;

        let used: i64 = decode(&FIXED_WINDOW_REMAINING, &reply)?;

        Ok(Remaining::new(self.limit - used, (bucket + 1) * self.window))
    }

    async fn reset_tokens(&self, ctx: &Context, key: &str) -> Result<(), RateLimitError> {
        reset_keys(ctx, ctx.store.as_ref(), key).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::algorithm::test_support::{START, context};

    #[tokio::test]
    async fn remaining_decreases_until_denied() {
        let (_, ctx) = context(false);
        let algorithm = FixedWindow::new(5, Duration::from_secs(10));

        let mut remaining = Vec::new();

        for _ in 0..5 {
            let response = algorithm.limit(&ctx, "rl:user", 1).await.unwrap();
            assert!(response.success);
            remaining.push(response.remaining);
        }

        assert_eq!(remaining, [4, 3, 2, 1, 0]);

        let response = algorithm.limit(&ctx, "rl:user", 1).await.unwrap();

        assert!(!response.success);
        assert_eq!(response.remaining, 0);
        assert_eq!(response.reset, START + 10_000);
    }

    #[tokio::test]
    async fn rolls_over_after_reset() {
        let (clock, ctx) = context(false);
        let algorithm = FixedWindow::new(2, Duration::from_secs(10));

        for _ in 0..3 {
            algorithm.limit(&ctx, "rl:user", 1).await.unwrap();
        }

        let denied = algorithm.limit(&ctx, "rl:user", 1).await.unwrap();
        assert!(!denied.success);

        clock.set(denied.reset);

        let response = algorithm.limit(&ctx, "rl:user", 1).await.unwrap();
        assert!(response.success);
        assert_eq!(response.remaining, 1);
    }

    #[tokio::test]
    async fn weighted_requests() {
        let (_, ctx) = context(false);
        let algorithm = FixedWindow::new(10, Duration::from_secs(10));

        let response = algorithm.limit(&ctx, "rl:user", 7).await.unwrap();
        assert_eq!(response.remaining, 3);

        let response = algorithm.limit(&ctx, "rl:user", 4).await.unwrap();
        assert!(!response.success);

        let remaining = algorithm.get_remaining(&ctx, "rl:user").await.unwrap();
        assert_eq!(remaining.remaining, 0);
    }

    #[tokio::test]
    async fn reset_twice_is_a_fresh_start() {
        let (_, ctx) = context(false);
        let algorithm = FixedWindow::new(3, Duration::from_secs(10));

        for _ in 0..3 {
            algorithm.limit(&ctx, "rl:user", 1).await.unwrap();
        }

        algorithm.reset_tokens(&ctx, "rl:user").await.unwrap();
        algorithm.reset_tokens(&ctx, "rl:user").await.unwrap();

        let remaining = algorithm.get_remaining(&ctx, "rl:user").await.unwrap();
        assert_eq!(remaining.remaining, 3);

        let response = algorithm.limit(&ctx, "rl:user", 1).await.unwrap();
        assert_eq!(response.remaining, 2);
    }

    #[tokio::test]
    async fn reset_leaves_other_identifiers() {
        let (_, ctx) = context(false);
        let algorithm = FixedWindow::new(3, Duration::from_secs(10));

        algorithm.limit(&ctx, "rl:user", 1).await.unwrap();
        algorithm.limit(&ctx, "rl:user2", 1).await.unwrap();

        algorithm.reset_tokens(&ctx, "rl:user").await.unwrap();

        let remaining = algorithm.get_remaining(&ctx, "rl:user2").await.unwrap();
        assert_eq!(remaining.remaining, 2);
    }

    #[tokio::test]
    async fn reset_takes_glob_characters_literally() {
        let (_, ctx) = context(false);
        let algorithm = FixedWindow::new(3, Duration::from_secs(10));

        for key in ["rl:user", "rl:user:2", "rl:u?er"] {
            algorithm.limit(&ctx, key, 1).await.unwrap();
        }

        algorithm.reset_tokens(&ctx, "rl:*").await.unwrap();
        algorithm.reset_tokens(&ctx, "rl:u?er").await.unwrap();
        algorithm.reset_tokens(&ctx, "rl:user:[0-9]").await.unwrap();

        for key in ["rl:user", "rl:user:2"] {
            let remaining = algorithm.get_remaining(&ctx, key).await.unwrap();
            assert_eq!(remaining.remaining, 2, "{key}");
        }

        let remaining = algorithm.get_remaining(&ctx, "rl:u?er").await.unwrap();
        assert_eq!(remaining.remaining, 3);
    }
}
