use std::time::Duration;

use super::{Algorithm, Context, millis, reset_keys, signed};
use crate::error::RateLimitError;
use crate::response::{RateLimitResponse, Remaining};
use crate::script::{SLIDING_WINDOW_LIMIT, SLIDING_WINDOW_REMAINING};
use crate::storage::decode;

/// Weighs the previous fixed window into the current one.
///
/// The estimate is `current + floor(previous * (window - now % window) / window)`.
/// A request is denied when the estimate plus its cost exceeds the limit, before
/// anything is counted, so denied requests never inflate the window. Bursts right
/// at a boundary can still exceed the limit slightly; the estimate is approximate.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    limit: i64,
    window: i64,
}

impl SlidingWindow {
    /// Allow about `limit` requests in any `window`.
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit: signed(limit),
            window: millis(window),
        }
    }

    fn keys(&self, key: &str, now: i64) -> (i64, [String; 2]) {
        let bucket = now.div_euclid(self.window);
        let keys = [format!("{key}:{bucket}"), format!("{key}:{}", bucket - 1)];

        (bucket, keys)
    }
}

#[async_trait::async_trait]
impl Algorithm for SlidingWindow {
    fn name(&self) -> &'static str {
        "sliding_window"
    }

    fn tokens(&self) -> u64 {
        self.limit as u64
    }

    async fn limit(&self, ctx: &Context, key: &str, rate: u64) -> Result<RateLimitResponse, RateLimitError> {
        let now = ctx.clock.now();
        let (bucket, keys) = self.keys(key, now);

        let args = [
            self.limit.to_string(),
            now.to_string(),
            self.window.to_string(),
            rate.to_string(),
        ];

        let reply = ctx.store.exec(&SLIDING_WINDOW_LIMIT, &keys, &args).await?;
        let remaining: i64 = decode(&SLIDING_WINDOW_LIMIT, &reply)?;

        let reset = (bucket + 1) * self.window;

        Ok(RateLimitResponse::new(remaining >= 0, self.limit, remaining, reset))
    }

    async fn get_remaining(&self, ctx: &Context, key: &str) -> Result<Remaining, RateLimitError> {
        let now = ctx.clock.now();
        let (bucket, keys) = self.keys(key, now);

        let args = [now.to_string(), self.window.to_string()];

        let reply = ctx.store.exec(&SLIDING_WINDOW_REMAINING, &keys, &args).await?;
        let used: i64 = decode(&SLIDING_WINDOW_REMAINING, &reply)?;

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
    use crate::algorithm::test_support::context;

    #[tokio::test]
    async fn denied_requests_do_not_count() {
        let (_, ctx) = context(false);
        let algorithm = SlidingWindow::new(3, Duration::from_secs(10));

        for expected in [2, 1, 0] {
            let response = algorithm.limit(&ctx, "rl:user", 1).await.unwrap();
            assert!(response.success);
            assert_eq!(response.remaining, expected);
        }

        for _ in 0..5 {
            assert!(!algorithm.limit(&ctx, "rl:user", 1).await.unwrap().success);
        }

        let remaining = algorithm.get_remaining(&ctx, "rl:user").await.unwrap();
        assert_eq!(remaining.remaining, 0);
    }

    #[tokio::test]
    async fn previous_window_is_weighted() {
        let (clock, ctx) = context(false);
        let algorithm = SlidingWindow::new(10, Duration::from_secs(10));

        for _ in 0..10 {
            assert!(algorithm.limit(&ctx, "rl:user", 1).await.unwrap().success);
        }

        // A quarter into the next window, three quarters of the previous count remain.
        clock.advance(Duration::from_millis(12_500));

        let remaining = algorithm.get_remaining(&ctx, "rl:user").await.unwrap();
        assert_eq!(remaining.remaining, 3);

        for _ in 0..3 {
            assert!(algorithm.limit(&ctx, "rl:user", 1).await.unwrap().success);
        }

        assert!(!algorithm.limit(&ctx, "rl:user", 1).await.unwrap().success);
    }

    #[tokio::test]
    async fn boundary_does_not_double_count() {
        let (clock, ctx) = context(false);
        let algorithm = SlidingWindow::new(4, Duration::from_secs(10));

        for _ in 0..4 {
            algorithm.limit(&ctx, "rl:user", 1).await.unwrap();
        }

        // Exactly at the start of the next window the previous window weighs fully.
        clock.advance(Duration::from_secs(10));
        let remaining = algorithm.get_remaining(&ctx, "rl:user").await.unwrap();
        assert_eq!(remaining.remaining, 0);

        // One window later the first window no longer counts at all.
        clock.advance(Duration::from_secs(10));
        let remaining = algorithm.get_remaining(&ctx, "rl:user").await.unwrap();
        assert_eq!(remaining.remaining, 4);
    }

    #[tokio::test]
    async fn estimate_never_exceeds_limit() {
        let (clock, ctx) = context(false);
        let algorithm = SlidingWindow::new(7, Duration::from_secs(1));

        for step in 0..200 {
            algorithm.limit(&ctx, "rl:user", 1 + step % 3).await.unwrap();

            let now = ctx.clock.now();
            let (_, keys) = algorithm.keys("rl:user", now);
            let args = [now.to_string(), "1000".to_string()];

            let reply = ctx.store.exec(&SLIDING_WINDOW_REMAINING, &keys, &args).await.unwrap();
            let used: i64 = decode(&SLIDING_WINDOW_REMAINING, &reply).unwrap();

            assert!(used <= 7, "estimate {used} at step {step}");

            clock.advance(Duration::from_millis(37));
        }
    }
}
