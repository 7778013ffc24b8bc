use std::time::Duration;

use super::{Algorithm, Context, millis, reset_keys, signed};
use crate::error::RateLimitError;
use crate::response::{RateLimitResponse, Remaining};
use crate::script::{TOKEN_BUCKET_LIMIT, TOKEN_BUCKET_REMAINING};
use crate::storage::decode;

/// Refills `refill_rate` tokens every `interval`, up to `max_tokens`.
///
/// The bucket is stored as `{refilledAt, tokens}` and expires once it would have
/// refilled to capacity, so idle identifiers cost no storage.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    refill_rate: i64,
    interval: i64,
    max_tokens: i64,
}

impl TokenBucket {
    /// Create a bucket holding `max_tokens`, refilling `refill_rate` per `interval`.
    pub fn new(refill_rate: u64, interval: Duration, max_tokens: u64) -> Self {
        Self {
            refill_rate: signed(refill_rate).max(1),
            interval: millis(interval),
            max_tokens: signed(max_tokens),
        }
    }

    fn args(&self, now: i64) -> Vec<String> {
        vec![
            self.max_tokens.to_string(),
            self.interval.to_string(),
            self.refill_rate.to_string(),
            now.to_string(),
        ]
    }
}

#[async_trait::async_trait]
impl Algorithm for TokenBucket {
    fn name(&self) -> &'static str {
        "token_bucket"
    }

    fn tokens(&self) -> u64 {
        self.max_tokens as u64
    }

    async fn limit(&self, ctx: &Context, key: &str, rate: u64) -> Result<RateLimitResponse, RateLimitError> {
        let mut args = self.args(ctx.clock.now());
        args.push(rate.to_string());

        let reply = ctx.store.exec(&TOKEN_BUCKET_LIMIT, &[key.to_string()], &args).await?;
        let (remaining, reset): (i64, i64) = decode(&TOKEN_BUCKET_LIMIT, &reply)?;

        Ok(RateLimitResponse::new(remaining >= 0, self.max_tokens, remaining, reset))
    }

    async fn get_remaining(&self, ctx: &Context, key: &str) -> Result<Remaining, RateLimitError> {
        let args = self.args(ctx.clock.now());

        let reply = ctx
            .store
            .exec(&TOKEN_BUCKET_REMAINING, &[key.to_string()], &args)
            .await?;

        let (tokens, reset): (i64, i64) = decode(&TOKEN_BUCKET_REMAINING, &reply)?;

        Ok(Remaining::new(tokens, reset))
    }

    async fn reset_tokens(&self, ctx: &Context, key: &str) -> Result<(), RateLimitError> {
        reset_keys(ctx, ctx.store.as_ref(), key).await
    }
}
