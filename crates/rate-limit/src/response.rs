//! Rate limit decisions and the background work they leave behind.

use http::{HeaderMap, HeaderValue};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::error::RateLimitError;

/// Why a response was decided without, or in spite of, the algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Reason {
    /// A request value is on the deny list.
    DenyList,
    /// The identifier is blocked in the ephemeral cache.
    CacheBlock,
    /// The decision took longer than the timeout and failed open.
    Timeout,
}

impl Reason {
    /// The reason as it appears in serialized responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::DenyList => "denyList",
            Reason::CacheBlock => "cacheBlock",
            Reason::Timeout => "timeout",
        }
    }
}

/// Background tasks started by a decision.
///
/// Tasks keep running when this is dropped. Await [`Pending::wait`] to observe
/// their completion, or use `RateLimiter::wait_for_pending` before shutdown.
#[derive(Debug, Default)]
pub struct Pending {
    tasks: Vec<JoinHandle<Result<(), RateLimitError>>>,
}

impl Pending {
    pub(crate) fn push(&mut self, task: JoinHandle<Result<(), RateLimitError>>) {
        self.tasks.push(task);
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether there is nothing to wait for.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every task, returning the first error.
    pub async fn wait(self) -> Result<(), RateLimitError> {
        let mut first_error = None;

        for task in self.tasks {
            let result = match task.await {
                Ok(result) => result,
                Err(error) => Err(error.into()),
            };

            match result {
                Err(error) if first_error.is_none() => first_error = Some(error),
                Err(error) => log::debug!("Pending task failed: {error}"),
                Ok(()) => {}
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

/// The outcome of a rate limit check.
#[derive(Debug)]
pub struct RateLimitResponse {
    /// Whether the request may proceed.
    pub success: bool,
    /// Requests allowed per window, or bucket capacity.
    pub limit: u64,
    /// Requests left. Never negative.
    pub remaining: u64,
    /// When the limit resets, in epoch milliseconds.
    pub reset: i64,
    /// Background work started by this decision.
    pub pending: Pending,
    /// Set when the outcome did not come from the algorithm alone.
    pub reason: Option<Reason>,
    /// The deny list entry that matched.
    pub denied_value: Option<String>,
}

impl RateLimitResponse {
    pub(crate) fn new(success: bool, limit: i64, remaining: i64, reset: i64) -> Self {
        Self {
            success,
            limit: limit.max(0) as u64,
            remaining: remaining.max(0) as u64,
            reset,
            pending: Pending::default(),
            reason: None,
            denied_value: None,
        }
    }

    pub(crate) fn cache_block(limit: u64, reset: i64) -> Self {
        let mut response = Self::new(false, 0, 0, reset);
        response.limit = limit;
        response.reason = Some(Reason::CacheBlock);
        response
    }

    pub(crate) fn timeout() -> Self {
        let mut response = Self::new(true, 0, 0, 0);
        response.reason = Some(Reason::Timeout);
        response
    }

    pub(crate) fn denied(value: String) -> Self {
        let mut response = Self::new(false, 0, 0, 0);
        response.reason = Some(Reason::DenyList);
        response.denied_value = Some(value);
        response
    }

    /// Override the algorithm outcome with a deny list match.
    pub(crate) fn deny(&mut self, value: String) {
        self.success = false;
        self.limit = 0;
        self.remaining = 0;
        self.reset = 0;
        self.reason = Some(Reason::DenyList);
        self.denied_value = Some(value);
    }

    /// The decision without its background work.
    pub fn record(&self) -> ResponseRecord {
        ResponseRecord {
            success: self.success,
            limit: self.limit,
            remaining: self.remaining,
            reset: self.reset,
            reason: self.reason,
            denied_value: self.denied_value.clone(),
        }
    }

    /// `X-RateLimit-Limit`, `X-RateLimit-Remaining` and `X-RateLimit-Reset` headers.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(3);

        headers.insert("x-ratelimit-limit", HeaderValue::from(self.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(self.remaining));
        headers.insert("x-ratelimit-reset", HeaderValue::from(self.reset));

        headers
    }
}

/// Flat, serializable view of a [`RateLimitResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRecord {
    /// Whether the request may proceed.
    pub success: bool,
    /// Requests allowed per window.
    pub limit: u64,
    /// Requests left.
    pub remaining: u64,
    /// Reset in epoch milliseconds.
    pub reset: i64,
    /// Why the outcome did not come from the algorithm alone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    /// The deny list entry that matched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denied_value: Option<String>,
}

/// Tokens left for an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Remaining {
    /// Requests left. Never negative.
    pub remaining: u64,
    /// When the limit resets, in epoch milliseconds.
    pub reset: i64,
}

impl Remaining {
    pub(crate) fn new(remaining: i64, reset: i64) -> Self {
        Self {
            remaining: remaining.max(0) as u64,
            reset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_is_clamped() {
        let response = RateLimitResponse::new(false, 5, -3, 10_000);

        assert_eq!(response.remaining, 0);
        assert_eq!(Remaining::new(-1, 0).remaining, 0);
    }

    #[test]
    fn headers() {
        let response = RateLimitResponse::new(true, 10, 7, 1_700_000_000_000);
        let headers = response.headers();

        assert_eq!(headers["x-ratelimit-limit"], "10");
        assert_eq!(headers["x-ratelimit-remaining"], "7");
        assert_eq!(headers["x-ratelimit-reset"], "1700000000000");
    }

    #[test]
    fn record_serializes_flat() {
        let mut response = RateLimitResponse::new(true, 10, 7, 1_000);
        response.deny("1.2.3.4".to_string());

        insta::assert_snapshot!(
            serde_json::to_string(&response.record()).unwrap(),
            @r#"{"success":false,"limit":0,"remaining":0,"reset":0,"reason":"denyList","deniedValue":"1.2.3.4"}"#
        );
    }

    #[tokio::test]
    async fn pending_returns_first_error() {
        let mut pending = Pending::default();

        pending.push(tokio::spawn(async { Ok(()) }));
        pending.push(tokio::spawn(async { Err(RateLimitError::Config("first".to_string())) }));
        pending.push(tokio::spawn(async { Err(RateLimitError::Config("second".to_string())) }));

        let error = pending.wait().await.unwrap_err();
        insta::assert_snapshot!(error, @"Invalid rate limiter configuration: first");
    }
}
