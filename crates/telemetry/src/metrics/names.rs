//! Metric names recorded by the rate limiter

/// Time from `limit()` being called to a decision, in milliseconds
pub const RATELIMIT_DECISION_DURATION: &str = "ratelimit.decision.duration";

/// Duration of a single atomic script execution against the backing store, in milliseconds
pub const RATELIMIT_STORE_SCRIPT_DURATION: &str = "ratelimit.store.script.duration";

/// Analytics events that could not be recorded
pub const RATELIMIT_ANALYTICS_FAILURES: &str = "ratelimit.analytics.failures";
