//! Distributed rate limiting over Redis-compatible stores.
//!
//! A [`RateLimiter`] decides whether a request for an identifier may proceed using one
//! of four algorithms:
//! - fixed window
//! - sliding window
//! - token bucket
//! - cached fixed window, decided in-process and synchronized in the background
//!
//! Every decision runs as an atomic script in the store, so several processes sharing
//! a store agree on the counts. Fixed and sliding windows can also replicate across
//! independent regional stores. Identifiers, IPs, user agents and countries can be denied
//! outright, and decisions can be aggregated into hourly usage analytics.

#![deny(missing_docs)]

pub mod algorithm;
pub mod analytics;
pub mod cache;
pub mod clock;
pub mod deny_list;
mod error;
mod limiter;
pub mod region;
mod request;
mod response;
pub mod script;
pub mod storage;

pub use algorithm::Algorithm;
pub use analytics::{Outcome, Usage};
pub use clock::{Clock, ManualClock, SystemClock};
pub use deny_list::{DenyList, DenyListError, DenyListSource, IpsumSource, StaticSource};
pub use error::RateLimitError;
pub use limiter::{DEFAULT_TIMEOUT, RateLimiter, RateLimiterBuilder};
pub use region::RegionCoordinator;
pub use request::{RateLimitRequest, RateLimitRequestBuilder};
pub use response::{Pending, RateLimitResponse, Reason, Remaining, ResponseRecord};
pub use storage::{MemoryStore, RedisStore, StorageError, Store};
