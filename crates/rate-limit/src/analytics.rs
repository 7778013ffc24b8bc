//! Usage analytics aggregated into hourly buckets.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RateLimitError;
use crate::script::{ANALYTICS_READ, ANALYTICS_RECORD};
use crate::storage::{StorageError, Store, decode};

/// Width of an analytics bucket.
pub const BUCKET: Duration = Duration::from_secs(3600);

const BUCKET_MS: i64 = 3_600_000;

/// What happened to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The request was allowed.
    Allowed,
    /// The request was over its limit.
    Blocked,
    /// A request value was on the deny list.
    Denied,
}

/// One rate limit decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyticsEvent {
    /// The limited identifier, or the denied value.
    pub identifier: String,
    /// When the decision was made, in epoch milliseconds.
    pub time: i64,
    /// What happened.
    pub outcome: Outcome,
    /// Country of the request, when known.
    pub country: Option<String>,
}

/// Hash field an event is counted under.
#[derive(Serialize, Deserialize)]
struct Field {
    identifier: String,
    outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    country: Option<String>,
}

/// Aggregated decisions of one identifier.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Usage {
    /// Allowed requests.
    pub allowed: u64,
    /// Requests over the limit.
    pub blocked: u64,
    /// Requests matching the deny list.
    pub denied: u64,
}

/// Records decisions into `{prefix}:analytics:events:{hour}` hashes.
pub struct Analytics {
    prefix: String,
    retention: i64,
}

impl Analytics {
    /// Keep buckets for `retention`.
    pub fn new(prefix: &str, retention: Duration) -> Self {
        Self {
            prefix: prefix.to_string(),
            retention: (retention.as_millis() as i64).max(BUCKET_MS),
        }
    }

    fn bucket_key(&self, time: i64) -> String {
        format!("{}:analytics:events:{}", self.prefix, time - time.rem_euclid(BUCKET_MS))
    }

    /// Count one event.
    pub async fn record(&self, store: &dyn Store, event: &AnalyticsEvent) -> Result<(), RateLimitError> {
        let field = Field {
            identifier: event.identifier.clone(),
            outcome: event.outcome,
            country: event.country.clone(),
        };

        let field = serde_json::to_string(&field).map_err(|e| StorageError::Internal(e.to_string()))?;

        store
            .exec(
                &ANALYTICS_RECORD,
                &[self.bucket_key(event.time)],
                &[field, self.retention.to_string()],
            )
            .await?;

        Ok(())
    }

    /// Usage per identifier between `since` and `now`, bounded by the retention.
    pub async fn usage(
        &self,
        store: &dyn Store,
        since: i64,
        now: i64,
    ) -> Result<BTreeMap<String, Usage>, RateLimitError> {
        let first = since.max(now - self.retention);
        let first = first - first.rem_euclid(BUCKET_MS);

        let reads = (first..=now)
            .step_by(BUCKET_MS as usize)
            .map(|time| async move {
                let reply = store.exec(&ANALYTICS_READ, &[self.bucket_key(time)], &[]).await?;
                decode::<Vec<String>>(&ANALYTICS_READ, &reply)
            });

        let buckets = futures::future::try_join_all(reads).await?;
        let mut usage = BTreeMap::<String, Usage>::new();

        for fields in buckets {
            for pair in fields.chunks_exact(2) {
                let (Ok(field), Ok(count)) = (serde_json::from_str::<Field>(&pair[0]), pair[1].parse::<u64>()) else {
                    log::warn!("Skipping malformed analytics field '{}'", pair[0]);
                    continue;
                };

                let entry = usage.entry(field.identifier).or_default();

                match field.outcome {
                    Outcome::Allowed => entry.allowed += count,
                    Outcome::Blocked => entry.blocked += count,
                    Outcome::Denied => entry.denied += count,
                }
            }
        }

        Ok(usage)
    }
}
