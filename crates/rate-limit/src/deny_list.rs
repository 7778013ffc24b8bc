//! Deny list of identifiers, IPs, user agents and countries.
//!
//! Denied values live in one replicated set, `{prefix}:denyList:all`. An IP
//! reputation list is merged into it and owned by `{prefix}:denyList:ipDenyList`,
//! so a refresh only replaces the IPs it added. `{prefix}:ipDenyListStatus`
//! tracks freshness through its TTL:
//!
//! - positive TTL: the IP list is valid.
//! - no TTL: the IP list is disabled.
//! - missing: the IP list expired. The first request to notice sets the status to
//!   `pending` for 30 seconds and refreshes the list.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::cache::EphemeralCache;
use crate::clock::Clock;
use crate::error::RateLimitError;
use crate::script::{DENY_LIST_ADD, DENY_LIST_CHECK, DENY_LIST_DISABLE, DENY_LIST_REMOVE, DENY_LIST_UPDATE};
use crate::storage::{Store, decode};

/// How long a denied value is remembered locally.
pub const DENIED_VALUE_TTL: Duration = Duration::from_secs(60);

const DAY: i64 = 86_400_000;
/// IP lists are refreshed daily at 02:00 UTC.
const REFRESH_OFFSET: i64 = 2 * 3_600_000;

/// Errors raised while refreshing the IP deny list.
#[derive(Debug, thiserror::Error)]
pub enum DenyListError {
    /// The source could not be reached.
    #[error("Failed to fetch the IP deny list: {0}")]
    Fetch(#[from] reqwest::Error),

    /// The source answered with an error status.
    #[error("The IP deny list source answered with status {0}")]
    Status(reqwest::StatusCode),

    /// The source failed for another reason.
    #[error("The IP deny list source failed: {0}")]
    Source(String),
}

/// Where the IP deny list comes from.
#[async_trait]
pub trait DenyListSource: Send + Sync {
    /// Fetch IPs appearing on at least `threshold` blocklists.
    async fn fetch(&self, threshold: u8) -> Result<Vec<String>, DenyListError>;
}

/// Fetches an IPsum level file, one IP per line.
pub struct IpsumSource {
    client: reqwest::Client,
    url: String,
}

impl IpsumSource {
    /// `url` may contain `{threshold}`, replaced on every fetch.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl DenyListSource for IpsumSource {
    async fn fetch(&self, threshold: u8) -> Result<Vec<String>, DenyListError> {
        let url = self.url.replace("{threshold}", &threshold.to_string());
        log::debug!("Fetching IP deny list from {url}");

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(DenyListError::Status(response.status()));
        }

        let body = response.text().await?;

        Ok(body
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| line.split_whitespace().next().unwrap_or(line).to_string())
            .collect())
    }
}

/// A fixed list of IPs.
#[derive(Debug, Clone, Default)]
pub struct StaticSource(Vec<String>);

impl StaticSource {
    /// Serve `ips` on every fetch.
    pub fn new<I, S>(ips: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(ips.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl DenyListSource for StaticSource {
    async fn fetch(&self, _: u8) -> Result<Vec<String>, DenyListError> {
        Ok(self.0.clone())
    }
}

/// Freshness of the IP deny list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IpListStatus {
    /// Fresh, or being refreshed by another caller.
    Valid,
    /// Turned off.
    Disabled,
    /// Needs a refresh. Only one caller per staleness window observes this.
    Expired,
}

impl IpListStatus {
    fn from_ttl(ttl: i64) -> Self {
        match ttl {
            -2 => IpListStatus::Expired,
            -1 => IpListStatus::Disabled,
            _ => IpListStatus::Valid,
        }
    }
}

/// Result of a deny list probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenyListCheck {
    /// The first probed value found on the deny list.
    pub denied_value: Option<String>,
    /// Freshness of the IP list.
    pub ip_list: IpListStatus,
}

/// Deny list manager.
pub struct DenyList {
    all_key: String,
    ip_key: String,
    status_key: String,
    threshold: u8,
    refresh_ttl: Option<Duration>,
    source: Arc<dyn DenyListSource>,
    denied: EphemeralCache,
    clock: Arc<dyn Clock>,
}

impl DenyList {
    /// Create a deny list under `prefix`, refreshing IPs on at least `threshold` lists.
    pub fn new(
        prefix: &str,
        threshold: u8,
        source: Arc<dyn DenyListSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RateLimitError> {
        if !(1..=8).contains(&threshold) {
            return Err(RateLimitError::Config(format!(
                "Deny list threshold must be an integer between 1 and 8, got {threshold}"
            )));
        }

        Ok(Self {
            all_key: format!("{prefix}:denyList:all"),
            ip_key: format!("{prefix}:denyList:ipDenyList"),
            status_key: format!("{prefix}:ipDenyListStatus"),
            threshold,
            refresh_ttl: None,
            source,
            denied: EphemeralCache::new(clock.clone()),
            clock,
        })
    }

    /// Keep refreshed IP lists for `ttl` instead of until the next 02:00 UTC.
    pub fn with_refresh_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.refresh_ttl = ttl;
        self
    }

    /// A probed value denied within the last minute, without a store round trip.
    pub fn check_cached(&self, members: &[String]) -> Option<String> {
        members
            .iter()
            .find(|member| self.denied.is_blocked(member).is_some())
            .cloned()
    }

    /// Probe `members` and the IP list freshness in one round trip.
    pub async fn check(&self, store: &dyn Store, members: &[String]) -> Result<DenyListCheck, RateLimitError> {
        let keys = [self.all_key.clone(), self.status_key.clone()];

        let reply = store.exec(&DENY_LIST_CHECK, &keys, members).await?;
        let (flags, ttl): (Vec<i64>, i64) = decode(&DENY_LIST_CHECK, &reply)?;

        let denied_value = members
            .iter()
            .zip(flags)
            .find(|(_, flag)| *flag == 1)
            .map(|(member, _)| member.clone());

        if let Some(value) = &denied_value {
            let until = self.clock.now() + DENIED_VALUE_TTL.as_millis() as i64;
            self.denied.block_until(value, until);
        }

        Ok(DenyListCheck {
            denied_value,
            ip_list: IpListStatus::from_ttl(ttl),
        })
    }

    /// Replace the IP list with a fresh copy from the source. Returns the number of IPs it owns.
    pub async fn refresh(&self, store: &dyn Store) -> Result<u64, RateLimitError> {
        let ips = self.source.fetch(self.threshold).await?;

        let ttl = match self.refresh_ttl {
            Some(ttl) => (ttl.as_millis() as i64).max(1),
            None => until_next_refresh(self.clock.now()),
        };

        let keys = [self.all_key.clone(), self.ip_key.clone(), self.status_key.clone()];

        let mut args = Vec::with_capacity(ips.len() + 1);
        args.push(ttl.to_string());
        args.extend(ips);

        let reply = store.exec(&DENY_LIST_UPDATE, &keys, &args).await?;
        let count: u64 = decode(&DENY_LIST_UPDATE, &reply)?;

        log::info!("Refreshed the IP deny list with {count} addresses, valid for {ttl} ms");

        Ok(count)
    }

    /// Drop the IP list and stop refreshing it. Values added by hand stay denied.
    pub async fn disable(&self, store: &dyn Store) -> Result<(), RateLimitError> {
        let keys = [self.all_key.clone(), self.ip_key.clone(), self.status_key.clone()];
        store.exec(&DENY_LIST_DISABLE, &keys, &[]).await?;

        log::info!("Disabled the IP deny list");

        Ok(())
    }

    /// Deny `values`. Returns how many were not denied before.
    pub async fn deny(&self, store: &dyn Store, values: &[String]) -> Result<u64, RateLimitError> {
        if values.is_empty() {
            return Ok(0);
        }

        let reply = store.exec(&DENY_LIST_ADD, &[self.all_key.clone()], values).await?;
        Ok(decode(&DENY_LIST_ADD, &reply)?)
    }

    /// Stop denying `values`. Returns how many were denied before.
    pub async fn allow(&self, store: &dyn Store, values: &[String]) -> Result<u64, RateLimitError> {
        if values.is_empty() {
            return Ok(0);
        }

        for value in values {
            self.denied.pop(value);
        }

        let reply = store.exec(&DENY_LIST_REMOVE, &[self.all_key.clone()], values).await?;
        Ok(decode(&DENY_LIST_REMOVE, &reply)?)
    }
}

/// Milliseconds from `now` until the next daily refresh.
fn until_next_refresh(now: i64) -> i64 {
    DAY - (now - REFRESH_OFFSET).rem_euclid(DAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;

    const NOW: i64 = 1_700_000_000_000;

    struct Failing;

    #[async_trait]
    impl DenyListSource for Failing {
        async fn fetch(&self, _: u8) -> Result<Vec<String>, DenyListError> {
            Err(DenyListError::Source("feed unreachable".to_string()))
        }
    }

    fn setup(source: impl DenyListSource + 'static) -> (Arc<ManualClock>, MemoryStore, DenyList) {
        let clock = Arc::new(ManualClock::new(NOW));
        let store = MemoryStore::with_clock(clock.clone());
        let deny_list = DenyList::new("rl", 6, Arc::new(source), clock.clone()).unwrap();

        (clock, store, deny_list)
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn threshold_is_validated() {
        let error = DenyList::new("rl", 0, Arc::new(StaticSource::default()), Arc::new(ManualClock::new(0)))
            .err()
            .unwrap();

        insta::assert_snapshot!(error, @"Invalid rate limiter configuration: Deny list threshold must be an integer between 1 and 8, got 0");
    }

    #[test]
    fn refreshes_at_two_in_the_morning() {
        // 2023-11-14T22:13:20Z, next refresh at 2023-11-15T02:00:00Z.
        assert_eq!(until_next_refresh(NOW), 13_600_000);
        // Exactly at 02:00 the list stays valid for a full day.
        assert_eq!(until_next_refresh(REFRESH_OFFSET), DAY);
    }

    #[tokio::test]
    async fn only_the_first_caller_sees_expiry() {
        let (_, store, deny_list) = setup(StaticSource::default());
        let members = strings(&["user"]);

        let first = deny_list.check(&store, &members).await.unwrap();
        assert_eq!(first.ip_list, IpListStatus::Expired);

        let second = deny_list.check(&store, &members).await.unwrap();
        assert_eq!(second.ip_list, IpListStatus::Valid);
    }

    #[tokio::test]
    async fn pending_status_expires() {
        let (clock, store, deny_list) = setup(StaticSource::default());
        let members = strings(&["user"]);

        deny_list.check(&store, &members).await.unwrap();
        clock.advance(Duration::from_secs(30));

        let check = deny_list.check(&store, &members).await.unwrap();
        assert_eq!(check.ip_list, IpListStatus::Expired);
    }

    #[tokio::test]
    async fn refresh_denies_ips() {
        let (clock, store, deny_list) = setup(StaticSource::new(["1.1.1.1", "2.2.2.2"]));

        assert_eq!(deny_list.refresh(&store).await.unwrap(), 2);

        let members = strings(&["user", "2.2.2.2"]);
        let check = deny_list.check(&store, &members).await.unwrap();

        assert_eq!(check.denied_value.as_deref(), Some("2.2.2.2"));
        assert_eq!(check.ip_list, IpListStatus::Valid);
        assert_eq!(deny_list.check_cached(&members).as_deref(), Some("2.2.2.2"));

        clock.advance(DENIED_VALUE_TTL + Duration::from_millis(1));
        assert_eq!(deny_list.check_cached(&members), None);
    }

    #[tokio::test]
    async fn refresh_replaces_previous_ips_only() {
        let (_, store, _) = setup(StaticSource::default());
        let clock = Arc::new(ManualClock::new(NOW));

        let first = DenyList::new("rl", 6, Arc::new(StaticSource::new(["1.1.1.1"])), clock.clone()).unwrap();
        let second = DenyList::new("rl", 6, Arc::new(StaticSource::new(["2.2.2.2"])), clock).unwrap();

        first.deny(&store, &strings(&["bad-user"])).await.unwrap();
        first.refresh(&store).await.unwrap();
        second.refresh(&store).await.unwrap();

        let check = second.check(&store, &strings(&["1.1.1.1"])).await.unwrap();
        assert_eq!(check.denied_value, None);

        let check = second.check(&store, &strings(&["bad-user", "2.2.2.2"])).await.unwrap();
        assert_eq!(check.denied_value.as_deref(), Some("bad-user"));
    }

    #[tokio::test]
    async fn disable_keeps_manual_entries() {
        let (_, store, deny_list) = setup(StaticSource::new(["1.1.1.1"]));

        deny_list.deny(&store, &strings(&["bad-user"])).await.unwrap();
        deny_list.refresh(&store).await.unwrap();
        deny_list.disable(&store).await.unwrap();

        let check = deny_list.check(&store, &strings(&["1.1.1.1"])).await.unwrap();
        assert_eq!(check.denied_value, None);
        assert_eq!(check.ip_list, IpListStatus::Disabled);

        let check = deny_list.check(&store, &strings(&["bad-user"])).await.unwrap();
        assert_eq!(check.denied_value.as_deref(), Some("bad-user"));
    }

    #[tokio::test]
    async fn allow_forgets_cached_denials() {
        let (_, store, deny_list) = setup(StaticSource::default());
        let members = strings(&["bad-user"]);

        assert_eq!(deny_list.deny(&store, &members).await.unwrap(), 1);
        deny_list.check(&store, &members).await.unwrap();
        assert!(deny_list.check_cached(&members).is_some());

        assert_eq!(deny_list.allow(&store, &members).await.unwrap(), 1);
        assert!(deny_list.check_cached(&members).is_none());

        let check = deny_list.check(&store, &members).await.unwrap();
        assert_eq!(check.denied_value, None);
    }

    #[tokio::test]
    async fn source_errors_surface() {
        let (_, store, deny_list) = setup(Failing);

        let error = deny_list.refresh(&store).await.unwrap_err();
        insta::assert_snapshot!(error, @"Deny list error: The IP deny list source failed: feed unreachable");
    }
}
