//! The rate limiter facade.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use config::{Config, StorageConfig};
use telemetry::metrics::{RATELIMIT_ANALYTICS_FAILURES, RATELIMIT_DECISION_DURATION, Recorder};
use tokio_util::task::TaskTracker;

use crate::algorithm::{self, Algorithm, Context};
use crate::analytics::{Analytics, AnalyticsEvent, Outcome, Usage};
use crate::cache::EphemeralCache;
use crate::clock::{Clock, SystemClock};
use crate::deny_list::{DenyList, DenyListSource, IpListStatus, IpsumSource};
use crate::error::RateLimitError;
use crate::region::RegionCoordinator;
use crate::request::RateLimitRequest;
use crate::response::{Reason, RateLimitResponse, Remaining};
use crate::storage::{MemoryStore, RedisStore, Store};

/// Default decision timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Limits identifiers with one algorithm, a deny list and usage analytics.
///
/// Cloning is cheap and clones share the ephemeral cache, the deny list cache and
/// the set of pending background tasks.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

struct Inner {
    prefix: String,
    timeout: Duration,
    algorithm: Arc<dyn Algorithm>,
    ctx: Context,
    deny_list: Option<Arc<DenyList>>,
    analytics: Option<Analytics>,
    draining: tokio::sync::Mutex<()>,
}

impl RateLimiter {
    /// Start building a limiter over `store` using `algorithm`.
    pub fn builder(store: Arc<dyn Store>, algorithm: Arc<dyn Algorithm>) -> RateLimiterBuilder {
        RateLimiterBuilder {
            store,
            algorithm,
            prefix: "ratelimit".to_string(),
            timeout: DEFAULT_TIMEOUT,
            ephemeral_cache: true,
            deny_list: None,
            deny_list_refresh_ttl: None,
            analytics: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Connect the configured stores and build the configured limiter.
    pub async fn from_config(config: &Config) -> Result<Self, RateLimitError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let (store, regions): (Arc<dyn Store>, _) = match &config.storage {
            StorageConfig::Memory => (Arc::new(MemoryStore::with_clock(clock.clone())), None),
            StorageConfig::Redis(redis) => (Arc::new(RedisStore::new(redis).await?), None),
            StorageConfig::MultiRegion(multi) => {
                let stores = futures::future::try_join_all(multi.regions.iter().map(RedisStore::new)).await?;

                let regions = stores
                    .into_iter()
                    .map(|store| Arc::new(store) as Arc<dyn Store>)
                    .collect();

                let coordinator = RegionCoordinator::new(regions)?;

                (coordinator.primary(), Some(coordinator))
            }
        };

        let algorithm = algorithm::from_config(&config.algorithm, regions)?;

        let mut builder = Self::builder(store, algorithm)
            .prefix(config.prefix.clone())
            .timeout(config.timeout)
            .ephemeral_cache(config.ephemeral_cache)
            .clock(clock);

        if config.deny_list.enabled {
            let source = Arc::new(IpsumSource::new(config.deny_list.source_url.clone()));

            builder = builder
                .deny_list(source, config.deny_list.threshold)
                .deny_list_refresh_ttl(config.deny_list.refresh_ttl);
        }

        if config.analytics.enabled {
            builder = builder.analytics(config.analytics.retention);
        }

        builder.build()
    }

    /// Decide whether a request for `identifier` may proceed.
    ///
    /// Identifiers blocked in the ephemeral cache are denied without a store round
    /// trip. Otherwise the deny list and the algorithm run concurrently, and a deny
    /// list match wins over the algorithm. When the decision takes longer than the
    /// timeout, the request is allowed with [`Reason::Timeout`] and the decision
    /// finishes in the background.
    pub async fn limit(
        &self,
        identifier: &str,
        request: &RateLimitRequest,
    ) -> Result<RateLimitResponse, RateLimitError> {
        let mut recorder = Recorder::new(RATELIMIT_DECISION_DURATION);
        let result = self.decide_with_timeout(identifier, request).await;

        match &result {
            Ok(response) => {
                recorder.push_attribute("outcome", if response.success { "allowed" } else { "blocked" });

                if let Some(reason) = response.reason {
                    recorder.push_attribute("reason", reason.as_str());
                }
            }
            Err(_) => recorder.push_attribute("outcome", "error"),
        }

        recorder.record();

        let mut response = result?;
        self.submit_analytics(&mut response, identifier, request);

        Ok(response)
    }

    /// Call [`RateLimiter::limit`] until it succeeds or `timeout` passes.
    ///
    /// Sleeps until the reset of each denial, or the deadline if that comes first.
    /// Deny list matches return at once.
    pub async fn block_until_ready(
        &self,
        identifier: &str,
        request: &RateLimitRequest,
        timeout: Duration,
    ) -> Result<RateLimitResponse, RateLimitError> {
        if timeout.is_zero() {
            return Err(RateLimitError::Config(
                "block_until_ready needs a timeout greater than zero".to_string(),
            ));
        }

        let clock = &self.inner.ctx.clock;
        let deadline = clock.now() + algorithm::millis(timeout);

        loop {
            let response = self.limit(identifier, request).await?;

            if response.success || response.reason == Some(Reason::DenyList) {
                return Ok(response);
            }

            let now = clock.now();

            if now >= deadline {
                return Ok(response);
            }

            let wait = (response.reset.min(deadline) - now).max(1);
            log::debug!("Identifier '{identifier}' is limited, retrying in {wait} ms");

            tokio::time::sleep(Duration::from_millis(wait as u64)).await;
        }
    }

    /// Tokens left for `identifier`, without taking any.
    pub async fn get_remaining(&self, identifier: &str) -> Result<Remaining, RateLimitError> {
        let key = self.inner.key(identifier);
        self.inner.algorithm.get_remaining(&self.inner.ctx, &key).await
    }

    /// Forget everything counted for `identifier`, including cached blocks.
    pub async fn reset_used_tokens(&self, identifier: &str) -> Result<(), RateLimitError> {
        let key = self.inner.key(identifier);
        self.inner.algorithm.reset_tokens(&self.inner.ctx, &key).await
    }

    /// Wait for every background task started so far.
    ///
    /// Hosts call this before shutting down so that replication, deny list
    /// refreshes and analytics are not lost. Concurrent callers take turns.
    pub async fn wait_for_pending(&self) {
        let tasks = &self.inner.ctx.tasks;
        let _draining = self.inner.draining.lock().await;

        tasks.close();
        tasks.wait().await;
        tasks.reopen();
    }

    /// The deny list, when enabled.
    pub fn deny_list(&self) -> Option<&DenyList> {
        self.inner.deny_list.as_deref()
    }

    /// Refresh the IP deny list now. Returns the number of IPs it holds.
    pub async fn refresh_deny_list(&self) -> Result<u64, RateLimitError> {
        self.require_deny_list()?.refresh(self.inner.ctx.store.as_ref()).await
    }

    /// Drop the IP deny list and stop refreshing it.
    pub async fn disable_ip_deny_list(&self) -> Result<(), RateLimitError> {
        self.require_deny_list()?.disable(self.inner.ctx.store.as_ref()).await
    }

    /// Deny `values`: identifiers, IPs, user agents or countries.
    pub async fn deny(&self, values: &[String]) -> Result<u64, RateLimitError> {
        self.require_deny_list()?.deny(self.inner.ctx.store.as_ref(), values).await
    }

    /// Stop denying `values`.
    pub async fn allow(&self, values: &[String]) -> Result<u64, RateLimitError> {
        self.require_deny_list()?.allow(self.inner.ctx.store.as_ref(), values).await
    }

    /// Usage per identifier since `since` epoch ms.
    pub async fn usage(&self, since: i64) -> Result<BTreeMap<String, Usage>, RateLimitError> {
        let Some(analytics) = &self.inner.analytics else {
            return Err(RateLimitError::Config("Analytics are not enabled".to_string()));
        };

        let now = self.inner.ctx.clock.now();
        analytics.usage(self.inner.ctx.store.as_ref(), since, now).await
    }

    fn require_deny_list(&self) -> Result<&DenyList, RateLimitError> {
        self.deny_list()
            .ok_or_else(|| RateLimitError::Config("The deny list is not enabled".to_string()))
    }

    async fn decide_with_timeout(
        &self,
        identifier: &str,
        request: &RateLimitRequest,
    ) -> Result<RateLimitResponse, RateLimitError> {
        let key = self.inner.key(identifier);

        if let Some(cache) = &self.inner.ctx.cache
            && let Some(reset) = cache.is_blocked(&key)
        {
            log::debug!("Identifier '{identifier}' is blocked until {reset}");
            return Ok(RateLimitResponse::cache_block(self.inner.algorithm.tokens(), reset));
        }

        let mut decision = {
            let inner = self.inner.clone();
            let identifier = identifier.to_string();
            let request = request.clone();

            self.inner
                .ctx
                .tasks
                .spawn(async move { inner.decide(&identifier, &key, &request).await })
        };

        let timeout = self.inner.timeout;

        if timeout.is_zero() {
            return decision.await?;
        }

        let raced = tokio::time::timeout(timeout, &mut decision).await;

        match raced {
            Ok(joined) => joined?,
            Err(_) => {
                log::warn!("Rate limit decision for '{identifier}' took longer than {timeout:?}, allowing the request");

                let mut response = RateLimitResponse::timeout();
                let identifier = identifier.to_string();

                response.pending.push(self.inner.ctx.tasks.spawn(async move {
                    match decision.await? {
                        Ok(late) => late.pending.wait().await,
                        Err(error) => {
                            log::warn!("Rate limit decision for '{identifier}' failed after the timeout: {error}");
                            Ok(())
                        }
                    }
                }));

                Ok(response)
            }
        }
    }

    fn submit_analytics(&self, response: &mut RateLimitResponse, identifier: &str, request: &RateLimitRequest) {
        if self.inner.analytics.is_none() {
            return;
        }

        let outcome = match (response.reason, response.success) {
            (Some(Reason::DenyList), _) => Outcome::Denied,
            (_, true) => Outcome::Allowed,
            (_, false) => Outcome::Blocked,
        };

        let event = AnalyticsEvent {
            identifier: response.denied_value.clone().unwrap_or_else(|| identifier.to_string()),
            time: self.inner.ctx.clock.now(),
            outcome,
            country: request.country.clone(),
        };

        let inner = self.inner.clone();

        response.pending.push(self.inner.ctx.tasks.spawn(async move {
            if let Some(analytics) = &inner.analytics
                && let Err(error) = analytics.record(inner.ctx.store.as_ref(), &event).await
            {
                log::warn!("Failed to record analytics for '{}': {error}", event.identifier);
                telemetry::metrics::increment(RATELIMIT_ANALYTICS_FAILURES, &[]);
            }

            Ok(())
        }));
    }
}

impl Inner {
    /// Identifier keys live below `{prefix}:id:`, apart from the deny list and
    /// analytics keys.
    fn key(&self, identifier: &str) -> String {
        format!("{}:id:{identifier}", self.prefix)
    }

    async fn decide(
        &self,
        identifier: &str,
        key: &str,
        request: &RateLimitRequest,
    ) -> Result<RateLimitResponse, RateLimitError> {
        let rate = request.rate();

        let Some(deny_list) = &self.deny_list else {
            let response = self.algorithm.limit(&self.ctx, key, rate).await?;
            self.block_if_denied(key, &response);

            return Ok(response);
        };

        let members = request.members(identifier);

        if let Some(value) = deny_list.check_cached(&members) {
            log::debug!("'{value}' was denied recently");
            return Ok(RateLimitResponse::denied(value));
        }

        let (mut response, check) = tokio::try_join!(
            self.algorithm.limit(&self.ctx, key, rate),
            deny_list.check(self.ctx.store.as_ref(), &members),
        )?;

        self.block_if_denied(key, &response);

        if let Some(value) = check.denied_value {
            log::debug!("'{value}' is on the deny list");
            response.deny(value);
        }

        if check.ip_list == IpListStatus::Expired {
            let deny_list = deny_list.clone();
            let store = self.ctx.store.clone();

            response.pending.push(
                self.ctx
                    .tasks
                    .spawn(async move { deny_list.refresh(store.as_ref()).await.map(|_| ()) }),
            );
        }

        Ok(response)
    }

    fn block_if_denied(&self, key: &str, response: &RateLimitResponse) {
        if !response.success
            && let Some(cache) = &self.ctx.cache
        {
            cache.block_until(key, response.reset);
        }
    }
}

/// Builder for [`RateLimiter`].
pub struct RateLimiterBuilder {
    store: Arc<dyn Store>,
    algorithm: Arc<dyn Algorithm>,
    prefix: String,
    timeout: Duration,
    ephemeral_cache: bool,
    deny_list: Option<(Arc<dyn DenyListSource>, u8)>,
    deny_list_refresh_ttl: Option<Duration>,
    analytics: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl RateLimiterBuilder {
    /// Prefix of every key. Defaults to `ratelimit`.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// How long a decision may take before failing open. Zero waits forever.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether denied identifiers are remembered in-process. Defaults to on.
    pub fn ephemeral_cache(mut self, enabled: bool) -> Self {
        self.ephemeral_cache = enabled;
        self
    }

    /// Check requests against the deny list, refreshing IPs on `threshold` lists from `source`.
    pub fn deny_list(mut self, source: Arc<dyn DenyListSource>, threshold: u8) -> Self {
        self.deny_list = Some((source, threshold));
        self
    }

    /// How long a refreshed IP list stays valid. Defaults to the next 02:00 UTC.
    pub fn deny_list_refresh_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.deny_list_refresh_ttl = ttl;
        self
    }

    /// Record every decision, keeping hourly buckets for `retention`.
    pub fn analytics(mut self, retention: Duration) -> Self {
        self.analytics = Some(retention);
        self
    }

    /// Source of the current time. The store must use the same clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build the limiter.
    pub fn build(self) -> Result<RateLimiter, RateLimitError> {
        if self.prefix.is_empty() {
            return Err(RateLimitError::Config("The key prefix must not be empty".to_string()));
        }

        let cache = self
            .ephemeral_cache
            .then(|| Arc::new(EphemeralCache::new(self.clock.clone())));

        if self.algorithm.requires_cache() && cache.is_none() {
            return Err(RateLimitError::MissingCache {
                algorithm: self.algorithm.name(),
            });
        }

        let deny_list = self
            .deny_list
            .map(|(source, threshold)| DenyList::new(&self.prefix, threshold, source, self.clock.clone()))
            .transpose()?
            .map(|deny_list| Arc::new(deny_list.with_refresh_ttl(self.deny_list_refresh_ttl)));

        let analytics = self
            .analytics
            .map(|retention| Analytics::new(&self.prefix, retention));

        log::debug!(
            "Rate limiter '{}' uses {} with a {:?} timeout",
            self.prefix,
            self.algorithm.name(),
            self.timeout
        );

        Ok(RateLimiter {
            inner: Arc::new(Inner {
                prefix: self.prefix,
                timeout: self.timeout,
                algorithm: self.algorithm,
                ctx: Context {
                    store: self.store,
                    cache,
                    clock: self.clock,
                    tasks: TaskTracker::new(),
                },
                deny_list,
                analytics,
                draining: tokio::sync::Mutex::new(()),
            }),
        })
    }
}
