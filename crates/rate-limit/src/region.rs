//! Fan-out of scripts to independent regional stores.
//!
//! Every region holds a full copy of the limiter keys. A call runs in all regions
//! at once and resolves with the first successful reply. The remaining replies
//! are collected in the background, and regions missing request ids recorded
//! elsewhere are backfilled until every region holds the same membership.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use redis::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use crate::error::RateLimitError;
use crate::script::{REGION_BACKFILL, RESET_KEYS, Script, reset_pattern};
use crate::storage::{StorageError, Store};

/// Successful replies of every region, in region order. Failed regions are `None`.
pub type RegionReplies = Vec<Option<Value>>;

/// Request ids and their cost, as recorded in one region.
pub type Membership = BTreeMap<String, i64>;

/// Runs scripts against every region.
#[derive(Clone)]
pub struct RegionCoordinator {
    regions: Arc<[Arc<dyn Store>]>,
}

impl RegionCoordinator {
    /// Coordinate `regions`. The first one is the primary region.
    pub fn new(regions: Vec<Arc<dyn Store>>) -> Result<Self, RateLimitError> {
        if regions.is_empty() {
            return Err(RateLimitError::Config("Multi-region mode needs at least one region".to_string()));
        }

        Ok(Self {
            regions: regions.into(),
        })
    }

    /// The region hosting state that is not replicated, such as the deny list.
    pub fn primary(&self) -> Arc<dyn Store> {
        self.regions[0].clone()
    }

    /// Number of regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether there are no regions. Never true for a constructed coordinator.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Run `script` in every region.
    ///
    /// Resolves with the first successful reply and a handle resolving with every
    /// region's reply. Fails only when all regions fail, with the last error.
    pub async fn race(
        &self,
        tasks: &TaskTracker,
        script: &'static Script,
        keys: Vec<String>,
        args: Vec<String>,
    ) -> Result<(Value, JoinHandle<RegionReplies>), RateLimitError> {
        let (first_tx, first_rx) = oneshot::channel::<Result<Value, StorageError>>();
        let regions = self.regions.clone();

        let collector = tasks.spawn(async move {
            let mut calls: FuturesUnordered<_> = regions
                .iter()
                .enumerate()
                .map(|(index, region)| {
                    let (keys, args) = (&keys, &args);
                    async move { (index, region.exec(script, keys, args).await) }
                })
                .collect();

            let mut replies: RegionReplies = vec![None; regions.len()];
            let mut first_tx = Some(first_tx);
            let mut last_error = None;

            while let Some((index, reply)) = calls.next().await {
                match reply {
                    Ok(value) => {
                        if let Some(tx) = first_tx.take() {
                            let _ = tx.send(Ok(value.clone()));
                        }

                        replies[index] = Some(value);
                    }
                    Err(error) => {
                        log::warn!("Region {index} failed to run {}: {error}", script.name());
                        last_error = Some(error);
                    }
                }
            }

            if let Some(tx) = first_tx.take() {
                let error = last_error.unwrap_or_else(|| StorageError::Internal("No region replied".to_string()));
                let _ = tx.send(Err(error));
            }

            replies
        });

        match first_rx.await {
            Ok(Ok(value)) => Ok((value, collector)),
            Ok(Err(error)) => Err(error.into()),
            Err(_) => match collector.await {
                Err(error) => Err(error.into()),
                Ok(_) => Err(StorageError::Internal("Region race ended without a reply".to_string()).into()),
            },
        }
    }

    /// Delete `key` and its bucket keys in every region.
    pub async fn reset(&self, key: &str) -> Result<(), RateLimitError> {
        let keys = [key.to_string()];
        let args = [reset_pattern(key)];

        let deletions = self
            .regions
            .iter()
            .map(|region| region.exec(&RESET_KEYS, &keys, &args));
        futures::future::try_join_all(deletions).await?;

        Ok(())
    }

    /// Write request ids recorded anywhere into the regions missing them.
    ///
    /// `memberships` holds what each region recorded under `key`, `None` for
    /// regions that failed. Regions already at `limit` are left alone.
    pub async fn backfill(
        &self,
        key: &str,
        memberships: Vec<Option<Membership>>,
        limit: i64,
        ttl: i64,
    ) -> Result<(), RateLimitError> {
        let mut all = Membership::new();

        for membership in memberships.iter().flatten() {
            for (id, cost) in membership {
                all.entry(id.clone()).or_insert(*cost);
            }
        }

        let mut writes = Vec::new();

        for (region, membership) in self.regions.iter().zip(&memberships) {
            let Some(membership) = membership else {
                continue;
            };

            if membership.values().sum::<i64>() >= limit {
                continue;
            }

            let mut args = vec![ttl.to_string()];

            for (id, cost) in all.iter().filter(|(id, _)| !membership.contains_key(*id)) {
                args.push(id.clone());
                args.push(cost.to_string());
            }

            if args.len() > 1 {
                writes.push(async move { region.exec(&REGION_BACKFILL, &[key.to_string()], &args).await });
            }
        }

        if writes.is_empty() {
            return Ok(());
        }

        log::debug!("Backfilling {} region(s) for {key}", writes.len());

        let mut first_error = None;

        for result in futures::future::join_all(writes).await {
            if let Err(error) = result {
                log::warn!("Failed to backfill {key}: {error}");
                first_error.get_or_insert(error);
            }
        }

        match first_error {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }
}

/// Parse flat `[id, cost, id, cost, ...]` hash fields.
pub(crate) fn membership(script: &Script, fields: Vec<String>) -> Result<Membership, StorageError> {
    fields
        .chunks_exact(2)
        .map(|pair| {
            let cost = pair[1].parse::<i64>().map_err(|_| StorageError::UnexpectedReply {
                script: script.name(),
                message: format!("cost '{}' of {} is not a number", pair[1], pair[0]),
            })?;

            Ok::<_, StorageError>((pair[0].clone(), cost))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::script::{REGION_FIXED_WINDOW_LIMIT, REGION_HASH_FIELDS};
    use crate::storage::{MemoryStore, decode};

    /// A region that answers after a delay.
    struct Slow(MemoryStore, Duration);

    #[async_trait]
    impl Store for Slow {
        async fn exec(&self, script: &'static Script, keys: &[String], args: &[String]) -> Result<Value, StorageError> {
            tokio::time::sleep(self.1).await;
            self.0.exec(script, keys, args).await
        }
    }

    /// A region that is down.
    struct Down;

    #[async_trait]
    impl Store for Down {
        async fn exec(&self, _: &'static Script, _: &[String], _: &[String]) -> Result<Value, StorageError> {
            Err(StorageError::Connection("connection refused".to_string()))
        }
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    async fn fields(store: &dyn Store, key: &str) -> Membership {
        let reply = store.exec(&REGION_HASH_FIELDS, &strings(&[key]), &[]).await.unwrap();
        membership(&REGION_HASH_FIELDS, decode(&REGION_HASH_FIELDS, &reply).unwrap()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn first_reply_wins() {
        let fast: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let slow = Arc::new(Slow(MemoryStore::new(), Duration::from_secs(5)));

        let coordinator = RegionCoordinator::new(vec![slow.clone() as Arc<dyn Store>, fast]).unwrap();
        let tasks = TaskTracker::new();

        let (value, replies) = coordinator
            .race(
                &tasks,
                &REGION_FIXED_WINDOW_LIMIT,
                strings(&["rl:user:1"]),
                strings(&["request-1", "10000", "1"]),
            )
            .await
            .unwrap();

        let first: Vec<String> = decode(&REGION_FIXED_WINDOW_LIMIT, &value).unwrap();
        assert_eq!(first, ["request-1", "1"]);
        assert!(!replies.is_finished());

        let replies = replies.await.unwrap();
        assert!(replies.iter().all(Option::is_some));
        assert_eq!(fields(&slow.0, "rl:user:1").await.len(), 1);
    }

    #[tokio::test]
    async fn fails_when_every_region_fails() {
        let coordinator = RegionCoordinator::new(vec![Arc::new(Down) as Arc<dyn Store>, Arc::new(Down)]).unwrap();

        let error = coordinator
            .race(&TaskTracker::new(), &REGION_HASH_FIELDS, strings(&["key"]), Vec::new())
            .await
            .err()
            .unwrap();

        insta::assert_snapshot!(error, @"Storage error: Connection error: connection refused");
    }

    #[tokio::test]
    async fn one_region_down_is_tolerated() {
        let up: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let coordinator = RegionCoordinator::new(vec![Arc::new(Down) as Arc<dyn Store>, up]).unwrap();

        let (_, replies) = coordinator
            .race(&TaskTracker::new(), &REGION_HASH_FIELDS, strings(&["key"]), Vec::new())
            .await
            .unwrap();

        let replies = replies.await.unwrap();
        assert!(replies[0].is_none());
        assert!(replies[1].is_some());
    }

    #[tokio::test]
    async fn backfill_converges_membership() {
        let a = Arc::new(MemoryStore::new());
        let b = Arc::new(MemoryStore::new());
        let coordinator = RegionCoordinator::new(vec![a.clone() as Arc<dyn Store>, b.clone()]).unwrap();

        a.exec(&REGION_FIXED_WINDOW_LIMIT, &strings(&["k"]), &strings(&["r1", "10000", "1"]))
            .await
            .unwrap();
        b.exec(&REGION_FIXED_WINDOW_LIMIT, &strings(&["k"]), &strings(&["r2", "10000", "2"]))
            .await
            .unwrap();

        let memberships = vec![Some(fields(a.as_ref(), "k").await), Some(fields(b.as_ref(), "k").await)];
        coordinator.backfill("k", memberships, 10, 10_000).await.unwrap();

        let expected = Membership::from([("r1".to_string(), 1), ("r2".to_string(), 2)]);
        assert_eq!(fields(a.as_ref(), "k").await, expected);
        assert_eq!(fields(b.as_ref(), "k").await, expected);
    }

    #[tokio::test]
    async fn backfill_skips_full_regions() {
        let a = Arc::new(MemoryStore::new());
        let b = Arc::new(MemoryStore::new());
        let coordinator = RegionCoordinator::new(vec![a.clone() as Arc<dyn Store>, b.clone()]).unwrap();

        a.exec(&REGION_FIXED_WINDOW_LIMIT, &strings(&["k"]), &strings(&["r1", "10000", "3"]))
            .await
            .unwrap();
        b.exec(&REGION_FIXED_WINDOW_LIMIT, &strings(&["k"]), &strings(&["r2", "10000", "1"]))
            .await
            .unwrap();

        let memberships = vec![Some(fields(a.as_ref(), "k").await), Some(fields(b.as_ref(), "k").await)];
        coordinator.backfill("k", memberships, 3, 10_000).await.unwrap();

        assert_eq!(fields(a.as_ref(), "k").await.len(), 1);
        assert_eq!(fields(b.as_ref(), "k").await.len(), 2);
    }
}
