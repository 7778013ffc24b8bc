//! Process-local cache of blocked identifiers and local counters.

use std::sync::Arc;

use dashmap::DashMap;

use crate::clock::Clock;

/// Entries kept before the cache is cleared.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Process-local blocks and counters, both keyed by store key.
///
/// Used as a fast-reject cache: a key blocked until `reset` answers without a
/// store round trip until `reset` passes. It never answers "allowed". The cached
/// fixed window algorithm also keeps its local counters here, apart from the
/// blocks.
///
/// Once either map holds `capacity` entries, inserting a new key clears it first.
pub struct EphemeralCache {
    blocks: DashMap<String, i64>,
    counters: DashMap<String, i64>,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl EphemeralCache {
    /// Create a cache holding up to [`DEFAULT_CAPACITY`] entries.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, clock)
    }

    /// Create a cache holding up to `capacity` entries.
    pub fn with_capacity(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            blocks: DashMap::new(),
            counters: DashMap::new(),
            capacity: capacity.max(1),
            clock,
        }
    }

    /// The reset of a block on `key`, if it has not passed yet.
    ///
    /// Expired blocks are evicted.
    pub fn is_blocked(&self, key: &str) -> Option<i64> {
        let reset = *self.blocks.get(key)?;
        let now = self.clock.now();

        if reset < now {
            self.blocks.remove_if(key, |_, reset| *reset < now);
            return None;
        }

        Some(reset)
    }

    /// Block `key` until `reset` epoch ms.
    pub fn block_until(&self, key: &str, reset: i64) {
        self.make_room(&self.blocks, key);
        self.blocks.insert(key.to_string(), reset);
    }

    /// Read a counter.
    pub fn get(&self, key: &str) -> Option<i64> {
        self.counters.get(key).map(|value| *value)
    }

    /// Overwrite a counter.
    pub fn set(&self, key: &str, value: i64) {
        self.make_room(&self.counters, key);
        self.counters.insert(key.to_string(), value);
    }

    /// Add `by` to a counter, starting from zero. Returns the new value.
    pub fn incr(&self, key: &str, by: i64) -> i64 {
        self.make_room(&self.counters, key);

        let mut value = self.counters.entry(key.to_string()).or_insert(0);
        *value += by;
        *value
    }

    /// Raise a counter to at least `value`.
    pub fn raise(&self, key: &str, value: i64) {
        self.make_room(&self.counters, key);

        self.counters
            .entry(key.to_string())
            .and_modify(|current| *current = (*current).max(value))
            .or_insert(value);
    }

    /// Remove the counter at `key`.
    pub fn pop(&self, key: &str) -> Option<i64> {
        self.counters.remove(key).map(|(_, value)| value)
    }

    /// Remove blocks and counters at `key` and nested below it (`{key}:...`).
    pub fn pop_matching(&self, key: &str) {
        let nested = format!("{key}:");
        let keep = |candidate: &String, _: &mut i64| candidate != key && !candidate.starts_with(&nested);

        self.blocks.retain(keep);
        self.counters.retain(keep);
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.blocks.clear();
        self.counters.clear();
    }

    /// Number of entries, expired blocks included.
    pub fn len(&self) -> usize {
        self.blocks.len() + self.counters.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.counters.is_empty()
    }

    fn make_room(&self, entries: &DashMap<String, i64>, key: &str) {
        if entries.len() >= self.capacity && !entries.contains_key(key) {
            log::debug!("Ephemeral cache reached {} entries, clearing it", self.capacity);
            entries.clear();
        }
    }
}
