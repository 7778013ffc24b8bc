//! In-process store that evaluates every script natively.
//!
//! A single lock guards the keyspace, so each script runs without interleaving,
//! matching the atomicity of server-side scripts. Keys expire lazily on access.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use redis::Value;
use tokio::sync::Mutex;

use super::{StorageError, Store};
use crate::clock::{Clock, SystemClock};
use crate::script::{Script, ScriptId, owned_by};

enum Data {
    String(String),
    Hash(BTreeMap<String, String>),
    Set(BTreeSet<String>),
}

struct Entry {
    data: Data,
    expires_at: Option<i64>,
}

impl Entry {
    fn new(data: Data) -> Self {
        Self { data, expires_at: None }
    }
}

/// In-memory store implementation.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a new in-memory store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a new in-memory store that expires keys by `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = self.clock.now();
        let entries = self.entries.lock().await;

        entries
            .values()
            .filter(|entry| entry.expires_at.is_none_or(|at| at > now))
            .count()
    }

    /// Whether no live keys are stored.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn exec(&self, script: &'static Script, keys: &[String], args: &[String]) -> Result<Value, StorageError> {
        let mut entries = self.entries.lock().await;

        let mut tx = Transaction {
            entries: &mut entries,
            now: self.clock.now(),
        };

        let call = Call { script, keys, args };

        tx.run(&call)
    }
}

struct Call<'a> {
    script: &'static Script,
    keys: &'a [String],
    args: &'a [String],
}

impl Call<'_> {
    fn key(&self, index: usize) -> Result<&str, StorageError> {
        self.keys
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| self.error(format!("missing key {}", index + 1)))
    }

    fn arg<T: FromStr>(&self, index: usize) -> Result<T, StorageError> {
        let raw = self
            .args
            .get(index)
            .ok_or_else(|| self.error(format!("missing argument {}", index + 1)))?;

        raw.parse()
            .map_err(|_| self.error(format!("argument {} is not a number: '{raw}'", index + 1)))
    }

    fn error(&self, message: String) -> StorageError {
        StorageError::Query(format!("{}: {message}", self.script.name()))
    }
}

struct Transaction<'a> {
    entries: &'a mut HashMap<String, Entry>,
    now: i64,
}

impl Transaction<'_> {
    fn run(&mut self, call: &Call<'_>) -> Result<Value, StorageError> {
        match call.script.id() {
            ScriptId::FixedWindowLimit => {
                let key = call.key(0)?;
                let window: i64 = call.arg(0)?;
                let increment: i64 = call.arg(1)?;

                let count = self.incr_by(key, increment)?;

                if count == increment {
                    self.pexpire(key, window);
                }

                Ok(Value::Int(count))
            }
            ScriptId::FixedWindowRemaining => Ok(Value::Int(self.get_int(call.key(0)?)?)),
            ScriptId::SlidingWindowLimit => {
                let (current_key, previous_key) = (call.key(0)?, call.key(1)?);
                let limit: i64 = call.arg(0)?;
                let now: i64 = call.arg(1)?;
                let window: i64 = call.arg(2)?;
                let increment: i64 = call.arg(3)?;

                let current = self.get_int(current_key)?;
                let weighted = weigh(self.get_int(previous_key)?, now, window);

                if current + weighted + increment > limit {
                    return Ok(Value::Int(-1));
                }

                let count = self.incr_by(current_key, increment)?;

                if count == increment {
                    self.pexpire(current_key, window * 2 + 1000);
                }

                Ok(Value::Int(limit - (count + weighted)))
            }
            ScriptId::SlidingWindowRemaining => {
                let now: i64 = call.arg(0)?;
                let window: i64 = call.arg(1)?;

                let current = self.get_int(call.key(0)?)?;
                let previous = self.get_int(call.key(1)?)?;

                Ok(Value::Int(current + weigh(previous, now, window)))
            }
            ScriptId::TokenBucketLimit => {
                let key = call.key(0)?;
                let max_tokens: i64 = call.arg(0)?;
                let interval: i64 = call.arg(1)?;
                let refill_rate: i64 = call.arg(2)?;
                let now: i64 = call.arg(3)?;
                let increment: i64 = call.arg(4)?;

                let (tokens, refilled_at) = self.refill(key, max_tokens, interval, refill_rate, now)?;

                if tokens < increment {
                    return Ok(int_array([-1, refilled_at + interval]));
                }

                let remaining = tokens - increment;
                let missing = max_tokens - remaining;
                let expire_at = (missing + refill_rate - 1) / refill_rate * interval;

                if expire_at > 0 {
                    let hash = self.hash_mut(key)?;
                    hash.insert("refilledAt".to_string(), refilled_at.to_string());
                    hash.insert("tokens".to_string(), remaining.to_string());

                    self.pexpire(key, expire_at);
                } else {
                    self.del(key);
                }

                Ok(int_array([remaining, refilled_at + interval]))
            }
            ScriptId::TokenBucketRemaining => {
                let max_tokens: i64 = call.arg(0)?;
                let interval: i64 = call.arg(1)?;
                let refill_rate: i64 = call.arg(2)?;
                let now: i64 = call.arg(3)?;

                let (tokens, refilled_at) = self.refill(call.key(0)?, max_tokens, interval, refill_rate, now)?;

                Ok(int_array([tokens, refilled_at + interval]))
            }
            ScriptId::RegionFixedWindowLimit => {
                let key = call.key(0)?;
                let request_id = call.args.first().cloned().unwrap_or_default();
                let window: i64 = call.arg(1)?;
                let increment: i64 = call.arg(2)?;

                self.hash_mut(key)?.insert(request_id, increment.to_string());
                let fields = self.hash_fields(key)?;

                if fields.len() == 1 {
                    self.pexpire(key, window);
                }

                Ok(field_array(fields))
            }
            ScriptId::RegionHashFields => Ok(field_array(self.hash_fields(call.key(0)?)?)),
            ScriptId::RegionSlidingWindowLimit => {
                let (current_key, previous_key) = (call.key(0)?, call.key(1)?);
                let limit: i64 = call.arg(0)?;
                let now: i64 = call.arg(1)?;
                let window: i64 = call.arg(2)?;
                let request_id = call.args.get(3).cloned().unwrap_or_default();
                let increment: i64 = call.arg(4)?;

                let current_fields = self.hash_fields(current_key)?;
                let previous_fields = self.hash_fields(previous_key)?;

                let current = sum_fields(&current_fields);
                let weighted = weigh(sum_fields(&previous_fields), now, window);

                let allowed = current + weighted + increment <= limit;

                if allowed {
                    self.hash_mut(current_key)?.insert(request_id, increment.to_string());

                    if current == 0 {
                        self.pexpire(current_key, window * 2 + 1000);
                    }
                }

                Ok(Value::Array(vec![
                    field_array(current_fields),
                    field_array(previous_fields),
                    Value::Int(i64::from(allowed)),
                ]))
            }
            ScriptId::RegionSlidingWindowRemaining => {
                let current = self.hash_fields(call.key(0)?)?;
                let previous = self.hash_fields(call.key(1)?)?;

                Ok(Value::Array(vec![field_array(current), field_array(previous)]))
            }
            ScriptId::RegionBackfill => {
                let key = call.key(0)?;
                let ttl: i64 = call.arg(0)?;

                let pairs = call.args.get(1..).unwrap_or_default();
                let hash = self.hash_mut(key)?;

                for pair in pairs.chunks_exact(2) {
                    hash.insert(pair[0].clone(), pair[1].clone());
                }

                if self.pttl(key) == -1 {
                    self.pexpire(key, ttl);
                }

                Ok(Value::Int((pairs.len() / 2) as i64))
            }
            ScriptId::ResetKeys => {
                let base = call.key(0)?;
                let pattern: String = call.arg(0)?;
                let now = self.now;

                let matching: Vec<String> = self
                    .entries
                    .iter()
                    .filter(|(_, entry)| entry.expires_at.is_none_or(|at| at > now))
                    .filter(|(key, _)| fast_glob::glob_match(&pattern, key.as_str()))
                    .filter(|(key, _)| owned_by(base, key.as_str()))
                    .map(|(key, _)| key.clone())
                    .collect();

                for key in &matching {
                    self.entries.remove(key);
                }

                Ok(Value::Int(matching.len() as i64))
            }
            ScriptId::DenyListCheck => {
                let (all_key, status_key) = (call.key(0)?, call.key(1)?);
                let members = self.members(all_key)?;

                let flags = call
                    .args
                    .iter()
                    .map(|value| Value::Int(i64::from(members.contains(value))))
                    .collect();

                let status = self.ttl(status_key);

                if status == -2 {
                    self.set_string(status_key, "pending", Some(30_000));
                }

                Ok(Value::Array(vec![Value::Array(flags), Value::Int(status)]))
            }
            ScriptId::DenyListUpdate => {
                let (all_key, ip_key, status_key) = (call.key(0)?, call.key(1)?, call.key(2)?);
                let ttl: i64 = call.arg(0)?;

                let previous_ips = self.members(ip_key)?;
                let mut all: BTreeSet<String> = self.members(all_key)?.difference(&previous_ips).cloned().collect();

                let ips: BTreeSet<String> = call
                    .args
                    .iter()
                    .skip(1)
                    .filter(|ip| !all.contains(*ip))
                    .cloned()
                    .collect();

                all.extend(ips.iter().cloned());
                let count = ips.len() as i64;

                self.store_set(all_key, all);
                self.store_set(ip_key, ips);
                self.set_string(status_key, "valid", Some(ttl));

                Ok(Value::Int(count))
            }
            ScriptId::DenyListDisable => {
                let (all_key, ip_key, status_key) = (call.key(0)?, call.key(1)?, call.key(2)?);

                let ips = self.members(ip_key)?;
                let all = self.members(all_key)?.difference(&ips).cloned().collect();

                self.store_set(all_key, all);
                self.del(ip_key);
                self.set_string(status_key, "disabled", None);

                Ok(Value::Int(1))
            }
            ScriptId::DenyListAdd => {
                let mut members = self.members(call.key(0)?)?;
                let before = members.len();

                members.extend(call.args.iter().cloned());
                let added = members.len() - before;

                self.store_set(call.key(0)?, members);

                Ok(Value::Int(added as i64))
            }
            ScriptId::DenyListRemove => {
                let mut members = self.members(call.key(0)?)?;
                let before = members.len();

                for value in call.args {
                    members.remove(value);
                }

                let removed = before - members.len();
                self.store_set(call.key(0)?, members);

                Ok(Value::Int(removed as i64))
            }
            ScriptId::AnalyticsRecord => {
                let key = call.key(0)?;
                let event = call.args.first().cloned().unwrap_or_default();
                let retention: i64 = call.arg(1)?;

                let hash = self.hash_mut(key)?;
                let count = hash.get(&event).and_then(|v| v.parse::<i64>().ok()).unwrap_or(0) + 1;
                hash.insert(event, count.to_string());

                if self.pttl(key) == -1 {
                    self.pexpire(key, retention);
                }

                Ok(Value::Int(count))
            }
            ScriptId::AnalyticsRead => Ok(field_array(self.hash_fields(call.key(0)?)?)),
        }
    }

    fn evict(&mut self, key: &str) {
        let now = self.now;

        let expired = self
            .entries
            .get(key)
            .is_some_and(|entry| entry.expires_at.is_some_and(|at| at <= now));

        if expired {
            self.entries.remove(key);
        }
    }

    fn entry(&mut self, key: &str) -> Option<&mut Entry> {
        self.evict(key);
        self.entries.get_mut(key)
    }

    fn get_int(&mut self, key: &str) -> Result<i64, StorageError> {
        match self.entry(key).map(|entry| &entry.data) {
            None => Ok(0),
            Some(Data::String(value)) => value
                .parse()
                .map_err(|_| StorageError::Query("ERR value is not an integer or out of range".to_string())),
            Some(_) => Err(wrong_type()),
        }
    }

    fn incr_by(&mut self, key: &str, increment: i64) -> Result<i64, StorageError> {
        let value = self.get_int(key)? + increment;

        match self.entry(key) {
            Some(entry) => entry.data = Data::String(value.to_string()),
            None => {
                self.entries
                    .insert(key.to_string(), Entry::new(Data::String(value.to_string())));
            }
        }

        Ok(value)
    }

    fn set_string(&mut self, key: &str, value: &str, ttl: Option<i64>) {
        let mut entry = Entry::new(Data::String(value.to_string()));
        entry.expires_at = ttl.map(|ttl| self.now + ttl);

        self.entries.insert(key.to_string(), entry);
    }

    fn pexpire(&mut self, key: &str, ttl: i64) {
        if ttl <= 0 {
            self.del(key);
            return;
        }

        let now = self.now;

        if let Some(entry) = self.entry(key) {
            entry.expires_at = Some(now + ttl);
        }
    }

    fn pttl(&mut self, key: &str) -> i64 {
        let now = self.now;

        match self.entry(key) {
            None => -2,
            Some(Entry { expires_at: None, .. }) => -1,
            Some(Entry {
                expires_at: Some(at), ..
            }) => *at - now,
        }
    }

    fn ttl(&mut self, key: &str) -> i64 {
        match self.pttl(key) {
            ttl if ttl < 0 => ttl,
            ttl => (ttl + 500) / 1000,
        }
    }

    fn del(&mut self, key: &str) -> bool {
        self.evict(key);
        self.entries.remove(key).is_some()
    }

    fn hash_fields(&mut self, key: &str) -> Result<Vec<(String, String)>, StorageError> {
        match self.entry(key).map(|entry| &entry.data) {
            None => Ok(Vec::new()),
            Some(Data::Hash(hash)) => Ok(hash.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            Some(_) => Err(wrong_type()),
        }
    }

    fn hash_mut(&mut self, key: &str) -> Result<&mut BTreeMap<String, String>, StorageError> {
        self.evict(key);

        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Data::Hash(BTreeMap::new())));

        match &mut entry.data {
            Data::Hash(hash) => Ok(hash),
            _ => Err(wrong_type()),
        }
    }

    fn members(&mut self, key: &str) -> Result<BTreeSet<String>, StorageError> {
        match self.entry(key).map(|entry| &entry.data) {
            None => Ok(BTreeSet::new()),
            Some(Data::Set(set)) => Ok(set.clone()),
            Some(_) => Err(wrong_type()),
        }
    }

    /// Replace a set, dropping its TTL. Empty sets do not exist.
    fn store_set(&mut self, key: &str, members: BTreeSet<String>) {
        if members.is_empty() {
            self.entries.remove(key);
        } else {
            self.entries.insert(key.to_string(), Entry::new(Data::Set(members)));
        }
    }

    fn refill(
        &mut self,
        key: &str,
        max_tokens: i64,
        interval: i64,
        refill_rate: i64,
        now: i64,
    ) -> Result<(i64, i64), StorageError> {
        let fields: HashMap<String, String> = self.hash_fields(key)?.into_iter().collect();

        let stored = fields
            .get("refilledAt")
            .zip(fields.get("tokens"))
            .and_then(|(at, tokens)| Some((at.parse::<i64>().ok()?, tokens.parse::<i64>().ok()?)));

        let Some((mut refilled_at, mut tokens)) = stored else {
            return Ok((max_tokens, now));
        };

        if now >= refilled_at + interval {
            let refills = (now - refilled_at) / interval;
            tokens = max_tokens.min(tokens + refills * refill_rate);
            refilled_at += refills * interval;
        }

        Ok((tokens, refilled_at))
    }
}

fn wrong_type() -> StorageError {
    StorageError::Query("WRONGTYPE Operation against a key holding the wrong kind of value".to_string())
}

fn weigh(previous: i64, now: i64, window: i64) -> i64 {
    previous * (window - now.rem_euclid(window)) / window
}

fn sum_fields(fields: &[(String, String)]) -> i64 {
    fields.iter().filter_map(|(_, value)| value.parse::<i64>().ok()).sum()
}

fn int_array<const N: usize>(values: [i64; N]) -> Value {
    Value::Array(values.into_iter().map(Value::Int).collect())
}

fn field_array(fields: Vec<(String, String)>) -> Value {
    Value::Array(
        fields
            .into_iter()
            .flat_map(|(field, value)| [field, value])
            .map(|s| Value::BulkString(s.into_bytes()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::script::*;

    fn store() -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = MemoryStore::with_clock(clock.clone());

        (clock, store)
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn fixed_window_counter_expires() {
        let (clock, store) = store();
        let keys = strings(&["rl:id:1"]);
        let args = strings(&["1000", "1"]);

        for expected in 1..=3 {
            let count = store.exec(&FIXED_WINDOW_LIMIT, &keys, &args).await.unwrap();
            assert_eq!(count, Value::Int(expected));
        }

        clock.advance(Duration::from_millis(1000));

        let count = store.exec(&FIXED_WINDOW_REMAINING, &keys, &[]).await.unwrap();
        assert_eq!(count, Value::Int(0));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn reset_keys_matches_pattern() {
        let (_, store) = store();
        let args = strings(&["60000", "1"]);

        for key in ["rl:a:1", "rl:a:2", "rl:b:1"] {
            store.exec(&FIXED_WINDOW_LIMIT, &strings(&[key]), &args).await.unwrap();
        }

        let deleted = store
            .exec(&RESET_KEYS, &strings(&["rl:a"]), &[reset_pattern("rl:a")])
            .await
            .unwrap();

        assert_eq!(deleted, Value::Int(2));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn reset_keys_takes_identifiers_literally() {
        let (_, store) = store();
        let args = strings(&["60000", "1"]);

        for key in ["rl:*:1", "rl:a:1", "rl:a:b:1", "rl:ab:1"] {
            store.exec(&FIXED_WINDOW_LIMIT, &strings(&[key]), &args).await.unwrap();
        }

        let deleted = store
            .exec(&RESET_KEYS, &strings(&["rl:*"]), &[reset_pattern("rl:*")])
            .await
            .unwrap();
        assert_eq!(deleted, Value::Int(1));

        let deleted = store
            .exec(&RESET_KEYS, &strings(&["rl:a"]), &[reset_pattern("rl:a")])
            .await
            .unwrap();
        assert_eq!(deleted, Value::Int(1));

        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn deny_list_update_keeps_manual_entries() {
        let (_, store) = store();
        let keys = strings(&["rl:denyList:all", "rl:denyList:ipDenyList", "rl:ipDenyListStatus"]);

        store
            .exec(&DENY_LIST_ADD, &keys[..1], &strings(&["1.1.1.1", "bad-user"]))
            .await
            .unwrap();

        let added = store
            .exec(&DENY_LIST_UPDATE, &keys, &strings(&["60000", "1.1.1.1", "2.2.2.2"]))
            .await
            .unwrap();

        // 1.1.1.1 was denied by hand, so the IP list does not own it.
        assert_eq!(added, Value::Int(1));

        store.exec(&DENY_LIST_DISABLE, &keys, &[]).await.unwrap();

        let reply = store
            .exec(&DENY_LIST_CHECK, &keys[..2], &strings(&["1.1.1.1", "2.2.2.2", "bad-user"]))
            .await
            .unwrap();

        let (members, status): (Vec<i64>, i64) = redis::from_redis_value(&reply).unwrap();

        assert_eq!(members, [1, 0, 1]);
        assert_eq!(status, -1);
    }

    #[tokio::test]
    async fn wrong_type_is_a_query_error() {
        let (_, store) = store();

        store
            .exec(&DENY_LIST_ADD, &strings(&["key"]), &strings(&["value"]))
            .await
            .unwrap();

        let error = store
            .exec(&FIXED_WINDOW_LIMIT, &strings(&["key"]), &strings(&["1000", "1"]))
            .await
            .unwrap_err();

        assert!(matches!(error, StorageError::Query(_)));
    }
}
