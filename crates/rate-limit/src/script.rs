//! Atomic Lua scripts executed by the stores.
//!
//! Every script is identified by a [`ScriptId`]. The Redis store ships the Lua
//! source, the memory store reimplements each id natively with the same replies.
//! Scripts return `1`/`0` instead of booleans, because Redis turns a Lua `false`
//! into a nil reply.

/// Identifies an atomic script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptId {
    /// Increment a fixed window counter. Replies with the new count.
    FixedWindowLimit,
    /// Read a fixed window counter.
    FixedWindowRemaining,
    /// Check and increment a sliding window. Replies with the remaining tokens, `-1` when denied.
    SlidingWindowLimit,
    /// Replies with the weighted usage of a sliding window.
    SlidingWindowRemaining,
    /// Refill and take from a token bucket. Replies with `[remaining, reset]`.
    TokenBucketLimit,
    /// Refill a token bucket without taking. Replies with `[tokens, reset]`.
    TokenBucketRemaining,
    /// Record a request id in a multi-region fixed window. Replies with the hash fields.
    RegionFixedWindowLimit,
    /// Replies with the fields of a multi-region hash.
    RegionHashFields,
    /// Check and record a request id in a multi-region sliding window.
    RegionSlidingWindowLimit,
    /// Replies with the fields of the current and previous multi-region windows.
    RegionSlidingWindowRemaining,
    /// Write missing request ids into a region.
    RegionBackfill,
    /// Delete an identifier key and its bucket keys.
    ResetKeys,
    /// Probe deny list membership and the IP list status.
    DenyListCheck,
    /// Replace the IP deny list.
    DenyListUpdate,
    /// Drop the IP deny list and mark it disabled.
    DenyListDisable,
    /// Add values to the deny list.
    DenyListAdd,
    /// Remove values from the deny list.
    DenyListRemove,
    /// Count one analytics event.
    AnalyticsRecord,
    /// Read an analytics bucket.
    AnalyticsRead,
}

impl ScriptId {
    /// Whether running the script twice leaves the same state as running it once.
    ///
    /// Counting scripts are not: a retry after a lost reply counts the request twice.
    pub fn is_idempotent(self) -> bool {
        !matches!(
            self,
            ScriptId::FixedWindowLimit
                | ScriptId::SlidingWindowLimit
                | ScriptId::TokenBucketLimit
                | ScriptId::AnalyticsRecord
        )
    }
}

/// A Lua script with a stable identity.
#[derive(Debug)]
pub struct Script {
    id: ScriptId,
    name: &'static str,
    source: &'static str,
}

impl Script {
    const fn new(id: ScriptId, name: &'static str, source: &'static str) -> Self {
        Self { id, name, source }
    }

    /// The script identity.
    pub fn id(&self) -> ScriptId {
        self.id
    }

    /// Short name used in logs and metrics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The Lua source.
    pub fn source(&self) -> &'static str {
        self.source
    }
}

/// KEYS: counter. ARGV: window ms, increment.
pub static FIXED_WINDOW_LIMIT: Script = Script::new(
    ScriptId::FixedWindowLimit,
    "fixed_window_limit",
    r#"
local key = KEYS[1]
local window = ARGV[1]
local increment = tonumber(ARGV[2])

local count = redis.call("INCRBY", key, increment)
if count == increment then
  redis.call("PEXPIRE", key, window)
end

return count
"#,
);

/// KEYS: counter.
pub static FIXED_WINDOW_REMAINING: Script = Script::new(
    ScriptId::FixedWindowRemaining,
    "fixed_window_remaining",
    r#"
local count = redis.call("GET", KEYS[1])
if not count then
  return 0
end

return tonumber(count)
"#,
);

/// KEYS: current, previous. ARGV: limit, now, window ms, increment.
pub static SLIDING_WINDOW_LIMIT: Script = Script::new(
    ScriptId::SlidingWindowLimit,
    "sliding_window_limit",
    r#"
local current_key = KEYS[1]
local previous_key = KEYS[2]
local limit = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local window = tonumber(ARGV[3])
local increment = tonumber(ARGV[4])

local current = tonumber(redis.call("GET", current_key) or "0")
local previous = tonumber(redis.call("GET", previous_key) or "0")
local weighted = math.floor(previous * (window - now % window) / window)

if current + weighted + increment > limit then
  return -1
end

local count = redis.call("INCRBY", current_key, increment)
if count == increment then
  redis.call("PEXPIRE", current_key, window * 2 + 1000)
end

return limit - (count + weighted)
"#,
);

/// KEYS: current, previous. ARGV: now, window ms.
pub static SLIDING_WINDOW_REMAINING: Script = Script::new(
    ScriptId::SlidingWindowRemaining,
    "sliding_window_remaining",
    r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])

local current = tonumber(redis.call("GET", KEYS[1]) or "0")
local previous = tonumber(redis.call("GET", KEYS[2]) or "0")

return current + math.floor(previous * (window - now % window) / window)
"#,
);

/// KEYS: bucket. ARGV: max tokens, interval ms, refill rate, now, increment.
pub static TOKEN_BUCKET_LIMIT: Script = Script::new(
    ScriptId::TokenBucketLimit,
    "token_bucket_limit",
    r#"
local key = KEYS[1]
local max_tokens = tonumber(ARGV[1])
local interval = tonumber(ARGV[2])
local refill_rate = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local increment = tonumber(ARGV[5])

local bucket = redis.call("HMGET", key, "refilledAt", "tokens")
local refilled_at = now
local tokens = max_tokens

if bucket[1] then
  refilled_at = tonumber(bucket[1])
  tokens = tonumber(bucket[2])
end

if now >= refilled_at + interval then
  local refills = math.floor((now - refilled_at) / interval)
  tokens = math.min(max_tokens, tokens + refills * refill_rate)
  refilled_at = refilled_at + refills * interval
end

if tokens < increment then
  return {-1, refilled_at + interval}
end

local remaining = tokens - increment
local expire_at = math.ceil((max_tokens - remaining) / refill_rate) * interval

if expire_at > 0 then
  redis.call("HSET", key, "refilledAt", refilled_at, "tokens", remaining)
  redis.call("PEXPIRE", key, expire_at)
else
  redis.call("DEL", key)
end

return {remaining, refilled_at + interval}
"#,
);

/// KEYS: bucket. ARGV: max tokens, interval ms, refill rate, now.
pub static TOKEN_BUCKET_REMAINING: Script = Script::new(
    ScriptId::TokenBucketRemaining,
    "token_bucket_remaining",
    r#"
local max_tokens = tonumber(ARGV[1])
local interval = tonumber(ARGV[2])
local refill_rate = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

local bucket = redis.call("HMGET", KEYS[1], "refilledAt", "tokens")
if not bucket[1] then
  return {max_tokens, now + interval}
end

local refilled_at = tonumber(bucket[1])
local tokens = tonumber(bucket[2])

if now >= refilled_at + interval then
  local refills = math.floor((now - refilled_at) / interval)
  tokens = math.min(max_tokens, tokens + refills * refill_rate)
  refilled_at = refilled_at + refills * interval
end

return {tokens, refilled_at + interval}
"#,
);

/// KEYS: hash. ARGV: request id, window ms, increment.
pub static REGION_FIXED_WINDOW_LIMIT: Script = Script::new(
    ScriptId::RegionFixedWindowLimit,
    "region_fixed_window_limit",
    r#"
local key = KEYS[1]
local request_id = ARGV[1]
local window = ARGV[2]
local increment = ARGV[3]

redis.call("HSET", key, request_id, increment)
local fields = redis.call("HGETALL", key)
if #fields == 2 then
  redis.call("PEXPIRE", key, window)
end

return fields
"#,
);

/// KEYS: hash.
pub static REGION_HASH_FIELDS: Script = Script::new(
    ScriptId::RegionHashFields,
    "region_hash_fields",
    r#"
return redis.call("HGETALL", KEYS[1])
"#,
);

/// KEYS: current, previous. ARGV: limit, now, window ms, request id, increment.
pub static REGION_SLIDING_WINDOW_LIMIT: Script = Script::new(
    ScriptId::RegionSlidingWindowLimit,
    "region_sliding_window_limit",
    r#"
local current_key = KEYS[1]
local previous_key = KEYS[2]
local limit = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local window = tonumber(ARGV[3])
local request_id = ARGV[4]
local increment = tonumber(ARGV[5])

local current_fields = redis.call("HGETALL", current_key)
local current = 0
for i = 2, #current_fields, 2 do
  current = current + tonumber(current_fields[i])
end

local previous_fields = redis.call("HGETALL", previous_key)
local previous = 0
for i = 2, #previous_fields, 2 do
  previous = previous + tonumber(previous_fields[i])
end

local weighted = math.floor(previous * (window - now % window) / window)
if current + weighted + increment > limit then
  return {current_fields, previous_fields, 0}
end

redis.call("HSET", current_key, request_id, increment)
if current == 0 then
  redis.call("PEXPIRE", current_key, window * 2 + 1000)
end

return {current_fields, previous_fields, 1}
"#,
);

/// KEYS: current, previous.
pub static REGION_SLIDING_WINDOW_REMAINING: Script = Script::new(
    ScriptId::RegionSlidingWindowRemaining,
    "region_sliding_window_remaining",
    r#"
return {redis.call("HGETALL", KEYS[1]), redis.call("HGETALL", KEYS[2])}
"#,
);

/// KEYS: hash. ARGV: ttl ms, then request id and increment pairs.
pub static REGION_BACKFILL: Script = Script::new(
    ScriptId::RegionBackfill,
    "region_backfill",
    r#"
local key = KEYS[1]
local ttl = tonumber(ARGV[1])

for i = 2, #ARGV, 2 do
  redis.call("HSET", key, ARGV[i], ARGV[i + 1])
end

if redis.call("PTTL", key) == -1 then
  redis.call("PEXPIRE", key, ttl)
end

return (#ARGV - 1) / 2
"#,
);

/// KEYS: identifier key. ARGV: scan pattern from [`reset_pattern`].
///
/// Deletes the key itself and its `{key}:{bucket}` children, nothing else the
/// pattern happens to match.
pub static RESET_KEYS: Script = Script::new(
    ScriptId::ResetKeys,
    "reset_keys",
    r#"
local base = KEYS[1]
local nested = base .. ":"
local cursor = "0"
local deleted = 0

repeat
  local result = redis.call("SCAN", cursor, "MATCH", ARGV[1], "COUNT", 100)
  cursor = result[1]
  for _, key in ipairs(result[2]) do
    if key == base or (key:sub(1, #nested) == nested and key:sub(#nested + 1):match("^%d+$")) then
      deleted = deleted + redis.call("DEL", key)
    end
  end
until cursor == "0"

return deleted
"#,
);

/// Glob pattern matching `key` and every key starting with it.
///
/// Glob metacharacters in `key` are escaped, so identifiers match literally.
pub fn reset_pattern(key: &str) -> String {
    let mut pattern = String::with_capacity(key.len() + 1);

    for c in key.chars() {
        if matches!(c, '\\' | '*' | '?' | '[' | ']') {
            pattern.push('\\');
        }
        pattern.push(c);
    }

    pattern.push('*');
    pattern
}

/// Whether `candidate` is `key` or one of its bucket keys.
pub(crate) fn owned_by(key: &str, candidate: &str) -> bool {
    match candidate.strip_prefix(key) {
        Some("") => true,
        Some(rest) => rest
            .strip_prefix(':')
            .is_some_and(|bucket| !bucket.is_empty() && bucket.bytes().all(|b| b.is_ascii_digit())),
        None => false,
    }
}

/// KEYS: deny list set, IP list status. ARGV: values to probe.
pub static DENY_LIST_CHECK: Script = Script::new(
    ScriptId::DenyListCheck,
    "deny_list_check",
    r#"
local members = redis.call("SMISMEMBER", KEYS[1], unpack(ARGV))
local status = redis.call("TTL", KEYS[2])

if status == -2 then
  redis.call("SET", KEYS[2], "pending", "EX", 30)
end

return {members, status}
"#,
);

/// KEYS: deny list set, IP list set, IP list status. ARGV: ttl ms, then the IPs.
pub static DENY_LIST_UPDATE: Script = Script::new(
    ScriptId::DenyListUpdate,
    "deny_list_update",
    r#"
local all_key = KEYS[1]
local ip_key = KEYS[2]
local status_key = KEYS[3]
local ttl = tonumber(ARGV[1])

redis.call("SDIFFSTORE", all_key, all_key, ip_key)
redis.call("DEL", ip_key)

for i = 2, #ARGV, 1000 do
  redis.call("SADD", ip_key, unpack(ARGV, i, math.min(i + 999, #ARGV)))
end

redis.call("SDIFFSTORE", ip_key, ip_key, all_key)
redis.call("SUNIONSTORE", all_key, all_key, ip_key)
redis.call("SET", status_key, "valid", "PX", ttl)

return redis.call("SCARD", ip_key)
"#,
);

/// KEYS: deny list set, IP list set, IP list status.
pub static DENY_LIST_DISABLE: Script = Script::new(
    ScriptId::DenyListDisable,
    "deny_list_disable",
    r#"
redis.call("SDIFFSTORE", KEYS[1], KEYS[1], KEYS[2])
redis.call("DEL", KEYS[2])
redis.call("SET", KEYS[3], "disabled")

return 1
"#,
);

/// KEYS: deny list set. ARGV: values.
pub static DENY_LIST_ADD: Script = Script::new(
    ScriptId::DenyListAdd,
    "deny_list_add",
    r#"
return redis.call("SADD", KEYS[1], unpack(ARGV))
"#,
);

/// KEYS: deny list set. ARGV: values.
pub static DENY_LIST_REMOVE: Script = Script::new(
    ScriptId::DenyListRemove,
    "deny_list_remove",
    r#"
return redis.call("SREM", KEYS[1], unpack(ARGV))
"#,
);

/// KEYS: hourly bucket. ARGV: event, retention ms.
pub static ANALYTICS_RECORD: Script = Script::new(
    ScriptId::AnalyticsRecord,
    "analytics_record",
    r#"
local count = redis.call("HINCRBY", KEYS[1], ARGV[1], 1)

if redis.call("PTTL", KEYS[1]) == -1 then
  redis.call("PEXPIRE", KEYS[1], ARGV[2])
end

return count
"#,
);

/// KEYS: hourly bucket.
pub static ANALYTICS_READ: Script = Script::new(
    ScriptId::AnalyticsRead,
    "analytics_read",
    r#"
return redis.call("HGETALL", KEYS[1])
"#,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_pattern_escapes_glob_characters() {
        assert_eq!(reset_pattern("rl:id:user"), "rl:id:user*");
        assert_eq!(reset_pattern(r"rl:id:*?[a]\"), r"rl:id:\*\?\[a\]\\*");
    }

    #[test]
    fn owned_keys() {
        assert!(owned_by("rl:id:u", "rl:id:u"));
        assert!(owned_by("rl:id:u", "rl:id:u:28333333"));

        assert!(!owned_by("rl:id:u", "rl:id:u:"));
        assert!(!owned_by("rl:id:u", "rl:id:u:2:28333333"));
        assert!(!owned_by("rl:id:u", "rl:id:user:1"));
        assert!(!owned_by("rl:id:u", "rl:id:v:1"));
    }

    #[test]
    fn counting_scripts_are_not_idempotent() {
        assert!(!FIXED_WINDOW_LIMIT.id().is_idempotent());
        assert!(!TOKEN_BUCKET_LIMIT.id().is_idempotent());
        assert!(FIXED_WINDOW_REMAINING.id().is_idempotent());
        assert!(RESET_KEYS.id().is_idempotent());
    }
}
