//! Redis-backed store executing scripts by hash.

use std::time::Duration;

use dashmap::DashMap;
use redis::{Value, aio::MultiplexedConnection};
use telemetry::metrics::{RATELIMIT_STORE_SCRIPT_DURATION, Recorder};

use super::redis_pool::{self, Pool};
use super::{StorageError, Store};
use crate::script::{Script, ScriptId};
use config::{RedisConfig, RedisRetryConfig};

/// Redis-based store implementation.
pub struct RedisStore {
    pool: Pool,
    hashes: DashMap<ScriptId, String>,
    response_timeout: Option<Duration>,
    retry: RedisRetryConfig,
}

impl RedisStore {
    /// Connect to Redis, failing when the server does not answer a PING.
    pub async fn new(config: &RedisConfig) -> Result<Self, StorageError> {
        let pool = redis_pool::create_pool(config)
            .map_err(|e| StorageError::Connection(format!("Failed to create Redis connection pool: {e}")))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| StorageError::Connection(format!("Failed to get Redis connection from pool: {e}")))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| StorageError::Connection(format!("Failed to ping Redis server: {e}")))?;

        log::debug!("Connected to Redis at {}", redact(&config.url));

        Ok(Self {
            pool,
            hashes: DashMap::new(),
            response_timeout: config.response_timeout,
            retry: config.retry.clone(),
        })
    }

    fn hash(&self, script: &Script) -> String {
        self.hashes
            .entry(script.id())
            .or_insert_with(|| redis::Script::new(script.source()).get_hash().to_string())
            .clone()
    }

    async fn exec_once(&self, script: &'static Script, keys: &[String], args: &[String]) -> Result<Value, StorageError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StorageError::Connection(format!("Failed to get Redis connection from pool: {e}")))?;

        let mut conn = Connection {
            conn: &mut *conn,
            timeout: self.response_timeout,
        };

        eval_or_load(&mut conn, script, &self.hash(script), keys, args).await
    }
}

/// The two commands the executor sends over a connection.
#[async_trait::async_trait]
trait ScriptConnection: Send {
    async fn evalsha(&mut self, hash: &str, keys: &[String], args: &[String]) -> Result<Value, StorageError>;

    /// `SCRIPT LOAD`, replying with the hash Redis computed.
    async fn load(&mut self, source: &str) -> Result<String, StorageError>;
}

struct Connection<'a> {
    conn: &'a mut MultiplexedConnection,
    timeout: Option<Duration>,
}

impl Connection<'_> {
    async fn query<T: redis::FromRedisValue>(&mut self, cmd: &redis::Cmd) -> Result<T, StorageError> {
        let Some(timeout) = self.timeout else {
            return Ok(cmd.query_async(&mut *self.conn).await?);
        };

        match tokio::time::timeout(timeout, cmd.query_async(&mut *self.conn)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StorageError::Timeout(timeout)),
        }
    }
}

#[async_trait::async_trait]
impl ScriptConnection for Connection<'_> {
    async fn evalsha(&mut self, hash: &str, keys: &[String], args: &[String]) -> Result<Value, StorageError> {
        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(hash).arg(keys.len());

        for key in keys {
            cmd.arg(key);
        }

        for arg in args {
            cmd.arg(arg);
        }

        self.query(&cmd).await
    }

    async fn load(&mut self, source: &str) -> Result<String, StorageError> {
        self.query(redis::cmd("SCRIPT").arg("LOAD").arg(source)).await
    }
}

/// Run `script` by hash. When the store does not know it, load it and run it once more.
async fn eval_or_load<C: ScriptConnection>(
    conn: &mut C,
    script: &Script,
    hash: &str,
    keys: &[String],
    args: &[String],
) -> Result<Value, StorageError> {
    match conn.evalsha(hash, keys, args).await {
        Err(StorageError::NoScript) => {
            log::debug!("Script {} is not loaded, loading it", script.name());

            let loaded = conn.load(script.source()).await?;

            if loaded != hash {
                return Err(StorageError::Internal(format!(
                    "Redis loaded script {} as {loaded}, expected {hash}",
                    script.name()
                )));
            }

            conn.evalsha(hash, keys, args).await
        }
        result => result,
    }
}

/// Run `op` until it succeeds, fails for good, or the attempts are used up.
///
/// Transient errors are retried after `policy.backoff`, doubled for every
/// further retry. Errors after which the store may have run the script are only
/// retried for idempotent scripts.
async fn retry<F, Fut>(policy: &RedisRetryConfig, script: &Script, mut op: F) -> Result<Value, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Value, StorageError>>,
{
    let mut backoff = policy.backoff;
    let mut attempt = 1;

    loop {
        match op().await {
            Err(error)
                if error.is_transient()
                    && (script.id().is_idempotent() || !error.may_have_run())
                    && attempt < policy.attempts =>
            {
                log::warn!(
                    "Script {} failed on attempt {attempt}/{}: {error}, retrying in {backoff:?}",
                    script.name(),
                    policy.attempts
                );

                tokio::time::sleep(backoff).await;

                backoff *= 2;
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[async_trait::async_trait]
impl Store for RedisStore {
    async fn exec(&self, script: &'static Script, keys: &[String], args: &[String]) -> Result<Value, StorageError> {
        let mut recorder = Recorder::new(RATELIMIT_STORE_SCRIPT_DURATION);
        recorder.push_attribute("script", script.name());

        let result = retry(&self.retry, script, || self.exec_once(script, keys, args)).await;

        if let Err(ref error) = result {
            log::debug!("Script {} failed: {error}", script.name());
        }

        recorder.push_attribute("status", if result.is_ok() { "success" } else { "error" });
        recorder.record();

        result
    }
}

/// Strip credentials from a connection URL before logging it.
fn redact(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        Ok(parsed) => parsed.to_string(),
        Err(_) => "<invalid url>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::script::{FIXED_WINDOW_LIMIT, FIXED_WINDOW_REMAINING};

    /// Replies to EVALSHA from a queue, then with `1`.
    struct Scripted {
        replies: VecDeque<Result<Value, StorageError>>,
        loaded: &'static str,
        evals: usize,
        loads: usize,
    }

    impl Scripted {
        fn new(replies: Vec<Result<Value, StorageError>>, loaded: &'static str) -> Self {
            Self {
                replies: replies.into(),
                loaded,
                evals: 0,
                loads: 0,
            }
        }
    }

    #[async_trait::async_trait]
    impl ScriptConnection for Scripted {
        async fn evalsha(&mut self, _: &str, _: &[String], _: &[String]) -> Result<Value, StorageError> {
            self.evals += 1;
            self.replies.pop_front().unwrap_or(Ok(Value::Int(1)))
        }

        async fn load(&mut self, _: &str) -> Result<String, StorageError> {
            self.loads += 1;
            Ok(self.loaded.to_string())
        }
    }

    fn policy(attempts: u32) -> RedisRetryConfig {
        RedisRetryConfig {
            attempts,
            backoff: Duration::from_millis(10),
        }
    }

    fn connection_refused() -> StorageError {
        StorageError::Connection("connection refused".to_string())
    }

    #[tokio::test]
    async fn unknown_script_is_loaded_and_run_again() {
        let mut conn = Scripted::new(vec![Err(StorageError::NoScript)], "abc");

        let reply = eval_or_load(&mut conn, &FIXED_WINDOW_LIMIT, "abc", &[], &[]).await.unwrap();

        assert_eq!(reply, Value::Int(1));
        assert_eq!((conn.evals, conn.loads), (2, 1));
    }

    #[tokio::test]
    async fn script_is_loaded_at_most_once_per_call() {
        let mut conn = Scripted::new(vec![Err(StorageError::NoScript), Err(StorageError::NoScript)], "abc");

        let error = eval_or_load(&mut conn, &FIXED_WINDOW_LIMIT, "abc", &[], &[]).await.unwrap_err();

        assert!(matches!(error, StorageError::NoScript));
        assert_eq!((conn.evals, conn.loads), (2, 1));
    }

    #[tokio::test]
    async fn loaded_hash_must_match() {
        let mut conn = Scripted::new(vec![Err(StorageError::NoScript)], "def");

        let error = eval_or_load(&mut conn, &FIXED_WINDOW_LIMIT, "abc", &[], &[]).await.unwrap_err();

        assert!(matches!(error, StorageError::Internal(_)));
        assert_eq!((conn.evals, conn.loads), (1, 1));
    }

    #[tokio::test]
    async fn known_script_is_not_loaded() {
        let mut conn = Scripted::new(vec![Ok(Value::Int(7))], "abc");

        let reply = eval_or_load(&mut conn, &FIXED_WINDOW_LIMIT, "abc", &[], &[]).await.unwrap();

        assert_eq!(reply, Value::Int(7));
        assert_eq!((conn.evals, conn.loads), (1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_back_off_exponentially() {
        let start = tokio::time::Instant::now();
        let mut calls = 0;

        let reply = retry(&policy(4), &FIXED_WINDOW_LIMIT, || {
            calls += 1;
            let reply = if calls < 4 { Err(connection_refused()) } else { Ok(Value::Int(1)) };
            async move { reply }
        })
        .await
        .unwrap();

        assert_eq!(reply, Value::Int(1));
        assert_eq!(calls, 4);
        assert_eq!(start.elapsed(), Duration::from_millis(10 + 20 + 40));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_last_attempt() {
        let start = tokio::time::Instant::now();
        let mut calls = 0;

        let error = retry(&policy(3), &FIXED_WINDOW_LIMIT, || {
            calls += 1;
            async { Err(connection_refused()) }
        })
        .await
        .unwrap_err();

        assert!(matches!(error, StorageError::Connection(_)));
        assert_eq!(calls, 3);
        assert_eq!(start.elapsed(), Duration::from_millis(10 + 20));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_commands_are_not_retried() {
        let start = tokio::time::Instant::now();
        let mut calls = 0;

        let error = retry(&policy(3), &FIXED_WINDOW_REMAINING, || {
            calls += 1;
            async { Err(StorageError::Query("WRONGTYPE".to_string())) }
        })
        .await
        .unwrap_err();

        assert!(matches!(error, StorageError::Query(_)));
        assert_eq!(calls, 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_retry_only_idempotent_scripts() {
        let timeout = || StorageError::Timeout(Duration::from_millis(100));

        let mut calls = 0;
        let error = retry(&policy(3), &FIXED_WINDOW_LIMIT, || {
            calls += 1;
            let reply = Err(timeout());
            async move { reply }
        })
        .await
        .unwrap_err();

        assert!(matches!(error, StorageError::Timeout(_)));
        assert_eq!(calls, 1);

        let mut calls = 0;
        let reply = retry(&policy(3), &FIXED_WINDOW_REMAINING, || {
            calls += 1;
            let reply = if calls == 1 { Err(timeout()) } else { Ok(Value::Int(2)) };
            async move { reply }
        })
        .await
        .unwrap();

        assert_eq!(reply, Value::Int(2));
        assert_eq!(calls, 2);
    }
}
