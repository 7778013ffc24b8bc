//! Where counters, deny lists and analytics are kept.

use std::time::Duration;

use duration_str::{deserialize_duration, deserialize_option_duration};
use serde::Deserialize;

/// The backing store.
///
/// ```toml
/// [storage]
/// type = "redis"
/// url = "rediss://cache.internal:6380/0"
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Keep everything in this process.
    #[default]
    Memory,
    /// One Redis-compatible server shared by every instance.
    Redis(Box<RedisConfig>),
    /// One independent Redis-compatible server per region.
    MultiRegion(MultiRegionConfig),
}

/// Regional stores, each holding a full copy of the limiter keys.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MultiRegionConfig {
    /// The first region also keeps the deny list and analytics.
    pub regions: Vec<RedisConfig>,
}

/// A Redis-compatible server.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    /// `redis://`, or `rediss://` for TLS.
    pub url: String,
    /// Connection pool sizing and timeouts.
    #[serde(default)]
    pub pool: RedisPoolConfig,
    /// Certificates for `rediss://` URLs.
    pub tls: Option<RedisTlsConfig>,
    /// How long one script may take before it counts as a transient failure.
    #[serde(
        default = "default_response_timeout",
        deserialize_with = "deserialize_option_duration"
    )]
    pub response_timeout: Option<Duration>,
    /// Retries of transient failures.
    #[serde(default)]
    pub retry: RedisRetryConfig,
}

fn default_response_timeout() -> Option<Duration> {
    Some(Duration::from_secs(1))
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379/0".to_string(),
            pool: RedisPoolConfig::default(),
            tls: None,
            response_timeout: default_response_timeout(),
            retry: RedisRetryConfig::default(),
        }
    }
}

/// Sizing and timeouts of the connection pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RedisPoolConfig {
    /// Open connections at most.
    pub max_size: Option<usize>,
    /// Opening a connection.
    #[serde(deserialize_with = "deserialize_option_duration")]
    pub timeout_create: Option<Duration>,
    /// Waiting for a free connection.
    #[serde(deserialize_with = "deserialize_option_duration")]
    pub timeout_wait: Option<Duration>,
    /// Health-checking a connection before reuse.
    #[serde(deserialize_with = "deserialize_option_duration")]
    pub timeout_recycle: Option<Duration>,
}

impl Default for RedisPoolConfig {
    fn default() -> Self {
        Self {
            max_size: Some(16),
            timeout_create: Some(Duration::from_secs(5)),
            timeout_wait: Some(Duration::from_secs(5)),
            timeout_recycle: Some(Duration::from_secs(300)),
        }
    }
}

/// Certificates for TLS connections.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisTlsConfig {
    /// Skip server certificate verification.
    pub insecure: Option<bool>,
    /// PEM file with the CA that signed the server certificate.
    pub ca_cert_path: Option<String>,
    /// PEM client certificate, for mutual TLS.
    pub client_cert_path: Option<String>,
    /// PEM client key, for mutual TLS.
    pub client_key_path: Option<String>,
}

/// Bounded exponential backoff for transient store failures.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RedisRetryConfig {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Delay before the first retry, doubled for every further retry.
    #[serde(deserialize_with = "deserialize_duration")]
    pub backoff: Duration,
}

impl Default for RedisRetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_is_the_default() {
        insta::assert_debug_snapshot!(StorageConfig::default(), @"Memory");

        let config: StorageConfig = toml::from_str(r#"type = "memory""#).unwrap();
        insta::assert_debug_snapshot!(config, @"Memory");
    }

    #[test]
    fn redis_defaults() {
        let config: StorageConfig = toml::from_str(
            r#"
            type = "redis"
            url = "redis://localhost:6379/0"
        "#,
        )
        .unwrap();

        let StorageConfig::Redis(redis) = config else {
            unreachable!("expected redis storage");
        };

        assert_eq!(redis.pool.max_size, Some(16));
        assert_eq!(redis.response_timeout, Some(Duration::from_secs(1)));
        assert_eq!(redis.retry.attempts, 3);
        assert_eq!(redis.retry.backoff, Duration::from_millis(50));
        assert!(redis.tls.is_none());
    }

    #[test]
    fn redis_with_tls_and_retries() {
        let config: StorageConfig = toml::from_str(
            r#"
            type = "redis"
            url = "rediss://cache.internal:6380/0"
            response_timeout = "250ms"

            [pool]
            max_size = 4
            timeout_wait = "100ms"

            [tls]
            ca_cert_path = "/etc/ratelimit/ca.pem"

            [retry]
            attempts = 5
            backoff = "10ms"
        "#,
        )
        .unwrap();

        insta::assert_debug_snapshot!(config, @r#"
        Redis(
            RedisConfig {
                url: "rediss://cache.internal:6380/0",
                pool: RedisPoolConfig {
                    max_size: Some(
                        4,
                    ),
                    timeout_create: Some(
                        5s,
                    ),
                    timeout_wait: Some(
                        100ms,
                    ),
                    timeout_recycle: Some(
                        300s,
                    ),
                },
                tls: Some(
                    RedisTlsConfig {
                        insecure: None,
                        ca_cert_path: Some(
                            "/etc/ratelimit/ca.pem",
                        ),
                        client_cert_path: None,
                        client_key_path: None,
                    },
                ),
                response_timeout: Some(
                    250ms,
                ),
                retry: RedisRetryConfig {
                    attempts: 5,
                    backoff: 10ms,
                },
            },
        )
        "#);
    }

    #[test]
    fn multi_region_keeps_region_order() {
        let config: StorageConfig = toml::from_str(
            r#"
            type = "multi_region"

            [[regions]]
            url = "redis://eu.example.com:6379"

            [[regions]]
            url = "redis://us.example.com:6379"
            response_timeout = "500ms"
        "#,
        )
        .unwrap();

        let StorageConfig::MultiRegion(multi) = config else {
            unreachable!("expected multi-region storage");
        };

        let urls: Vec<_> = multi.regions.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, ["redis://eu.example.com:6379", "redis://us.example.com:6379"]);
        assert_eq!(multi.regions[1].response_timeout, Some(Duration::from_millis(500)));
    }
}
