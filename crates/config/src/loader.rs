use std::path::Path;

use anyhow::bail;
use indoc::indoc;
use url::Url;

use crate::{AlgorithmConfig, Config, RedisConfig, StorageConfig};

pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())?;
    parse(&content)
}

pub fn parse(content: &str) -> anyhow::Result<Config> {
    let config: Config = toml::from_str(content)?;

    for warning in validate(&config)? {
        log::warn!("{warning}");
    }

    Ok(config)
}

/// Validates the configuration and returns warnings.
pub(crate) fn validate(config: &Config) -> anyhow::Result<Vec<String>> {
    let mut warnings = Vec::new();

    if config.prefix.is_empty() {
        bail!("The key prefix must not be empty");
    }

    validate_algorithm(config)?;
    validate_storage(config)?;

    let threshold = config.deny_list.threshold;

    if !(1..=8).contains(&threshold) {
        bail!("Deny list threshold must be an integer between 1 and 8, got {threshold}");
    }

    if config.timeout.is_zero() {
        warnings.push("The decision timeout is disabled, a slow store will delay every request".to_string());
    }

    if config.deny_list.enabled && matches!(config.storage, StorageConfig::Memory) {
        warnings.push("The deny list is stored in-process and will not be shared with other instances".to_string());
    }

    Ok(warnings)
}

fn validate_algorithm(config: &Config) -> anyhow::Result<()> {
    let algorithm = &config.algorithm;

    match algorithm {
        AlgorithmConfig::FixedWindow { limit, .. }
        | AlgorithmConfig::SlidingWindow { limit, .. }
        | AlgorithmConfig::CachedFixedWindow { limit, .. }
            if *limit == 0 =>
        {
            bail!("The {} limit must be greater than zero", algorithm.name());
        }
        AlgorithmConfig::TokenBucket {
            refill_rate,
            max_tokens,
            ..
        } if *refill_rate == 0 || *max_tokens == 0 => {
            bail!("The token bucket refill_rate and max_tokens must be greater than zero");
        }
        AlgorithmConfig::CachedFixedWindow { .. } if !config.ephemeral_cache => {
            bail!(indoc! {r#"
                The cached_fixed_window algorithm keeps its counters in the ephemeral cache.

                Enable it at the top level of the configuration:

                  ephemeral_cache = true
            "#});
        }
        _ => Ok(()),
    }
}

fn validate_storage(config: &Config) -> anyhow::Result<()> {
    match &config.storage {
        StorageConfig::Memory => Ok(()),
        StorageConfig::Redis(redis) => validate_redis(redis),
        StorageConfig::MultiRegion(multi) => {
            if multi.regions.is_empty() {
                bail!("Multi-region storage needs at least one region");
            }

            if !matches!(
                config.algorithm,
                AlgorithmConfig::FixedWindow { .. } | AlgorithmConfig::SlidingWindow { .. }
            ) {
                bail!(
                    "The {} algorithm is not supported in multi-region mode, use fixed_window or sliding_window",
                    config.algorithm.name()
                );
            }

            multi.regions.iter().try_for_each(validate_redis)
        }
    }
}

fn validate_redis(redis: &RedisConfig) -> anyhow::Result<()> {
    if redis.url.trim().is_empty() {
        bail!("Missing Redis URL in the storage configuration");
    }

    let url = Url::parse(&redis.url).map_err(|e| anyhow::anyhow!("Invalid Redis URL '{}': {e}", redis.url))?;

    if !matches!(url.scheme(), "redis" | "rediss" | "redis+unix" | "unix") {
        bail!("Unsupported Redis URL scheme '{}'", url.scheme());
    }

    if redis.retry.attempts == 0 {
        bail!("Redis retry attempts must be at least 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use insta::{assert_debug_snapshot, assert_snapshot};

    use crate::Config;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();

        assert_eq!(config.prefix, "ratelimit");
        assert_eq!(config.timeout.as_millis(), 5000);
        assert!(config.ephemeral_cache);
        assert!(!config.deny_list.enabled);
        assert!(!config.analytics.enabled);
        assert!(config.telemetry.metrics_otlp_config().is_none());

        assert_debug_snapshot!(config.algorithm, @r"
        SlidingWindow {
            limit: 10,
            window: Window {
                value: 10,
                unit: Seconds,
            },
        }
        ");
    }

    #[test]
    fn full_configuration() {
        let config = Config::parse(indoc! {r#"
            prefix = "api"
            timeout = "250ms"
            ephemeral_cache = true

            [algorithm]
            type = "cached_fixed_window"
            limit = 100
            window = "1m"

            [storage]
            type = "redis"
            url = "redis://localhost:6379/0"

            [deny_list]
            enabled = true
            threshold = 3
            refresh_ttl = "1h"

            [analytics]
            enabled = true
        "#})
        .unwrap();

        assert_eq!(config.prefix, "api");
        assert_eq!(config.timeout.as_millis(), 250);
        assert_eq!(config.algorithm.name(), "cached_fixed_window");
        assert_eq!(config.deny_list.threshold, 3);
        assert!(config.analytics.enabled);
    }

    #[test]
    fn threshold_out_of_range() {
        let error = Config::parse(indoc! {r#"
            [deny_list]
            enabled = true
            threshold = 9
        "#})
        .unwrap_err();

        assert_snapshot!(error, @"Deny list threshold must be an integer between 1 and 8, got 9");
    }

    #[test]
    fn cached_fixed_window_needs_the_cache() {
        let error = Config::parse(indoc! {r#"
            ephemeral_cache = false

            [algorithm]
            type = "cached_fixed_window"
            limit = 10
            window = "10s"
        "#})
        .unwrap_err();

        assert_snapshot!(error, @r#"
        The cached_fixed_window algorithm keeps its counters in the ephemeral cache.

        Enable it at the top level of the configuration:

          ephemeral_cache = true
        "#);
    }

    #[test]
    fn multi_region_rejects_token_bucket() {
        let error = Config::parse(indoc! {r#"
            [algorithm]
            type = "token_bucket"
            refill_rate = 1
            interval = "1s"
            max_tokens = 5

            [storage]
            type = "multi_region"

            [[storage.regions]]
            url = "redis://localhost:6379"
        "#})
        .unwrap_err();

        assert_snapshot!(error, @"The token_bucket algorithm is not supported in multi-region mode, use fixed_window or sliding_window");
    }

    #[test]
    fn missing_redis_url() {
        let error = Config::parse(indoc! {r#"
            [storage]
            type = "redis"
            url = ""
        "#})
        .unwrap_err();

        assert_snapshot!(error, @"Missing Redis URL in the storage configuration");
    }

    #[test]
    fn zero_limit() {
        let error = Config::parse(indoc! {r#"
            [algorithm]
            type = "fixed_window"
            limit = 0
            window = "10s"
        "#})
        .unwrap_err();

        assert_snapshot!(error, @"The fixed_window limit must be greater than zero");
    }

    #[test]
    fn disabled_timeout_warns() {
        let config = Config::parse(r#"timeout = "0s""#).unwrap();
        let warnings = config.validate().unwrap();

        assert_debug_snapshot!(warnings, @r#"
        [
            "The decision timeout is disabled, a slow store will delay every request",
        ]
        "#);
    }

    #[test]
    fn load_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "prefix = \"from-file\"").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.prefix, "from-file");
    }
}
