//! Limiter configuration structures.

use duration_str::{deserialize_duration, deserialize_option_duration};
use serde::Deserialize;
use std::time::Duration;

use crate::{Window, WindowUnit};

/// The limiting algorithm and its parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlgorithmConfig {
    /// Counts requests in fixed, non-overlapping windows.
    FixedWindow {
        /// Requests allowed per window.
        limit: u64,
        /// Window length.
        window: Window,
    },
    /// Weighs the previous window into the current one.
    SlidingWindow {
        /// Requests allowed per window.
        limit: u64,
        /// Window length.
        window: Window,
    },
    /// Refills `refill_rate` tokens every `interval`, up to `max_tokens`.
    TokenBucket {
        /// Tokens added per interval.
        refill_rate: u64,
        /// Refill interval.
        interval: Window,
        /// Bucket capacity.
        max_tokens: u64,
    },
    /// Fixed window decided locally, synchronized with the store in the background.
    CachedFixedWindow {
        /// Requests allowed per window.
        limit: u64,
        /// Window length.
        window: Window,
    },
}

impl AlgorithmConfig {
    /// Name of the algorithm as written in the configuration.
    pub fn name(&self) -> &'static str {
        match self {
            AlgorithmConfig::FixedWindow { .. } => "fixed_window",
            AlgorithmConfig::SlidingWindow { .. } => "sliding_window",
            AlgorithmConfig::TokenBucket { .. } => "token_bucket",
            AlgorithmConfig::CachedFixedWindow { .. } => "cached_fixed_window",
        }
    }

    /// The number of requests a fresh identifier may make.
    pub fn limit(&self) -> u64 {
        match self {
            AlgorithmConfig::FixedWindow { limit, .. }
            | AlgorithmConfig::SlidingWindow { limit, .. }
            | AlgorithmConfig::CachedFixedWindow { limit, .. } => *limit,
            AlgorithmConfig::TokenBucket { max_tokens, .. } => *max_tokens,
        }
    }
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        Self::SlidingWindow {
            limit: 10,
            window: Window::from_parts(10, WindowUnit::Seconds),
        }
    }
}

/// Deny list protection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DenyListConfig {
    /// Whether identifiers, IPs, user agents and countries are checked against the deny list.
    pub enabled: bool,
    /// Minimum number of blocklists an IP must appear on, between 1 and 8.
    pub threshold: u8,
    /// Source of the IP deny list. `{threshold}` is replaced with the threshold.
    pub source_url: String,
    /// How long a refreshed IP list stays valid. Defaults to the next 02:00 UTC.
    #[serde(deserialize_with = "deserialize_option_duration")]
    pub refresh_ttl: Option<Duration>,
}

impl Default for DenyListConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 6,
            source_url: "https://raw.githubusercontent.com/stamparm/ipsum/master/levels/{threshold}.txt".to_string(),
            refresh_ttl: None,
        }
    }
}

/// Usage analytics.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalyticsConfig {
    /// Whether every decision is recorded.
    pub enabled: bool,
    /// How long hourly buckets are kept.
    #[serde(deserialize_with = "deserialize_duration")]
    pub retention: Duration,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            retention: Duration::from_secs(90 * 24 * 60 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_fixed_window() {
        let toml = r#"
            type = "fixed_window"
            limit = 5
            window = "10 s"
        "#;
        let config: AlgorithmConfig = toml::from_str(toml).unwrap();
        insta::assert_debug_snapshot!(config, @r"
        FixedWindow {
            limit: 5,
            window: Window {
                value: 10,
                unit: Seconds,
            },
        }
        ");
    }

    #[test]
    fn deserialize_token_bucket() {
        let toml = r#"
            type = "token_bucket"
            refill_rate = 5
            interval = "1s"
            max_tokens = 10
        "#;
        let config: AlgorithmConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.name(), "token_bucket");
        assert_eq!(config.limit(), 10);
    }

    #[test]
    fn malformed_window_is_rejected() {
        let toml = r#"
            type = "sliding_window"
            limit = 5
            window = "ten seconds"
        "#;
        let error = toml::from_str::<AlgorithmConfig>(toml).unwrap_err();
        assert!(error.to_string().contains("Unable to parse window 'ten seconds'"));
    }

    #[test]
    fn deny_list_defaults() {
        let config: DenyListConfig = toml::from_str("enabled = true").unwrap();
        insta::assert_debug_snapshot!(config, @r#"
        DenyListConfig {
            enabled: true,
            threshold: 6,
            source_url: "https://raw.githubusercontent.com/stamparm/ipsum/master/levels/{threshold}.txt",
            refresh_ttl: None,
        }
        "#);
    }

    #[test]
    fn analytics_retention() {
        let config: AnalyticsConfig = toml::from_str(r#"enabled = true
retention = "7d""#)
        .unwrap();
        assert_eq!(config.retention, Duration::from_secs(7 * 24 * 60 * 60));
    }
}
