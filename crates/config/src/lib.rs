//! Rate limiter configuration structures mapping the `ratelimit.toml` file.

#![deny(missing_docs)]

mod loader;
mod rate_limit;
mod storage;
mod telemetry;
mod window;

use std::{path::Path, time::Duration};

use duration_str::deserialize_duration;
pub use rate_limit::*;
use serde::Deserialize;
pub use storage::*;
pub use telemetry::{OtlpExporterConfig, OtlpProtocol, TelemetryConfig};
pub use window::{Window, WindowError, WindowUnit};

/// Main configuration structure for the rate limiter.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Prefix of every key written to the backing store.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// How long a decision may take before the limiter fails open. Zero disables the race.
    #[serde(default = "default_timeout", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    /// Whether denied identifiers are remembered in-process until their reset.
    #[serde(default = "default_ephemeral_cache")]
    pub ephemeral_cache: bool,
    /// The limiting algorithm.
    #[serde(default)]
    pub algorithm: AlgorithmConfig,
    /// Backing store configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Deny list protection.
    #[serde(default)]
    pub deny_list: DenyListConfig,
    /// Usage analytics.
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_prefix() -> String {
    "ratelimit".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_millis(5000)
}

fn default_ephemeral_cache() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            timeout: default_timeout(),
            ephemeral_cache: default_ephemeral_cache(),
            algorithm: AlgorithmConfig::default(),
            storage: StorageConfig::default(),
            deny_list: DenyListConfig::default(),
            analytics: AnalyticsConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a file path.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> anyhow::Result<Config> {
        loader::parse(content)
    }

    /// Validates the configuration, returning warnings for suspicious but usable settings.
    pub fn validate(&self) -> anyhow::Result<Vec<String>> {
        loader::validate(self)
    }
}
