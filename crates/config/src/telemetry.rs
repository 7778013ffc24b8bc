//! Metrics export settings.

use std::{collections::BTreeMap, time::Duration};

use duration_str::deserialize_duration;
use serde::Deserialize;
use url::Url;

/// Where and how decision metrics are exported.
///
/// ```toml
/// [telemetry]
/// service_name = "checkout-api"
///
/// [telemetry.otlp]
/// enabled = true
/// endpoint = "http://collector:4317"
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    service_name: Option<String>,
    resource_attributes: BTreeMap<String, String>,
    otlp: OtlpExporterConfig,
}

impl TelemetryConfig {
    /// Service name reported with every metric.
    pub fn service_name(&self) -> Option<&str> {
        self.service_name.as_deref()
    }

    /// Extra resource attributes reported with every metric.
    pub fn resource_attributes(&self) -> &BTreeMap<String, String> {
        &self.resource_attributes
    }

    /// The OTLP exporter, if enabled.
    pub fn metrics_otlp_config(&self) -> Option<&OtlpExporterConfig> {
        self.otlp.enabled.then_some(&self.otlp)
    }
}

/// An OTLP metrics exporter.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OtlpExporterConfig {
    /// Export only when enabled.
    pub enabled: bool,
    /// Collector endpoint.
    pub endpoint: Url,
    /// Wire protocol.
    pub protocol: OtlpProtocol,
    /// Timeout of one export.
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    /// Delay between exports.
    #[serde(deserialize_with = "deserialize_duration")]
    pub export_interval: Duration,
}

impl Default for OtlpExporterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: Url::parse("http://localhost:4317").expect("default endpoint is a valid URL"),
            protocol: OtlpProtocol::default(),
            timeout: Duration::from_secs(10),
            export_interval: Duration::from_secs(5),
        }
    }
}

/// OTLP transport.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OtlpProtocol {
    /// gRPC.
    #[default]
    Grpc,
    /// HTTP with protobuf bodies.
    Http,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exporter_is_off_by_default() {
        let config: TelemetryConfig = toml::from_str(r#"service_name = "api""#).unwrap();

        assert_eq!(config.service_name(), Some("api"));
        assert!(config.metrics_otlp_config().is_none());
    }

    #[test]
    fn http_exporter() {
        let config: TelemetryConfig = toml::from_str(
            r#"
            [resource_attributes]
            region = "eu-west-1"

            [otlp]
            enabled = true
            endpoint = "http://collector:4318"
            protocol = "http"
            export_interval = "30s"
        "#,
        )
        .unwrap();

        let otlp = config.metrics_otlp_config().unwrap();

        assert_eq!(otlp.endpoint.as_str(), "http://collector:4318/");
        assert_eq!(otlp.protocol, OtlpProtocol::Http);
        assert_eq!(otlp.export_interval, Duration::from_secs(30));
        assert_eq!(otlp.timeout, Duration::from_secs(10));
        assert_eq!(config.resource_attributes()["region"], "eu-west-1");
    }
}
