//! OpenTelemetry metrics for the rate limiter.
//!
//! Instruments are created from the global meter, so recording works before and
//! without [`crate::init`]. Nothing leaves the process until an OTLP exporter is
//! configured.

mod names;
mod recorder;

pub use names::*;
pub use recorder::Recorder;

use anyhow::Context;
use config::{OtlpExporterConfig, OtlpProtocol, TelemetryConfig};
use opentelemetry::{
    KeyValue,
    metrics::{Counter, Meter},
};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    Resource,
    metrics::{PeriodicReader, SdkMeterProvider},
};

const METER_NAME: &str = "ratelimit";

/// The meter every rate limiter instrument belongs to.
pub fn meter() -> Meter {
    opentelemetry::global::meter(METER_NAME)
}

/// Add one to the counter `name`.
pub fn increment(name: &'static str, attributes: &[KeyValue]) {
    let counter: Counter<u64> = meter().u64_counter(name).build();
    counter.add(1, attributes);
}

/// Install the global meter provider.
pub(crate) fn init_metrics(config: &TelemetryConfig) -> anyhow::Result<SdkMeterProvider> {
    let provider = match config.metrics_otlp_config() {
        Some(otlp) => {
            let reader = PeriodicReader::builder(exporter(otlp)?)
                .with_interval(otlp.export_interval)
                .build();

            log::info!("Exporting metrics to {} over {:?}", otlp.endpoint, otlp.protocol);

            SdkMeterProvider::builder()
                .with_resource(resource(config))
                .with_reader(reader)
                .build()
        }
        None => {
            log::debug!("No metrics exporter enabled, metrics stay in-process");
            SdkMeterProvider::builder().build()
        }
    };

    opentelemetry::global::set_meter_provider(provider.clone());

    Ok(provider)
}

fn resource(config: &TelemetryConfig) -> Resource {
    let attributes = config
        .resource_attributes()
        .iter()
        .map(|(key, value)| KeyValue::new(key.clone(), value.clone()));

    Resource::builder()
        .with_service_name(config.service_name().unwrap_or(METER_NAME).to_string())
        .with_attributes(attributes)
        .build()
}

fn exporter(otlp: &OtlpExporterConfig) -> anyhow::Result<MetricExporter> {
    let builder = MetricExporter::builder();

    let exporter = match otlp.protocol {
        OtlpProtocol::Grpc => builder
            .with_tonic()
            .with_endpoint(otlp.endpoint.as_str())
            .with_timeout(otlp.timeout)
            .build(),
        OtlpProtocol::Http => builder
            .with_http()
            .with_endpoint(otlp.endpoint.as_str())
            .with_timeout(otlp.timeout)
            .build(),
    };

    exporter.with_context(|| format!("Failed to create the {:?} OTLP metric exporter", otlp.protocol))
}
