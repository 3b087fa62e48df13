use anyhow::{Context, Result};
use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter},
    KeyValue,
};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{metrics::SdkMeterProvider, Resource};
use std::time::Duration;
use tracing::info;

/// Collaboration daemon metrics
pub struct CollabMetrics {
    // Operation model
    pub operations_saved: Counter<u64>,
    pub operations_canceled: Counter<u64>,

    // Socket protocol
    pub frames_rejected: Counter<u64>,

    // Hold protocol
    pub hold_requests: Counter<u64>,

    // Lifecycle
    pub evictions: Counter<u64>,
    pub connection_events: Counter<u64>,

    // Store decorator
    pub store_latency: Histogram<f64>,
    pub store_errors: Counter<u64>,
}

impl CollabMetrics {
    pub fn new(meter: &Meter) -> Self {
        let operations_saved = meter
            .u64_counter("quire.operations.saved")
            .with_description("Operations saved per channel")
            .build();

        let operations_canceled = meter
            .u64_counter("quire.operations.canceled")
            .with_description("Project operations rolled back by cancel requests")
            .build();

        let frames_rejected = meter
            .u64_counter("quire.frames.rejected")
            .with_description("Inbound socket frames dropped as malformed")
            .build();

        let hold_requests = meter
            .u64_counter("quire.holds.requests")
            .with_description("Hold requests by outcome")
            .build();

        let evictions = meter
            .u64_counter("quire.connections.evicted")
            .with_description("Connections evicted by reason")
            .build();

        let connection_events = meter
            .u64_counter("quire.connections.events")
            .with_description("Connection state transitions by event")
            .build();

        let store_latency = meter
            .f64_histogram("quire.store.latency_ms")
            .with_description("Backing store call latency in milliseconds")
            .build();

        let store_errors = meter
            .u64_counter("quire.store.errors")
            .with_description("Failed backing store calls")
            .build();

        Self {
            operations_saved,
            operations_canceled,
            frames_rejected,
            hold_requests,
            evictions,
            connection_events,
            store_latency,
            store_errors,
        }
    }

    pub fn record_operation_saved(&self, channel: &str) {
        self.operations_saved
            .add(1, &[KeyValue::new("channel", channel.to_string())]);
    }

    pub fn record_operations_canceled(&self, count: u64) {
        self.operations_canceled.add(count, &[]);
    }

    pub fn record_frame_rejected(&self, reason: &'static str) {
        self.frames_rejected
            .add(1, &[KeyValue::new("reason", reason)]);
    }

    /// `granted` is false when another user already held an element.
    pub fn record_hold_request(&self, granted: bool) {
        let outcome = if granted { "granted" } else { "contended" };
        self.hold_requests
            .add(1, &[KeyValue::new("outcome", outcome)]);
    }

    pub fn record_eviction(&self, reason: &str) {
        self.evictions
            .add(1, &[KeyValue::new("reason", reason.to_string())]);
    }

    pub fn record_connection_event(&self, event: &'static str) {
        self.connection_events
            .add(1, &[KeyValue::new("event", event)]);
    }

    pub fn record_store_call(&self, method: &'static str, duration_ms: f64, ok: bool) {
        let attrs = [KeyValue::new("method", method)];
        self.store_latency.record(duration_ms, &attrs);
        if !ok {
            self.store_errors.add(1, &attrs);
        }
    }
}

/// Initialize OTLP metric export
pub fn init_metrics(
    endpoint: Option<String>,
    service_name: &str,
) -> Result<(SdkMeterProvider, CollabMetrics)> {
    let endpoint = endpoint.unwrap_or_else(|| "http://localhost:4318".to_string());

    info!(%endpoint, "initializing OTLP metrics");

    let export_config = opentelemetry_otlp::ExportConfig {
        endpoint: Some(endpoint.clone()),
        timeout: Duration::from_secs(10),
        ..Default::default()
    };

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_export_config(export_config)
        .build()
        .context("building OTLP metric exporter")?;

    let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(
        exporter,
        opentelemetry_sdk::runtime::Tokio,
    )
    .with_interval(Duration::from_secs(30))
    .build();

    let resource = Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());

    let meter = global::meter("quire-collabd");
    let metrics = CollabMetrics::new(&meter);

    Ok((provider, metrics))
}

pub fn shutdown_metrics(provider: SdkMeterProvider) -> Result<()> {
    info!("shutting down OTLP metrics");
    provider
        .shutdown()
        .context("shutting down meter provider")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::metrics::MeterProvider;

    #[test]
    fn metrics_record_without_exporter() {
        let provider = SdkMeterProvider::builder().build();
        let meter = provider.meter("test");
        let metrics = CollabMetrics::new(&meter);

        metrics.record_operation_saved("project");
        metrics.record_operations_canceled(3);
        metrics.record_frame_rejected("malformed_json");
        metrics.record_hold_request(true);
        metrics.record_hold_request(false);
        metrics.record_eviction("disconnect_timeout");
        metrics.record_store_call("append", 0.4, true);
        metrics.record_store_call("append", 1.2, false);
    }
}
