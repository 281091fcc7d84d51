//! OpenTelemetry metrics over OTLP/gRPC.
//!
//! Nothing is exported unless an endpoint is configured; every `record_*`
//! helper is a no-op until [`init_metrics`] succeeds.

use std::collections::BTreeMap;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};

const EXPORT_INTERVAL: Duration = Duration::from_secs(30);
const EXPORT_TIMEOUT: Duration = Duration::from_secs(10);

static TELEMETRY: OnceLock<Telemetry> = OnceLock::new();

/// Programs attached per probe, observed by the `active_probes` gauge.
static ACTIVE_PROBES: Mutex<BTreeMap<String, u64>> = Mutex::new(BTreeMap::new());

struct Telemetry {
    provider: SdkMeterProvider,
    metrics: MntWatchMetrics,
}

/// Counter names carry no `_total` suffix; Prometheus appends it.
pub struct MntWatchMetrics {
    pub mount_events: Counter<u64>,
    pub umount_events: Counter<u64>,
    pub failed_mount_events: Counter<u64>,
    pub path_resolution_errors: Counter<u64>,
}

impl MntWatchMetrics {
    fn register(meter: &Meter) -> Self {
        let counter = |name: &'static str, description: &'static str, unit: &'static str| {
            meter
                .u64_counter(name)
                .with_description(description)
                .with_unit(unit)
                .build()
        };

        meter
            .u64_observable_gauge("active_probes")
            .with_description("eBPF programs currently attached")
            .with_unit("programs")
            .with_callback(|observer| {
                let Ok(probes) = ACTIVE_PROBES.lock() else {
                    return;
                };
                for (probe, programs) in probes.iter() {
                    observer.observe(*programs, &[KeyValue::new("probe", probe.clone())]);
                }
            })
            .build();

        Self {
            mount_events: counter("mount_events", "Observed mount operations", "events"),
            umount_events: counter("umount_events", "Observed umount operations", "events"),
            failed_mount_events: counter(
                "failed_mount_events",
                "Mount operations that returned an error",
                "events",
            ),
            path_resolution_errors: counter(
                "path_resolution_errors",
                "Mount paths that could not be fully rebuilt",
                "errors",
            ),
        }
    }
}

/// Normalize the configured endpoint; `None` disables export.
fn otlp_endpoint(configured: Option<&str>) -> Option<String> {
    let endpoint = configured.map(str::trim).filter(|ep| !ep.is_empty())?;
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Some(endpoint.to_string())
    } else {
        Some(format!("http://{}", endpoint))
    }
}

pub fn init_metrics(endpoint: Option<&str>) -> Result<()> {
    let Some(endpoint) = otlp_endpoint(endpoint) else {
        info!("No OTLP endpoint configured; metrics export disabled");
        return Ok(());
    };

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.clone())
        .with_timeout(EXPORT_TIMEOUT)
        .build()
        .with_context(|| format!("Failed to create OTLP exporter for {}", endpoint))?;

    let provider = SdkMeterProvider::builder()
        .with_reader(
            PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
                .with_interval(EXPORT_INTERVAL)
                .build(),
        )
        .with_resource(Resource::new([KeyValue::new("service.name", "mntwatch")]))
        .build();
    global::set_meter_provider(provider.clone());

    let metrics = MntWatchMetrics::register(&global::meter("mntwatch"));
    if TELEMETRY.set(Telemetry { provider, metrics }).is_err() {
        warn!("Metrics were already initialized");
    }

    info!("Exporting metrics to {} every {:?}", endpoint, EXPORT_INTERVAL);
    Ok(())
}

pub fn metrics() -> Option<&'static MntWatchMetrics> {
    TELEMETRY.get().map(|t| &t.metrics)
}

pub fn record_mount_event(fstype: &str, container_id: Option<&str>, retval: i64) {
    let Some(m) = metrics() else { return };
    m.mount_events.add(
        1,
        &[
            KeyValue::new("fstype", fstype.to_string()),
            KeyValue::new("container", container_id.is_some()),
        ],
    );
    if retval < 0 {
        m.failed_mount_events.add(1, &[KeyValue::new("errno", -retval)]);
    }
}

pub fn record_umount_event(container_id: Option<&str>) {
    if let Some(m) = metrics() {
        m.umount_events
            .add(1, &[KeyValue::new("container", container_id.is_some())]);
    }
}

pub fn record_path_resolution_error(which: &str) {
    if let Some(m) = metrics() {
        m.path_resolution_errors
            .add(1, &[KeyValue::new("path", which.to_string())]);
    }
}

/// Tracked even when export is disabled.
pub fn record_active_probe(probe: &str, programs: u64) {
    if let Ok(mut probes) = ACTIVE_PROBES.lock() {
        probes.insert(probe.to_string(), programs);
    }
}

/// Flush pending data points and stop the exporter.
pub fn shutdown_metrics() {
    let Some(telemetry) = TELEMETRY.get() else {
        return;
    };
    match telemetry.provider.shutdown() {
        Ok(()) => info!("Metrics flushed"),
        Err(e) => warn!("Failed to shut down metrics provider: {}", e),
    }
}
