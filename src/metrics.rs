//! Prometheus Metrics
//!
//! Process-wide counters for rescans, connector construction, and HBA
//! discovery, registered on a crate-owned registry.

use crate::error::{Error, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::LazyLock;

static METRICS: LazyLock<AttachMetrics> = LazyLock::new(AttachMetrics::new);

/// Metric handles for the attachment layer
pub struct AttachMetrics {
    registry: Registry,
    /// Scan writes issued, labelled `targeted` or `wildcard`
    pub rescan_writes: IntCounterVec,
    /// Scan writes that failed
    pub rescan_failures: IntCounter,
    /// Connector builds, labelled by protocol and result
    pub connector_builds: IntCounterVec,
    /// HBAs seen by the last discovery
    pub hbas_discovered: IntGauge,
}

impl AttachMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        // Metric names and labels are static; construction cannot fail.
        let rescan_writes = IntCounterVec::new(
            Opts::new(
                "volume_attach_scsi_rescan_writes_total",
                "SCSI host scan writes issued",
            ),
            &["mode"],
        )
        .expect("static metric definition");
        let rescan_failures = IntCounter::new(
            "volume_attach_scsi_rescan_failures_total",
            "SCSI host scan writes that failed",
        )
        .expect("static metric definition");
        let connector_builds = IntCounterVec::new(
            Opts::new(
                "volume_attach_connector_builds_total",
                "Connector factory invocations",
            ),
            &["protocol", "result"],
        )
        .expect("static metric definition");
        let hbas_discovered = IntGauge::new(
            "volume_attach_hbas_discovered",
            "Fibre Channel HBAs found by the last discovery",
        )
        .expect("static metric definition");

        for collector in [
            Box::new(rescan_writes.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(rescan_failures.clone()),
            Box::new(connector_builds.clone()),
            Box::new(hbas_discovered.clone()),
        ] {
            registry
                .register(collector)
                .expect("metric registered once on a fresh registry");
        }

        Self {
            registry,
            rescan_writes,
            rescan_failures,
            connector_builds,
            hbas_discovered,
        }
    }
}

/// Access the process-wide metrics
pub fn metrics() -> &'static AttachMetrics {
    &METRICS
}

pub fn record_rescan_write(wildcard: bool) {
    let mode = if wildcard { "wildcard" } else { "targeted" };
    METRICS.rescan_writes.with_label_values(&[mode]).inc();
}

pub fn record_rescan_failure() {
    METRICS.rescan_failures.inc();
}

pub fn record_connector_build(protocol: &str, ok: bool) {
    let result = if ok { "ok" } else { "error" };
    METRICS
        .connector_builds
        .with_label_values(&[protocol, result])
        .inc();
}

pub fn set_hbas_discovered(count: usize) {
    METRICS.hbas_discovered.set(count as i64);
}

/// Render all metrics in the text exposition format
pub fn gather_text() -> Result<String> {
    let encoder = TextEncoder::new();
    let families = METRICS.registry.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&families, &mut buffer)
        .map_err(|e| Error::Internal(format!("metrics encoding failed: {}", e)))?;
    String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics not UTF-8: {}", e)))
}
