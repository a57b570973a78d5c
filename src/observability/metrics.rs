//! Metrics collection and exposition.
//!
//! # Metrics
//! - `outlier_detection_ejections_total` (counter): ejections by algorithm
//! - `outlier_detection_unejections_total` (counter): endpoints returned to service
//! - `outlier_detection_ejected_endpoints` (gauge): currently ejected endpoints
//! - `outlier_detection_intervals_total` (counter): completed interval sweeps
//! - `outlier_detection_picker_updates_total` (counter): pickers published, by noop

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_ejection(algorithm: &'static str) {
    ::metrics::counter!("outlier_detection_ejections_total", "algorithm" => algorithm).increment(1);
}

pub fn record_unejection() {
    ::metrics::counter!("outlier_detection_unejections_total").increment(1);
}

pub fn record_ejected_endpoints(count: usize) {
    ::metrics::gauge!("outlier_detection_ejected_endpoints").set(count as f64);
}

pub fn record_interval() {
    ::metrics::counter!("outlier_detection_intervals_total").increment(1);
}

pub fn record_picker_update(noop: bool) {
    let noop = if noop { "true" } else { "false" };
    ::metrics::counter!("outlier_detection_picker_updates_total", "noop" => noop).increment(1);
}
