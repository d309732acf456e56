//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define server metrics (calls, latency, streams, connections, resets)
//! - Expose a Prometheus-compatible scrape endpoint
//!
//! # Metrics
//! - `rpc_calls_total` (counter): completed calls by service, method, code
//! - `rpc_call_duration_seconds` (histogram): call latency
//! - `rpc_streams_rejected_total` (counter): streams refused at admission
//! - `rpc_handler_panics_total` (counter): panics caught per service
//! - `rpc_active_connections` (gauge): current connection count
//! - `rpc_reset_epoch` (gauge): epoch of the live routing table
//! - `rpc_resets_total` (counter): resets by result
//! - `rpc_health_status` (gauge): 1=serving, 0=not serving, -1=unknown
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - Labels are low-cardinality: route names and status codes only

use std::net::SocketAddr;
use std::time::Instant;

use metrics::Label;
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::health::ServingStatus;
use crate::rpc::Code;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_call(service: &str, method: &str, code: Code, started: Instant) {
    let labels = vec![
        Label::new("service", service.to_string()),
        Label::new("method", method.to_string()),
        Label::new("code", code.as_str()),
    ];
    metrics::counter!("rpc_calls_total", labels.clone()).increment(1);
    metrics::histogram!("rpc_call_duration_seconds", labels).record(started.elapsed().as_secs_f64());
}

pub fn record_stream_rejected() {
    metrics::counter!("rpc_streams_rejected_total").increment(1);
}

pub fn record_handler_panic(service: &str) {
    metrics::counter!("rpc_handler_panics_total", "service" => service.to_string()).increment(1);
}

pub fn set_active_connections(count: u64) {
    metrics::gauge!("rpc_active_connections").set(count as f64);
}

pub fn record_reset(epoch: Option<u64>) {
    match epoch {
        Some(epoch) => {
            metrics::counter!("rpc_resets_total", "result" => "ok").increment(1);
            metrics::gauge!("rpc_reset_epoch").set(epoch as f64);
        }
        None => metrics::counter!("rpc_resets_total", "result" => "error").increment(1),
    }
}

pub fn record_health_status(service: &str, status: ServingStatus) {
    let value = match status {
        ServingStatus::Serving => 1.0,
        ServingStatus::NotServing => 0.0,
        ServingStatus::Unknown => -1.0,
    };
    metrics::gauge!("rpc_health_status", "service" => service.to_string()).set(value);
}
