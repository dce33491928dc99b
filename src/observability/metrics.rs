//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define gateway metrics (queries, backend calls, cache, health)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `gateway_queries_total` (counter): queries by kind and result
//! - `gateway_query_duration_seconds` (histogram): end-to-end latency by kind
//! - `gateway_backend_calls_total` (counter): calls by group, backend, outcome
//! - `gateway_backend_call_duration_seconds` (histogram): call latency by group
//! - `gateway_backend_health` (gauge): 0=healthy 1=degraded 2=unhealthy 3=probation
//! - `gateway_cache_requests_total` (counter): hit, miss, joined
//! - `gateway_cache_entries` (gauge): entries after each sweep
//! - `gateway_resolver_refresh_failures_total` (counter)
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so tests need no setup
//! - Labels are low-cardinality: backend names come from configuration

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::health::HealthState;
use crate::query::QueryKind;
use crate::response::Outcome;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    let builder = PrometheusBuilder::new().with_http_listener(addr);

    match builder.install() {
        Ok(()) => tracing::info!(address = %addr, "Prometheus metrics exporter started"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install Prometheus recorder"),
    }
}

/// Record a finished query.
pub fn record_query(kind: QueryKind, result: &'static str, start: Instant) {
    let duration = start.elapsed().as_secs_f64();
    counter!("gateway_queries_total", "kind" => kind.as_str(), "result" => result).increment(1);
    histogram!("gateway_query_duration_seconds", "kind" => kind.as_str()).record(duration);
}

/// Record one backend call.
pub fn record_backend_call(group: &str, backend: &str, outcome: Outcome, latency: Duration) {
    counter!(
        "gateway_backend_calls_total",
        "group" => group.to_string(),
        "backend" => backend.to_string(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
    histogram!("gateway_backend_call_duration_seconds", "group" => group.to_string())
        .record(latency.as_secs_f64());
}

/// Record a backend health transition.
pub fn record_backend_health(backend: &str, state: HealthState) {
    gauge!("gateway_backend_health", "backend" => backend.to_string()).set(state as u8 as f64);
}

/// Record a cache lookup: `hit`, `miss` or `joined`.
pub fn record_cache_request(result: &'static str) {
    counter!("gateway_cache_requests_total", "result" => result).increment(1);
}

/// Record the number of cache entries.
pub fn record_cache_size(size: usize) {
    gauge!("gateway_cache_entries").set(size as f64);
}

/// Record hosts that failed to re-resolve.
pub fn record_resolver_failures(failures: usize) {
    counter!("gateway_resolver_refresh_failures_total").increment(failures as u64);
}
