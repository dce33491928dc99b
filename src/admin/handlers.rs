use axum::{extract::State, Json};
use serde::Serialize;

use crate::cache::CacheStats;
use crate::http::server::AppState;

#[derive(Serialize)]
pub struct GroupStatus {
    pub name: String,
    pub policy: &'static str,
    pub timeout_ms: u64,
    pub max_concurrent: usize,
    pub backends: usize,
    pub eligible: usize,
}

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub cancellation: &'static str,
    pub groups: Vec<GroupStatus>,
}

#[derive(Serialize)]
pub struct BackendStatus {
    pub name: String,
    pub group: String,
    pub address: String,
    pub state: &'static str,
    pub consecutive_failures: u32,
    pub latency_ewma_ms: Option<f64>,
    pub state_age_secs: u64,
    pub probe_in_flight: bool,
    pub in_flight: usize,
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    let tracker = state.gateway.tracker();
    let groups = state
        .gateway
        .groups()
        .groups()
        .iter()
        .map(|g| GroupStatus {
            name: g.name().to_string(),
            policy: g.policy().as_str(),
            timeout_ms: g.timeout().as_millis() as u64,
            max_concurrent: g.max_concurrent(),
            backends: g.backends().len(),
            eligible: g.backends().iter().filter(|b| tracker.is_eligible(b)).count(),
        })
        .collect();

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        uptime_secs: state.started.elapsed().as_secs(),
        cancellation: state.dispatch.cancellation.as_str(),
        groups,
    })
}

pub async fn get_backends(State(state): State<AppState>) -> Json<Vec<BackendStatus>> {
    let statuses = state
        .gateway
        .groups()
        .all_backends()
        .into_iter()
        .map(|b| {
            let health = b.health().snapshot();
            BackendStatus {
                name: b.name().to_string(),
                group: b.group().to_string(),
                address: b.address().to_string(),
                state: health.state.as_str(),
                consecutive_failures: health.consecutive_failures,
                latency_ewma_ms: health.latency_ewma.map(|d| d.as_secs_f64() * 1000.0),
                state_age_secs: health.since.elapsed().as_secs(),
                probe_in_flight: health.probe_in_flight,
                in_flight: b.in_flight(),
            }
        })
        .collect();

    Json(statuses)
}

pub async fn get_cache(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.gateway.cache().stats())
}
