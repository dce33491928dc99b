//! Debug and status endpoints.
//!
//! Read-only views of gateway state: configuration summary, per-backend health,
//! cache occupancy. Mounted on the query listeners or on a dedicated listener.

pub mod handlers;

use axum::{routing::get, Router};

use crate::http::server::AppState;
use self::handlers::*;

pub fn debug_router() -> Router<AppState> {
    Router::new()
        .route("/debug/status", get(get_status))
        .route("/debug/backends", get(get_backends))
        .route("/debug/cache", get(get_cache))
}
